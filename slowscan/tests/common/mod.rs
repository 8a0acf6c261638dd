//! Audio synthesis for decoder tests: headers and scanlines rendered the
//! way a transmitter would send them, with continuous phase across tone
//! changes.
#![allow(dead_code)]

use rand::{
    rngs::StdRng,
    Rng,
    SeedableRng,
};
use slowscan::{
    modes::{
        ModeSpec,
        SyncPosition,
    },
    BIT_ONE_TONE,
    BIT_TIME,
    BIT_ZERO_TONE,
    BLACK_TONE,
    BREAK_TIME,
    FRAME_TONE,
    LEAD_TIME,
    LEAD_TONE,
    PORCH_TONE,
    WHITE_TONE,
};

pub const RATE: f32 = 48000.0;

/// Tone generator anchored to absolute time, so per-segment rounding never
/// accumulates into drift.
pub struct ToneGen {
    sample_rate: f64,
    amplitude: f64,
    /// Transmitter clock scale; below 1.0 the sender runs fast.
    time_scale: f64,
    phase: f64,
    elapsed: f64,
    samples: Vec<f32>,
}

impl ToneGen {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            sample_rate: f64::from(sample_rate),
            amplitude: 0.7,
            time_scale: 1.0,
            phase: 0.0,
            elapsed: 0.0,
            samples: Vec::new(),
        }
    }

    pub fn set_time_scale(&mut self, scale: f32) {
        self.time_scale = f64::from(scale);
    }

    pub fn push(&mut self, frequency: f32, seconds: f32) {
        self.elapsed += f64::from(seconds) * self.time_scale;
        let target = (self.elapsed * self.sample_rate).round() as usize;
        let step = std::f64::consts::TAU * f64::from(frequency) / self.sample_rate;
        while self.samples.len() < target {
            self.phase = (self.phase + step) % std::f64::consts::TAU;
            self.samples.push((self.amplitude * self.phase.sin()) as f32);
        }
    }

    pub fn silence(&mut self, seconds: f32) {
        self.elapsed += f64::from(seconds) * self.time_scale;
        let target = (self.elapsed * self.sample_rate).round() as usize;
        self.samples.resize(target, 0.0);
    }

    pub fn finish(self) -> Vec<f32> {
        self.samples
    }
}

/// Video tone for a luminance value.
pub fn pixel_tone(value: u8) -> f32 {
    BLACK_TONE + f32::from(value) / 255.0 * (WHITE_TONE - BLACK_TONE)
}

/// Parity bit that makes the ones count of code plus parity even.
pub fn parity_for(code: u8) -> bool {
    code.count_ones() % 2 == 1
}

pub fn push_header(synth: &mut ToneGen, code: u8) {
    push_header_raw(synth, code, parity_for(code));
}

/// Header with an explicit parity bit, for corruption tests.
pub fn push_header_raw(synth: &mut ToneGen, code: u8, parity_bit: bool) {
    synth.push(LEAD_TONE, LEAD_TIME);
    push_header_after_first_lead(synth, code, parity_bit);
}

/// Everything from the break tone on: second leader, start bit, data bits
/// least significant first, parity, stop.
pub fn push_header_after_first_lead(synth: &mut ToneGen, code: u8, parity_bit: bool) {
    synth.push(FRAME_TONE, BREAK_TIME);
    synth.push(LEAD_TONE, LEAD_TIME);
    synth.push(FRAME_TONE, BIT_TIME);
    for bit in 0..8 {
        synth.push(bit_tone(code >> bit & 1 == 1), BIT_TIME);
    }
    synth.push(bit_tone(parity_bit), BIT_TIME);
    synth.push(FRAME_TONE, BIT_TIME);
}

fn bit_tone(set: bool) -> f32 {
    if set {
        BIT_ONE_TONE
    }
    else {
        BIT_ZERO_TONE
    }
}

pub fn push_pixels(synth: &mut ToneGen, row: &[u8], channel_time: f32) {
    let pixel_time = channel_time / row.len() as f32;
    for &value in row {
        synth.push(pixel_tone(value), pixel_time);
    }
}

/// One scanline in the mode's timing grammar, one row per channel.
pub fn push_line(synth: &mut ToneGen, mode: &ModeSpec, rows: &[Vec<u8>]) {
    assert_eq!(rows.len(), mode.channels.len());
    match mode.sync_position {
        SyncPosition::LineStart => {
            synth.push(FRAME_TONE, mode.sync_pulse_time);
            synth.push(PORCH_TONE, mode.porch_time);
            for (index, channel) in mode.channels.iter().enumerate() {
                push_pixels(synth, &rows[index], channel.time);
                if index < mode.separator_slots {
                    synth.push(PORCH_TONE, mode.separator_time);
                }
            }
        }
        SyncPosition::BeforeFinal => {
            synth.push(PORCH_TONE, mode.separator_time);
            push_pixels(synth, &rows[0], mode.channels[0].time);
            synth.push(PORCH_TONE, mode.separator_time);
            push_pixels(synth, &rows[1], mode.channels[1].time);
            synth.push(FRAME_TONE, mode.sync_pulse_time);
            synth.push(PORCH_TONE, mode.porch_time);
            push_pixels(synth, &rows[2], mode.channels[2].time);
        }
    }
}

/// A whole image transmission. `row_for(line, channel)` supplies the pixel
/// row each channel carries on each audio line.
pub fn push_transmission<F>(synth: &mut ToneGen, mode: &ModeSpec, mut row_for: F)
where
    F: FnMut(usize, usize) -> Vec<u8>,
{
    if mode.sync_position == SyncPosition::BeforeFinal {
        // modes that sync mid-line open the transmission with one pulse
        synth.push(FRAME_TONE, mode.sync_pulse_time);
    }
    for line in 0..mode.audio_lines() {
        let rows: Vec<Vec<u8>> = (0..mode.channels.len())
            .map(|channel| row_for(line, channel))
            .collect();
        push_line(synth, mode, &rows);
    }
}

/// Seeded uniform noise, amplitude well above the silence floor.
pub fn noise(sample_rate: f32, seconds: f32, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let count = (seconds * sample_rate).round() as usize;
    (0..count).map(|_| rng.gen_range(-0.3..0.3)).collect()
}
