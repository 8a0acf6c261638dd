//! Calibration header framing and decoding.
//!
//! The header is an analog preamble: a long 1900 Hz lead tone, a 10 ms
//! 1200 Hz break, the lead tone again, then a serial code word at 30 ms per
//! bit. A start bit (1200 Hz) is followed by 8 data bits sent LSB first
//! (1100 Hz for one, 1300 Hz for zero), an even parity bit and a 1200 Hz
//! stop bit.
//!
//! Detection never aligns to anything; it walks the stream in fixed
//! windows, classifies each window by dominant tone energy and tracks the
//! header grammar as a state machine. Bit values are decided over whole
//! accumulated bit spans, so a window straddling a bit edge does not flip
//! the decision.

use crate::{
    buffer::SampleBuffer,
    dsp::{
        goertzel_energy,
        samples_for_duration,
    },
    modes::{
        self,
        ModeSpec,
    },
    BIT_ONE_TONE,
    BIT_TIME,
    BIT_ZERO_TONE,
    FRAME_TONE,
    LEAD_TIME,
    LEAD_TONE,
};

/// Tunables for [`HeaderDetector`].
#[derive(Clone, Copy, Debug)]
pub struct DetectorConfig {
    /// Classification window length in seconds.
    pub window_time: f32,
    /// Factor by which the strongest tone energy must exceed the runner-up
    /// for a window to classify.
    pub dominance: f32,
    /// Ambiguous windows tolerated mid-element before the detector resets.
    pub max_misses: usize,
    /// Minimum lead tone run that qualifies as the header opening.
    pub min_lead_time: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_time: 0.010,
            dominance: 2.0,
            max_misses: 3,
            min_lead_time: 0.100,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Tone {
    Lead,
    Frame,
    BitOne,
    BitZero,
    Ambiguous,
}

#[derive(Clone, Copy, Debug)]
struct Energies {
    lead: f32,
    frame: f32,
    one: f32,
    zero: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Idle,
    Lead1,
    Break,
    Lead2,
    StartBit,
    DataBits,
    ParityBit,
    StopBit,
    Detected,
}

/// Frame windows tolerated for the 10 ms break before the detector gives
/// up on a run.
const BREAK_WINDOW_LIMIT: usize = 10;

/// Lead runs longer than this multiple of the nominal lead time are
/// treated as a spurious carrier.
const LEAD_OVERRUN_FACTOR: f32 = 3.0;

/// Finds and decodes calibration headers in a sample stream.
///
/// Feed arbitrary chunks with [`feed`](Self::feed); once it returns a mode
/// the samples after the stop bit are waiting in
/// [`take_remaining`](Self::take_remaining).
#[derive(Clone, Debug)]
pub struct HeaderDetector {
    sample_rate: f32,
    config: DetectorConfig,
    window_samples: usize,
    bit_windows: usize,
    min_lead_windows: usize,
    max_lead_windows: usize,
    buffer: SampleBuffer,
    window: Vec<f32>,
    state: State,
    run: usize,
    misses: usize,
    code: u8,
    bit_index: u8,
    parity_bit: bool,
    span: Vec<f32>,
    span_windows: usize,
}

impl HeaderDetector {
    pub fn new(sample_rate: f32) -> Self {
        Self::with_config(sample_rate, DetectorConfig::default())
    }

    pub fn with_config(sample_rate: f32, config: DetectorConfig) -> Self {
        let window_samples = samples_for_duration(config.window_time, sample_rate).max(1);
        let bit_windows = (BIT_TIME / config.window_time).round().max(1.0) as usize;
        let min_lead_windows = (config.min_lead_time / config.window_time).round().max(1.0) as usize;
        let max_lead_windows =
            (LEAD_OVERRUN_FACTOR * LEAD_TIME / config.window_time).round() as usize;

        Self {
            sample_rate,
            config,
            window_samples,
            bit_windows,
            min_lead_windows,
            max_lead_windows,
            buffer: SampleBuffer::new(),
            window: Vec::with_capacity(window_samples),
            state: State::Idle,
            run: 0,
            misses: 0,
            code: 0,
            bit_index: 0,
            parity_bit: false,
            span: Vec::new(),
            span_windows: 0,
        }
    }

    /// Whether the detector is partway through a header.
    #[inline]
    pub fn is_framing(&self) -> bool {
        !matches!(self.state, State::Idle | State::Detected)
    }

    /// Pushes samples and scans any windows they complete. Returns the
    /// detected mode the moment a header validates.
    ///
    /// After a detection the detector goes inert (samples keep buffering
    /// but nothing is scanned) until [`reset`](Self::reset).
    pub fn feed(&mut self, samples: &[f32]) -> Option<&'static ModeSpec> {
        self.buffer.push(samples);

        while self.state != State::Detected && self.buffer.available() >= self.window_samples {
            self.window.clear();
            self.window
                .extend_from_slice(&self.buffer.samples()[..self.window_samples]);
            self.buffer.consume(self.window_samples);

            if let Some(mode) = self.scan_window() {
                return Some(mode);
            }
        }

        None
    }

    /// Samples that arrived after the last fully scanned window. Call this
    /// after a detection to hand the image audio to the scanline decoder.
    pub fn take_remaining(&mut self) -> Vec<f32> {
        self.buffer.take_remaining()
    }

    /// Returns to idle and discards all buffered audio.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.to_idle();
    }

    fn scan_window(&mut self) -> Option<&'static ModeSpec> {
        let (tone, energies) = self.classify();

        match self.state {
            State::Idle => {
                match tone {
                    Tone::Lead => {
                        self.run += 1;
                        self.misses = 0;
                        if self.run >= self.min_lead_windows {
                            tracing::debug!(windows = self.run, "lead tone qualified");
                            self.state = State::Lead1;
                        }
                    }
                    Tone::Ambiguous if self.run > 0 => self.miss(),
                    _ => self.to_idle(),
                }
            }
            State::Lead1 | State::Lead2 => {
                match tone {
                    Tone::Lead => {
                        self.run += 1;
                        if self.run > self.max_lead_windows {
                            tracing::debug!(windows = self.run, "lead tone overrun, resetting");
                            self.to_idle();
                        }
                    }
                    Tone::Frame => self.leave_lead(),
                    // a window straddling the lead/break edge shows both
                    // tones; let it through if the frame tone holds up
                    Tone::Ambiguous if energies.frame > 0.5 * energies.lead => self.leave_lead(),
                    Tone::Ambiguous => self.miss(),
                    _ => self.to_idle(),
                }
            }
            State::Break => {
                match tone {
                    Tone::Frame => {
                        self.run += 1;
                        if self.run > BREAK_WINDOW_LIMIT {
                            tracing::debug!("break ran past its budget, resetting");
                            self.to_idle();
                        }
                    }
                    Tone::Lead => {
                        self.state = State::Lead2;
                        self.run = 1;
                        self.misses = 0;
                    }
                    Tone::Ambiguous => self.miss(),
                    _ => self.to_idle(),
                }
            }
            State::StartBit => {
                match tone {
                    Tone::Frame => {
                        self.run += 1;
                        self.misses = 0;
                        self.maybe_finish_start_bit();
                    }
                    Tone::Ambiguous => {
                        self.miss();
                        if self.state == State::StartBit {
                            self.run += 1;
                            self.maybe_finish_start_bit();
                        }
                    }
                    _ => {
                        if self.run + 1 >= self.bit_windows {
                            // the window straddles the start-bit edge and
                            // already belongs to the first data bit
                            self.begin_bits();
                            self.push_bit_window();
                        }
                        else {
                            self.to_idle();
                        }
                    }
                }
            }
            State::DataBits | State::ParityBit => self.push_bit_window(),
            State::StopBit => {
                match tone {
                    Tone::Frame => {
                        self.run += 1;
                        self.misses = 0;
                    }
                    _ => {
                        self.miss();
                        if self.state == State::StopBit {
                            self.run += 1;
                        }
                    }
                }
                if self.state == State::StopBit && self.run >= self.bit_windows {
                    return self.validate();
                }
            }
            State::Detected => {}
        }

        None
    }

    fn classify(&self) -> (Tone, Energies) {
        let energies = Energies {
            lead: goertzel_energy(&self.window, LEAD_TONE, self.sample_rate),
            frame: goertzel_energy(&self.window, FRAME_TONE, self.sample_rate),
            one: goertzel_energy(&self.window, BIT_ONE_TONE, self.sample_rate),
            zero: goertzel_energy(&self.window, BIT_ZERO_TONE, self.sample_rate),
        };

        let ranked = [
            (energies.lead, Tone::Lead),
            (energies.frame, Tone::Frame),
            (energies.one, Tone::BitOne),
            (energies.zero, Tone::BitZero),
        ];
        let mut strongest = ranked[0];
        let mut runner_up = 0.0f32;
        for &(energy, tone) in &ranked[1..] {
            if energy > strongest.0 {
                runner_up = strongest.0;
                strongest = (energy, tone);
            }
            else if energy > runner_up {
                runner_up = energy;
            }
        }

        let tone = if strongest.0 > 0.0 && strongest.0 >= self.config.dominance * runner_up {
            strongest.1
        }
        else {
            Tone::Ambiguous
        };

        (tone, energies)
    }

    fn leave_lead(&mut self) {
        let next = match self.state {
            State::Lead1 => State::Break,
            _ => State::StartBit,
        };
        tracing::trace!(from = ?self.state, to = ?next, lead_windows = self.run, "lead ended");
        self.state = next;
        self.run = 1;
        self.misses = 0;
        if next == State::StartBit {
            self.maybe_finish_start_bit();
        }
    }

    fn maybe_finish_start_bit(&mut self) {
        if self.run >= self.bit_windows {
            self.begin_bits();
        }
    }

    fn begin_bits(&mut self) {
        tracing::trace!("start bit complete, reading code word");
        self.state = State::DataBits;
        self.code = 0;
        self.bit_index = 0;
        self.span.clear();
        self.span_windows = 0;
        self.run = 0;
        self.misses = 0;
    }

    fn push_bit_window(&mut self) {
        self.span.extend_from_slice(&self.window);
        self.span_windows += 1;
        if self.span_windows < self.bit_windows {
            return;
        }

        let one = goertzel_energy(&self.span, BIT_ONE_TONE, self.sample_rate);
        let zero = goertzel_energy(&self.span, BIT_ZERO_TONE, self.sample_rate);
        let bit = one > zero;
        self.span.clear();
        self.span_windows = 0;

        match self.state {
            State::DataBits => {
                tracing::trace!(index = self.bit_index, bit, "data bit");
                if bit {
                    self.code |= 1 << self.bit_index;
                }
                self.bit_index += 1;
                if self.bit_index == 8 {
                    self.state = State::ParityBit;
                }
            }
            State::ParityBit => {
                tracing::trace!(bit, "parity bit");
                self.parity_bit = bit;
                self.state = State::StopBit;
                self.run = 0;
                self.misses = 0;
            }
            _ => {}
        }
    }

    fn validate(&mut self) -> Option<&'static ModeSpec> {
        match validate_code(self.code, self.parity_bit) {
            Some(mode) => {
                tracing::info!(code = self.code, mode = mode.name, "header detected");
                self.state = State::Detected;
                Some(mode)
            }
            None => {
                tracing::debug!(
                    code = self.code,
                    parity_bit = self.parity_bit,
                    "header failed validation"
                );
                self.to_idle();
                None
            }
        }
    }

    fn miss(&mut self) {
        self.misses += 1;
        if self.misses > self.config.max_misses {
            tracing::trace!(state = ?self.state, "too many ambiguous windows, resetting");
            self.to_idle();
        }
    }

    fn to_idle(&mut self) {
        self.state = State::Idle;
        self.run = 0;
        self.misses = 0;
        self.code = 0;
        self.bit_index = 0;
        self.parity_bit = false;
        self.span.clear();
        self.span_windows = 0;
    }
}

/// Validates a decoded code word against its parity bit and the mode
/// registry, correcting at most one corrupted bit.
///
/// Order of attempts: the code as received; each single data bit flipped
/// (ascending bit order) where the flip restores even parity; finally the
/// code as received with the error attributed to the parity bit itself.
/// Unknown codes are rejected rather than guessed at.
pub fn validate_code(code: u8, parity_bit: bool) -> Option<&'static ModeSpec> {
    if parity_is_even(code, parity_bit) {
        if let Some(mode) = modes::by_vis_code(code) {
            return Some(mode);
        }
    }

    for bit in 0..8 {
        let flipped = code ^ (1 << bit);
        if parity_is_even(flipped, parity_bit) {
            if let Some(mode) = modes::by_vis_code(flipped) {
                tracing::debug!(code, corrected = flipped, bit, "corrected single bit error");
                return Some(mode);
            }
        }
    }

    modes::by_vis_code(code)
}

#[inline]
fn parity_is_even(code: u8, parity_bit: bool) -> bool {
    (code.count_ones() + u32::from(parity_bit)) % 2 == 0
}
