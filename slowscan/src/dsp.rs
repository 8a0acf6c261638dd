//! Tone measurement and frequency demodulation primitives.

use std::f32::consts::TAU;

use num_complex::Complex;
use rustfft::FftPlanner;

use crate::{
    BLACK_TONE,
    WHITE_TONE,
};

/// Number of samples covering `seconds` at `sample_rate`, rounded to
/// nearest.
#[inline]
pub fn samples_for_duration(seconds: f32, sample_rate: f32) -> usize {
    (seconds * sample_rate).round().max(0.0) as usize
}

/// Scales a signed 16 bit PCM sample into `[-1.0, 1.0)`.
#[inline]
pub fn normalize_i16(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

/// Goertzel energy of `samples` at `target_hz`.
///
/// The detector runs this over short windows, so the oscillator is tuned to
/// the exact target frequency rather than the nearest DFT bin. The returned
/// power is `s1² + s2² - c·s1·s2`, which is non-negative for any input.
pub fn goertzel_energy(samples: &[f32], target_hz: f32, sample_rate: f32) -> f32 {
    let omega = TAU * target_hz / sample_rate;
    let coefficient = 2.0 * omega.cos();

    let mut s1 = 0.0f32;
    let mut s2 = 0.0f32;
    for &sample in samples {
        let s0 = sample + coefficient * s1 - s2;
        s2 = s1;
        s1 = s0;
    }

    (s1 * s1 + s2 * s2 - coefficient * s1 * s2).max(0.0)
}

/// Step between candidate frequencies in [`estimate_frequency`].
pub const FREQ_SCAN_STEP: f32 = 10.0;

/// Frequency of the strongest tone in `[low_hz, high_hz]`, found by
/// scanning Goertzel energies in [`FREQ_SCAN_STEP`] increments.
///
/// Returns `0.0` for empty input.
pub fn estimate_frequency(samples: &[f32], low_hz: f32, high_hz: f32, sample_rate: f32) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let mut best_hz = low_hz;
    let mut best_energy = f32::MIN;
    let mut hz = low_hz;
    while hz <= high_hz {
        let energy = goertzel_energy(samples, hz, sample_rate);
        if energy > best_energy {
            best_energy = energy;
            best_hz = hz;
        }
        hz += FREQ_SCAN_STEP;
    }

    best_hz
}

/// Maps an instantaneous frequency onto the 8 bit luminance scale.
///
/// [`BLACK_TONE`] maps to 0 and [`WHITE_TONE`] to 255, linearly in between
/// and clamped outside.
#[inline]
pub fn freq_to_pixel(hz: f32) -> u8 {
    let value = (hz - BLACK_TONE) / (WHITE_TONE - BLACK_TONE) * 255.0;
    value.round().clamp(0.0, 255.0) as u8
}

/// Per-sample frequency demodulator for scanline spans.
///
/// Builds the analytic signal of a real span with an FFT (negative
/// frequencies zeroed, positive doubled, DC and Nyquist kept), then reads
/// the instantaneous frequency off the phase difference of consecutive
/// analytic samples.
#[derive(derive_more::Debug)]
pub struct AnalyticFm {
    #[debug(skip)]
    planner: FftPlanner<f32>,
    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl AnalyticFm {
    pub fn new() -> Self {
        Self {
            planner: FftPlanner::new(),
            spectrum: Vec::new(),
            scratch: Vec::new(),
        }
    }

    /// Instantaneous frequency in Hz for every sample of `samples`.
    ///
    /// The first output has no predecessor to difference against and
    /// repeats the second. Spans shorter than 2 samples demodulate to 0 Hz.
    pub fn instantaneous_frequency(&mut self, samples: &[f32], sample_rate: f32) -> Vec<f32> {
        let n = samples.len();
        if n < 2 {
            return vec![0.0; n];
        }

        self.spectrum.clear();
        self.spectrum
            .extend(samples.iter().map(|&sample| Complex::new(sample, 0.0)));

        let forward = self.planner.plan_fft_forward(n);
        self.scratch
            .resize(forward.get_inplace_scratch_len(), Complex::ZERO);
        forward.process_with_scratch(&mut self.spectrum, &mut self.scratch);

        // analytic signal: drop negative frequencies, double the positive
        // ones. For even n, bin n/2 is the Nyquist bin and stays untouched
        // like DC.
        let positive_end = n.div_ceil(2);
        for bin in &mut self.spectrum[1..positive_end] {
            *bin = *bin * 2.0;
        }
        let negative_start = if n % 2 == 0 { n / 2 + 1 } else { positive_end };
        for bin in &mut self.spectrum[negative_start..] {
            *bin = Complex::ZERO;
        }

        let inverse = self.planner.plan_fft_inverse(n);
        self.scratch
            .resize(inverse.get_inplace_scratch_len(), Complex::ZERO);
        inverse.process_with_scratch(&mut self.spectrum, &mut self.scratch);

        // the inverse transform's 1/n scale cancels in the phase difference
        let mut frequencies = Vec::with_capacity(n);
        frequencies.push(0.0);
        for pair in self.spectrum.windows(2) {
            let phase_delta = (pair[0].conj() * pair[1]).arg();
            frequencies.push(phase_delta * sample_rate / TAU);
        }
        frequencies[0] = frequencies[1];

        frequencies
    }
}

impl Default for AnalyticFm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::f32::consts::TAU;

    use approx::assert_abs_diff_eq;

    use super::{
        estimate_frequency,
        freq_to_pixel,
        goertzel_energy,
        samples_for_duration,
        AnalyticFm,
    };

    fn tone(frequency: f32, sample_rate: f32, count: usize) -> Vec<f32> {
        (0..count)
            .map(|i| (TAU * frequency * i as f32 / sample_rate).sin())
            .collect()
    }

    #[test]
    fn goertzel_separates_neighboring_tones() {
        let sample_rate = 48000.0;
        let window = tone(1200.0, sample_rate, 480);
        let on_target = goertzel_energy(&window, 1200.0, sample_rate);
        let off_target = goertzel_energy(&window, 1500.0, sample_rate);
        assert!(on_target > 5.0 * off_target);
    }

    #[test]
    fn goertzel_energy_is_non_negative() {
        let sample_rate = 48000.0;
        for frequency in [1100.0, 1300.0, 1900.0, 2300.0] {
            let window = tone(frequency, sample_rate, 480);
            for target in [1100.0f32, 1200.0, 1300.0, 1500.0, 1900.0, 2300.0] {
                assert!(goertzel_energy(&window, target, sample_rate) >= 0.0);
            }
        }
        assert_eq!(goertzel_energy(&[], 1200.0, sample_rate), 0.0);
    }

    #[test]
    fn frequency_estimate_hits_the_scan_grid() {
        let sample_rate = 48000.0;
        let window = tone(1742.0, sample_rate, 2400);
        let estimate = estimate_frequency(&window, 1000.0, 2400.0, sample_rate);
        assert_abs_diff_eq!(estimate, 1742.0, epsilon = 10.0);
        assert_eq!(estimate_frequency(&[], 1000.0, 2400.0, sample_rate), 0.0);
    }

    #[test]
    fn pixel_mapping_is_anchored_and_monotonic() {
        assert_eq!(freq_to_pixel(1500.0), 0);
        assert_eq!(freq_to_pixel(2300.0), 255);
        assert_eq!(freq_to_pixel(1900.0), 128);
        assert_eq!(freq_to_pixel(1000.0), 0);
        assert_eq!(freq_to_pixel(3000.0), 255);

        let mut previous = 0;
        let mut hz = 1500.0;
        while hz <= 2300.0 {
            let pixel = freq_to_pixel(hz);
            assert!(pixel >= previous);
            previous = pixel;
            hz += 25.0;
        }
    }

    #[test]
    fn analytic_demodulation_recovers_a_constant_tone() {
        let sample_rate = 48000.0;
        // 190 whole cycles, so the span is leakage free
        let span = tone(1900.0, sample_rate, 4800);
        let mut demodulator = AnalyticFm::new();
        let frequencies = demodulator.instantaneous_frequency(&span, sample_rate);
        assert_eq!(frequencies.len(), span.len());
        for &frequency in &frequencies {
            assert_abs_diff_eq!(frequency, 1900.0, epsilon = 1.0);
        }
    }

    #[test]
    fn tiny_spans_demodulate_to_zero() {
        let mut demodulator = AnalyticFm::new();
        assert_eq!(demodulator.instantaneous_frequency(&[], 48000.0), vec![]);
        assert_eq!(
            demodulator.instantaneous_frequency(&[0.5], 48000.0),
            vec![0.0]
        );
    }

    #[test]
    fn duration_conversion_rounds_to_nearest() {
        assert_eq!(samples_for_duration(0.010, 48000.0), 480);
        assert_eq!(samples_for_duration(0.004862, 48000.0), 233);
        assert_eq!(samples_for_duration(0.0, 48000.0), 0);
    }
}
