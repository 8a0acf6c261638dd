//! Scanline decoding: from image audio to channel planes to pixels.
//!
//! The decoder owns a sample backlog and commits one whole scanline at a
//! time, never a partial line. Each line re-acquires the sync pulse inside
//! a bounded search window around its nominal position, so small clock
//! drift between sender and receiver cannot accumulate into skew.

use image::{
    Rgb,
    RgbImage,
};

use crate::{
    buffer::SampleBuffer,
    dsp::{
        freq_to_pixel,
        goertzel_energy,
        samples_for_duration,
        AnalyticFm,
    },
    modes::{
        ChannelKind,
        ColorFormat,
        ModeSpec,
        SyncPosition,
    },
    BLACK_TONE,
    FRAME_TONE,
};

/// Fraction of the line time searched on either side of a sync pulse's
/// nominal position.
pub const SYNC_SEARCH_SPAN: f32 = 0.10;

/// Step of the refinement pass that follows the coarse sync search, in
/// samples.
const SYNC_REFINE_STEP: usize = 8;

/// First null of the scanline smoothing window. Sits between the tone
/// sums of neighboring SSTV frequency pairs, where the discriminator's
/// residual oscillation lives.
const TRACK_SMOOTHING_NULL_HZ: f32 = 3200.0;

/// Resolved channel plane indices for pixel assembly.
#[derive(Clone, Copy, Debug)]
enum Assembly {
    Rgb {
        red: usize,
        green: usize,
        blue: usize,
    },
    YCrCb {
        luma: usize,
        chroma_r: usize,
        chroma_b: usize,
    },
    YCrCbHalf {
        luma: usize,
        chroma: usize,
    },
    YCrCbDual {
        luma: usize,
        luma_odd: usize,
        chroma_r: usize,
        chroma_b: usize,
    },
}

/// Reconstructs one image from the audio following a detected header.
///
/// Feed samples with [`feed`](Self::feed) until it reports completion,
/// then [`assemble`](Self::assemble) the pixels. [`assemble`] also works
/// mid-decode for previews; rows not yet decoded come out black.
#[derive(derive_more::Debug)]
pub struct ImageDecoder {
    mode: &'static ModeSpec,
    sample_rate: f32,
    #[debug(skip)]
    buffer: SampleBuffer,
    #[debug(skip)]
    demodulator: AnalyticFm,
    /// One plane per mode channel, `width` bytes per audio line.
    #[debug(skip)]
    channels: Vec<Vec<u8>>,
    assembly: Assembly,
    line: usize,
    total_lines: usize,
    line_samples: usize,
    sync_samples: usize,
    porch_samples: usize,
    separator_samples: usize,
    channel_samples: Vec<usize>,
    /// Sync search reach either side of nominal, in samples.
    margin: usize,
    /// Sync search step, in samples.
    step: usize,
    /// Start-of-transmission pulse still to skip, for modes that sync
    /// before the final channel.
    pending_skip: usize,
}

impl ImageDecoder {
    /// # Panics
    ///
    /// Panics if `mode` is not well formed. Specs from the
    /// [`modes`](crate::modes) registry always are.
    pub fn new(mode: &'static ModeSpec, sample_rate: f32) -> Self {
        assert!(mode.is_well_formed(), "malformed mode spec: {}", mode.name);

        let total_lines = mode.audio_lines();
        let sync_samples = samples_for_duration(mode.sync_pulse_time, sample_rate).max(1);
        let channel_samples = mode
            .channels
            .iter()
            .map(|channel| samples_for_duration(channel.time, sample_rate))
            .collect();
        let pending_skip = match mode.sync_position {
            SyncPosition::LineStart => 0,
            SyncPosition::BeforeFinal => sync_samples,
        };

        // chroma planes rest at the neutral 128 so undecoded rows assemble
        // to black rather than tinted
        let channels = mode
            .channels
            .iter()
            .map(|channel| {
                let fill = match channel.kind {
                    ChannelKind::ChromaR | ChannelKind::ChromaB | ChannelKind::ChromaAlt => 128,
                    _ => 0,
                };
                vec![fill; mode.width * total_lines]
            })
            .collect();

        Self {
            mode,
            sample_rate,
            buffer: SampleBuffer::new(),
            demodulator: AnalyticFm::new(),
            channels,
            assembly: Assembly::resolve(mode),
            line: 0,
            total_lines,
            line_samples: samples_for_duration(mode.line_time, sample_rate),
            sync_samples,
            porch_samples: samples_for_duration(mode.porch_time, sample_rate),
            separator_samples: samples_for_duration(mode.separator_time, sample_rate),
            channel_samples,
            margin: samples_for_duration(SYNC_SEARCH_SPAN * mode.line_time, sample_rate),
            step: (sync_samples / 2).max(1),
            pending_skip,
        }
    }

    #[inline]
    pub fn mode(&self) -> &'static ModeSpec {
        self.mode
    }

    #[inline]
    pub fn lines_decoded(&self) -> usize {
        self.line
    }

    #[inline]
    pub fn total_lines(&self) -> usize {
        self.total_lines
    }

    /// Decode progress in `[0.0, 1.0]`, in whole scanlines.
    #[inline]
    pub fn progress(&self) -> f32 {
        self.line as f32 / self.total_lines as f32
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.line >= self.total_lines
    }

    /// Samples past a line's nominal audio that the sync search may read.
    /// A recording cropped at the nominal end of its last line falls short
    /// by up to this much.
    #[inline]
    pub fn lookahead(&self) -> usize {
        self.margin + self.sync_samples
    }

    /// Buffers samples and decodes every scanline they complete. Returns
    /// whether the image is complete.
    ///
    /// Once complete, further samples are not consumed; anything buffered
    /// past the last line is available via
    /// [`take_remaining`](Self::take_remaining).
    pub fn feed(&mut self, samples: &[f32]) -> bool {
        if self.is_complete() {
            return true;
        }

        self.buffer.push(samples);
        while !self.is_complete() && self.decode_line() {}
        self.is_complete()
    }

    /// Samples buffered beyond the decoded image.
    pub fn take_remaining(&mut self) -> Vec<f32> {
        self.buffer.take_remaining()
    }

    fn decode_line(&mut self) -> bool {
        if self.pending_skip > 0 {
            if self.buffer.available() < self.pending_skip {
                return false;
            }
            self.buffer.consume(self.pending_skip);
            self.pending_skip = 0;
        }

        match self.mode.sync_position {
            SyncPosition::LineStart => self.decode_front_line(),
            SyncPosition::BeforeFinal => self.decode_middle_line(),
        }
    }

    /// Sync, porch, then all channels. The buffer is positioned `margin`
    /// samples before the nominal sync, except for the first line where
    /// the sync sits at the very start.
    fn decode_front_line(&mut self) -> bool {
        let needed = 2 * self.margin + self.line_samples + self.sync_samples;
        if self.buffer.available() < needed {
            return false;
        }

        let sync_pos = self.find_sync(0, 2 * self.margin);
        let mut cursor = sync_pos + self.sync_samples + self.porch_samples;
        for index in 0..self.mode.channels.len() {
            let length = self.channel_samples[index];
            let row = self.row_from_span(cursor, length);
            self.store_row(index, &row);
            cursor += length;
            if index < self.mode.separator_slots {
                cursor += self.separator_samples;
            }
        }

        // leave the search margin in front of the next line's sync
        let next_sync = sync_pos + self.line_samples;
        self.buffer.consume(next_sync - self.margin);
        self.line += 1;
        tracing::trace!(line = self.line, sync_pos, "scanline decoded");
        true
    }

    /// Separator, channel, separator, channel, then sync, porch and the
    /// final channel. The first two channels sit at their nominal offsets
    /// from the line origin; the sync is re-acquired before the final one.
    fn decode_middle_line(&mut self) -> bool {
        let nominal_sync =
            2 * self.separator_samples + self.channel_samples[0] + self.channel_samples[1];
        let tail = self.sync_samples + self.porch_samples + self.channel_samples[2];
        let needed = nominal_sync + self.margin + tail;
        if self.buffer.available() < needed {
            return false;
        }

        let first = self.row_from_span(self.separator_samples, self.channel_samples[0]);
        self.store_row(0, &first);

        let second_start = 2 * self.separator_samples + self.channel_samples[0];
        let second = self.row_from_span(second_start, self.channel_samples[1]);
        self.store_row(1, &second);

        let low = nominal_sync.saturating_sub(self.margin);
        let high = (nominal_sync + self.margin).min(self.buffer.available() - tail);
        let sync_pos = self.find_sync(low, high.max(low));

        let final_start = sync_pos + self.sync_samples + self.porch_samples;
        let row = self.row_from_span(final_start, self.channel_samples[2]);
        self.store_row(2, &row);

        self.buffer.consume(final_start + self.channel_samples[2]);
        self.line += 1;
        tracing::trace!(line = self.line, sync_pos, "scanline decoded");
        true
    }

    /// Best sync candidate in `[low, high]`: a coarse pass on the
    /// half-pulse grid, then a refinement pass around its winner.
    fn find_sync(&self, low: usize, high: usize) -> usize {
        let coarse = self.best_sync(low, high, self.step);
        let fine_low = coarse.saturating_sub(self.step).max(low);
        let fine_high = (coarse + self.step).min(high);
        self.best_sync(fine_low, fine_high, SYNC_REFINE_STEP)
    }

    /// Scores each candidate position by sync tone energy weighted by its
    /// share of the sync-plus-video total over a pulse-length window.
    fn best_sync(&self, low: usize, high: usize, step: usize) -> usize {
        let samples = self.buffer.samples();
        let mut best_pos = low;
        let mut best_score = f32::MIN;
        let mut pos = low;
        while pos <= high {
            let window = &samples[pos..pos + self.sync_samples];
            let sync = goertzel_energy(window, FRAME_TONE, self.sample_rate);
            let video = goertzel_energy(window, BLACK_TONE, self.sample_rate);
            let score = sync * sync / (sync + video + f32::EPSILON);
            if score > best_score {
                best_score = score;
                best_pos = pos;
            }
            pos += step;
        }
        best_pos
    }

    /// Demodulates `length` samples at `start` into one row of pixels.
    ///
    /// The span is widened by up to a sync pulse of neighboring audio on
    /// each side before demodulation: the analytic transform wraps its
    /// input, and the wrap seam rings into the outermost samples. The
    /// guards are dropped again after smoothing.
    fn row_from_span(&mut self, start: usize, length: usize) -> Vec<u8> {
        let samples = self.buffer.samples();
        let lead = start.min(self.sync_samples);
        let tail = self.sync_samples.min(samples.len() - start - length);
        let span = &samples[start - lead..start + length + tail];
        let track = self.demodulator.instantaneous_frequency(span, self.sample_rate);
        let track = smooth_track(&track, self.sample_rate);
        pixels_from_frequencies(&track[lead..lead + length], self.mode.width)
    }

    fn store_row(&mut self, channel: usize, row: &[u8]) {
        let width = self.mode.width;
        let offset = self.line * width;
        self.channels[channel][offset..offset + width].copy_from_slice(row);
    }

    /// Assembles the channel planes into pixels.
    pub fn assemble(&self) -> RgbImage {
        let width = self.mode.width;
        match self.assembly {
            Assembly::Rgb { red, green, blue } => {
                RgbImage::from_fn(width as u32, self.mode.height as u32, |x, y| {
                    let index = y as usize * width + x as usize;
                    Rgb([
                        self.channels[red][index],
                        self.channels[green][index],
                        self.channels[blue][index],
                    ])
                })
            }
            Assembly::YCrCb {
                luma,
                chroma_r,
                chroma_b,
            } => {
                RgbImage::from_fn(width as u32, self.mode.height as u32, |x, y| {
                    let index = y as usize * width + x as usize;
                    ycrcb_to_rgb(
                        self.channels[luma][index],
                        self.channels[chroma_r][index],
                        self.channels[chroma_b][index],
                    )
                })
            }
            Assembly::YCrCbHalf { luma, chroma } => {
                RgbImage::from_fn(width as u32, self.mode.height as u32, |x, y| {
                    let row = y as usize;
                    let x = x as usize;
                    ycrcb_to_rgb(
                        self.channels[luma][row * width + x],
                        self.half_chroma(chroma, row, x, 0),
                        self.half_chroma(chroma, row, x, 1),
                    )
                })
            }
            Assembly::YCrCbDual {
                luma,
                luma_odd,
                chroma_r,
                chroma_b,
            } => {
                RgbImage::from_fn(width as u32, self.mode.height as u32, |x, y| {
                    let audio_line = y as usize / 2;
                    let index = audio_line * width + x as usize;
                    let luma_plane = if y % 2 == 0 { luma } else { luma_odd };
                    ycrcb_to_rgb(
                        self.channels[luma_plane][index],
                        self.channels[chroma_r][index],
                        self.channels[chroma_b][index],
                    )
                })
            }
        }
    }

    /// Chroma sample for `row` from a plane that alternates by line
    /// parity. Lines with `row % 2 == parity` carry the wanted color;
    /// others interpolate from the nearest carrying neighbors.
    fn half_chroma(&self, plane: usize, row: usize, x: usize, parity: usize) -> u8 {
        let width = self.mode.width;
        if row % 2 == parity {
            return self.channels[plane][row * width + x];
        }

        let above = row.checked_sub(1).map(|r| self.channels[plane][r * width + x]);
        let below = (row + 1 < self.total_lines).then(|| self.channels[plane][(row + 1) * width + x]);
        match (above, below) {
            (Some(a), Some(b)) => ((u16::from(a) + u16::from(b)) / 2) as u8,
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => 128,
        }
    }
}

impl Assembly {
    fn resolve(mode: &ModeSpec) -> Self {
        // positions are guaranteed by ModeSpec::is_well_formed
        let position = |kind| mode.channel_position(kind).unwrap_or_default();
        match mode.color {
            ColorFormat::Rgb => {
                Self::Rgb {
                    red: position(ChannelKind::Red),
                    green: position(ChannelKind::Green),
                    blue: position(ChannelKind::Blue),
                }
            }
            ColorFormat::YCrCb => {
                Self::YCrCb {
                    luma: position(ChannelKind::Luma),
                    chroma_r: position(ChannelKind::ChromaR),
                    chroma_b: position(ChannelKind::ChromaB),
                }
            }
            ColorFormat::YCrCbHalf => {
                Self::YCrCbHalf {
                    luma: position(ChannelKind::Luma),
                    chroma: position(ChannelKind::ChromaAlt),
                }
            }
            ColorFormat::YCrCbDual => {
                Self::YCrCbDual {
                    luma: position(ChannelKind::Luma),
                    luma_odd: position(ChannelKind::LumaOdd),
                    chroma_r: position(ChannelKind::ChromaR),
                    chroma_b: position(ChannelKind::ChromaB),
                }
            }
        }
    }
}

/// Averages the instantaneous frequencies over each pixel's segment of the
/// span and maps them to luminance.
fn pixels_from_frequencies(frequencies: &[f32], width: usize) -> Vec<u8> {
    let mut row = vec![0u8; width];
    if frequencies.is_empty() {
        return row;
    }

    for (x, pixel) in row.iter_mut().enumerate() {
        let start = x * frequencies.len() / width;
        let end = ((x + 1) * frequencies.len() / width).max(start + 1);
        let sum = frequencies[start..end].iter().sum::<f32>();
        *pixel = freq_to_pixel(sum / (end - start) as f32);
    }

    row
}

/// Centered moving average over a frequency track. The discriminator
/// output oscillates near the sum of the two tones around each frequency
/// step; the window length puts its first null there.
fn smooth_track(track: &[f32], sample_rate: f32) -> Vec<f32> {
    let len = ((sample_rate / TRACK_SMOOTHING_NULL_HZ).round() as usize).max(1);
    let half = len / 2;
    if half == 0 || track.len() < len {
        return track.to_vec();
    }

    (0..track.len())
        .map(|index| {
            let low = index.saturating_sub(half);
            let high = (index + half + 1).min(track.len());
            track[low..high].iter().sum::<f32>() / (high - low) as f32
        })
        .collect()
}

/// ITU-R BT.601 conversion with chroma centered on 128.
fn ycrcb_to_rgb(y: u8, cr: u8, cb: u8) -> Rgb<u8> {
    let y = f32::from(y);
    let cr = f32::from(cr) - 128.0;
    let cb = f32::from(cb) - 128.0;

    let r = y + 1.402 * cr;
    let g = y - 0.714136 * cr - 0.344136 * cb;
    let b = y + 1.772 * cb;

    Rgb([clamp_pixel(r), clamp_pixel(g), clamp_pixel(b)])
}

#[inline]
fn clamp_pixel(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
