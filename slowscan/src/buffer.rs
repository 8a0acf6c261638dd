//! Growable sample backlog shared by the framing and scanline stages.

/// Buffers samples pushed in arbitrary chunk sizes and hands them back as
/// one contiguous window.
///
/// Consumption advances a read index instead of shifting data; the consumed
/// prefix is compacted away once it outgrows the unread tail, so pushes stay
/// amortized O(1) and [`samples`](Self::samples) stays a plain slice.
#[derive(Clone, Debug, Default)]
pub struct SampleBuffer {
    samples: Vec<f32>,
    read: usize,
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, samples: &[f32]) {
        self.samples.extend_from_slice(samples);
    }

    /// Number of unread samples.
    #[inline]
    pub fn available(&self) -> usize {
        self.samples.len() - self.read
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// The unread samples as one contiguous slice.
    #[inline]
    pub fn samples(&self) -> &[f32] {
        &self.samples[self.read..]
    }

    /// Marks the first `count` unread samples as consumed.
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds [`available`](Self::available).
    pub fn consume(&mut self, count: usize) {
        assert!(
            count <= self.available(),
            "consumed {count} samples, but only {} are available",
            self.available()
        );
        self.read += count;
        if self.read > self.samples.len() / 2 && self.read >= COMPACT_THRESHOLD {
            self.samples.drain(..self.read);
            self.read = 0;
        }
    }

    /// Takes all unread samples out of the buffer, leaving it empty.
    pub fn take_remaining(&mut self) -> Vec<f32> {
        let remaining = self.samples.split_off(self.read);
        self.samples.clear();
        self.read = 0;
        remaining
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.read = 0;
    }
}

const COMPACT_THRESHOLD: usize = 4096;
