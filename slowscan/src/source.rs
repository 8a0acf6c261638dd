//! Sample acquisition: WAV recordings and raw PCM byte streams.

use std::{
    convert::Infallible,
    path::Path,
};

use tokio::io::{
    AsyncRead,
    AsyncReadExt,
};

use crate::dsp::normalize_i16;

/// Asynchronous source of mono `f32` samples.
///
/// A `read` returning 0 for a non-empty buffer means the source ended.
#[allow(async_fn_in_trait)]
pub trait SampleSource {
    type Error: std::error::Error + Send + Sync + 'static;

    fn sample_rate(&self) -> f32;

    async fn read(&mut self, buffer: &mut [f32]) -> Result<usize, Self::Error>;
}

#[derive(Debug, thiserror::Error)]
#[error("wav source error")]
pub enum WavError {
    Wav(#[from] hound::Error),
    UnexpectedChannelCount { channels: u16 },
    UnexpectedBitsPerSample { bits_per_sample: u16 },
    UnexpectedSampleFormat,
}

/// Loads a mono 16 bit PCM WAV recording as normalized samples.
///
/// Returns the samples and their sample rate.
pub fn read_wav(path: impl AsRef<Path>) -> Result<(Vec<f32>, u32), WavError> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();

    if spec.channels != 1 {
        return Err(WavError::UnexpectedChannelCount {
            channels: spec.channels,
        });
    }
    if spec.bits_per_sample != 16 {
        return Err(WavError::UnexpectedBitsPerSample {
            bits_per_sample: spec.bits_per_sample,
        });
    }
    if spec.sample_format != hound::SampleFormat::Int {
        return Err(WavError::UnexpectedSampleFormat);
    }

    let samples = reader
        .samples::<i16>()
        .map(|sample| sample.map(normalize_i16))
        .collect::<Result<Vec<_>, _>>()?;

    tracing::debug!(
        samples = samples.len(),
        sample_rate = spec.sample_rate,
        "loaded wav recording"
    );
    Ok((samples, spec.sample_rate))
}

/// Adapts a byte stream of signed 16 bit little endian PCM into samples.
///
/// This is the shape produced by `rtl_fm` and friends on stdout.
#[derive(derive_more::Debug)]
pub struct PcmStream<R> {
    #[debug(skip)]
    reader: R,
    sample_rate: f32,
    scratch: Vec<u8>,
    /// Odd trailing byte of the previous read, waiting for its partner.
    carry: Option<u8>,
}

impl<R> PcmStream<R> {
    pub fn new(reader: R, sample_rate: u32) -> Self {
        Self {
            reader,
            sample_rate: sample_rate as f32,
            scratch: Vec::new(),
            carry: None,
        }
    }
}

impl<R> SampleSource for PcmStream<R>
where
    R: AsyncRead + Unpin + Send,
{
    type Error = std::io::Error;

    #[inline]
    fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    async fn read(&mut self, buffer: &mut [f32]) -> Result<usize, Self::Error> {
        if buffer.is_empty() {
            return Ok(0);
        }

        self.scratch.resize(buffer.len() * 2, 0);
        let mut have = 0;
        if let Some(byte) = self.carry.take() {
            self.scratch[0] = byte;
            have = 1;
        }

        loop {
            let read = self.reader.read(&mut self.scratch[have..]).await?;
            if read == 0 {
                // end of stream; a dangling carry byte never completes a
                // sample
                break;
            }
            have += read;
            if have >= 2 {
                break;
            }
        }

        let count = have / 2;
        if have % 2 == 1 {
            self.carry = Some(self.scratch[have - 1]);
        }
        for (index, sample) in buffer[..count].iter_mut().enumerate() {
            let raw = i16::from_le_bytes([self.scratch[2 * index], self.scratch[2 * index + 1]]);
            *sample = normalize_i16(raw);
        }

        Ok(count)
    }
}

/// Serves a preloaded sample buffer, then reports end of stream.
#[derive(Clone, derive_more::Debug)]
pub struct BufferSource {
    #[debug(skip)]
    samples: Vec<f32>,
    position: usize,
    sample_rate: f32,
}

impl BufferSource {
    pub fn new(samples: Vec<f32>, sample_rate: f32) -> Self {
        Self {
            samples,
            position: 0,
            sample_rate,
        }
    }
}

impl SampleSource for BufferSource {
    type Error = Infallible;

    #[inline]
    fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    async fn read(&mut self, buffer: &mut [f32]) -> Result<usize, Self::Error> {
        let count = buffer.len().min(self.samples.len() - self.position);
        buffer[..count].copy_from_slice(&self.samples[self.position..self.position + count]);
        self.position += count;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::{
        BufferSource,
        PcmStream,
        SampleSource,
    };

    #[tokio::test]
    async fn pcm_stream_converts_little_endian_pairs() {
        let bytes = vec![0x00, 0x00, 0x00, 0x80, 0xff, 0x7f, 0x00, 0x40];
        let mut stream = PcmStream::new(Cursor::new(bytes), 48000);
        assert_eq!(stream.sample_rate(), 48000.0);

        let mut buffer = [0.0f32; 8];
        let count = stream.read(&mut buffer).await.unwrap();
        assert_eq!(count, 4);
        assert_eq!(buffer[0], 0.0);
        assert_eq!(buffer[1], -1.0);
        assert!((buffer[2] - 1.0).abs() < 1e-3);
        assert_eq!(buffer[3], 0.5);

        assert_eq!(stream.read(&mut buffer).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pcm_stream_carries_odd_bytes_between_reads() {
        let bytes = vec![0x00, 0x40, 0xff];
        let mut stream = PcmStream::new(Cursor::new(bytes), 48000);

        let mut buffer = [0.0f32; 1];
        assert_eq!(stream.read(&mut buffer).await.unwrap(), 1);
        assert_eq!(buffer[0], 0.5);
        // only the dangling 0xff remains, which never completes a sample
        assert_eq!(stream.read(&mut buffer).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn buffer_source_drains_and_ends() {
        let mut source = BufferSource::new(vec![0.1, 0.2, 0.3], 8000.0);
        let mut buffer = [0.0f32; 2];
        assert_eq!(source.read(&mut buffer).await.unwrap(), 2);
        assert_eq!(source.read(&mut buffer).await.unwrap(), 1);
        assert_eq!(buffer[0], 0.3);
        assert_eq!(source.read(&mut buffer).await.unwrap(), 0);
    }
}
