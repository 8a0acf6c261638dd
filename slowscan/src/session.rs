//! Receive session lifecycle: listen, frame, decode, persist, repeat.
//!
//! A [`Session`] owns one [`HeaderDetector`] or one [`ImageDecoder`] at a
//! time and moves between them as headers come and go. Progress is pushed
//! to a [`ProgressSink`]; completed images go to an
//! [`ImageSink`](crate::sink::ImageSink) and are also kept on the session.

use std::{
    io::Cursor,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use chrono::{
    DateTime,
    Utc,
};
use image::RgbImage;
use tokio::sync::mpsc;

use crate::{
    dsp::{
        estimate_frequency,
        goertzel_energy,
        samples_for_duration,
    },
    header::{
        DetectorConfig,
        HeaderDetector,
    },
    modes::ModeSpec,
    scan::ImageDecoder,
    sink::{
        DecodedImage,
        ImageSink,
    },
    source::SampleSource,
    FRAME_TONE,
    LEAD_TONE,
};

/// Session tunables.
#[derive(Clone, Copy, Debug)]
pub struct SessionConfig {
    /// Receiver tuning recorded on decoded images, in Hz.
    pub frequency_hz: f64,
    /// Chunk size for reads from a live source.
    pub chunk_samples: usize,
    /// How long a live source may stall before the session gives up.
    pub read_timeout: Duration,
    /// Interval between signal reports while listening.
    pub signal_report_time: f32,
    /// Decode progress between previews, in percent. Non-positive
    /// disables previews.
    pub preview_step_percent: f32,
    pub detector: DetectorConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            // the ISS voice repeater downlink, the usual SSTV target
            frequency_hz: 145_800_000.0,
            chunk_samples: 4096,
            read_timeout: Duration::from_secs(5),
            signal_report_time: 0.5,
            preview_step_percent: 5.0,
            detector: DetectorConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    /// Waiting for a header.
    Listening,
    /// Partway through a header.
    Framing,
    /// Decoding scanlines.
    Decoding,
    /// An image was finished and persisted.
    Complete,
    /// Something went wrong; details in the event message.
    Error,
}

/// Coarse classification of what the receiver is hearing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToneClass {
    /// The 1900 Hz calibration tone dominates.
    LeadDominant,
    /// The 1200 Hz sync tone dominates.
    FrameDominant,
    Noise,
}

#[derive(Clone, Copy, Debug)]
pub struct SignalReport {
    /// Input level in dB relative to full scale.
    pub level_dbfs: f32,
    pub tone: ToneClass,
    /// Strongest tone in the SSTV band, in Hz.
    pub peak_hz: f32,
}

/// One progress update from a session.
#[derive(Clone, Debug)]
pub struct ProgressEvent {
    pub status: SessionStatus,
    /// Mode being decoded, once known.
    pub mode: Option<&'static str>,
    /// Decode progress in percent.
    pub percent: f32,
    /// Half-scale PNG of the partial image.
    pub preview_png: Option<Vec<u8>>,
    pub signal: Option<SignalReport>,
    pub message: Option<String>,
}

impl ProgressEvent {
    pub fn new(status: SessionStatus) -> Self {
        Self {
            status,
            mode: None,
            percent: 0.0,
            preview_png: None,
            signal: None,
            message: None,
        }
    }
}

/// Receives progress events from a session.
pub trait ProgressSink {
    fn emit(&mut self, event: ProgressEvent);
}

/// Discards all events.
impl ProgressSink for () {
    fn emit(&mut self, _event: ProgressEvent) {}
}

/// Collects events; handy for batch decoding and tests.
impl ProgressSink for Vec<ProgressEvent> {
    fn emit(&mut self, event: ProgressEvent) {
        self.push(event);
    }
}

/// Forwards events into a channel. Events are dropped once the receiver
/// is gone.
impl ProgressSink for mpsc::UnboundedSender<ProgressEvent> {
    fn emit(&mut self, event: ProgressEvent) {
        let _ = self.send(event);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to encode image as png")]
    Encode(#[from] image::ImageError),
    #[error("image sink failed")]
    Sink(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Error of a live session run.
#[derive(Debug, thiserror::Error)]
pub enum RunError<E> {
    #[error("sample source failed")]
    Source(#[source] E),
    #[error("sample source ended unexpectedly")]
    SourceEnded,
    #[error("timed out waiting for samples")]
    SourceTimeout,
    #[error(transparent)]
    Session(#[from] SessionError),
}

enum SessionState {
    Idle,
    Listening {
        detector: HeaderDetector,
    },
    Decoding {
        decoder: ImageDecoder,
        started: DateTime<Utc>,
        next_preview: f32,
    },
}

/// Orchestrates decoding over a sample stream.
///
/// One session handles any number of consecutive images; after each
/// completed image it returns to listening. Sessions are single streams:
/// for concurrent receivers, run one session per stream.
pub struct Session<P, K> {
    sample_rate: f32,
    config: SessionConfig,
    progress: P,
    sink: K,
    state: SessionState,
    stop: Arc<AtomicBool>,
    images: Vec<DecodedImage>,
    listen_samples: usize,
    last_status: SessionStatus,
}

impl<P, K> Session<P, K>
where
    P: ProgressSink,
    K: ImageSink,
{
    pub fn new(sample_rate: f32, config: SessionConfig, progress: P, sink: K) -> Self {
        Self {
            sample_rate,
            config,
            progress,
            sink,
            state: SessionState::Idle,
            stop: Arc::new(AtomicBool::new(false)),
            images: Vec::new(),
            listen_samples: 0,
            last_status: SessionStatus::Listening,
        }
    }

    /// Flag that makes [`run`](Self::run) and
    /// [`decode_buffer`](Self::decode_buffer) return cooperatively.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Every image completed so far, in decode order.
    #[inline]
    pub fn images(&self) -> &[DecodedImage] {
        &self.images
    }

    pub fn take_images(&mut self) -> Vec<DecodedImage> {
        std::mem::take(&mut self.images)
    }

    #[inline]
    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn status(&self) -> SessionStatus {
        match &self.state {
            SessionState::Idle => SessionStatus::Listening,
            SessionState::Listening { detector } => {
                if detector.is_framing() {
                    SessionStatus::Framing
                }
                else {
                    SessionStatus::Listening
                }
            }
            SessionState::Decoding { .. } => SessionStatus::Decoding,
        }
    }

    /// Feeds one chunk of samples through the state machine.
    pub fn feed(&mut self, chunk: &[f32]) -> Result<(), SessionError> {
        self.ensure_started();

        if let SessionState::Listening { detector } = &mut self.state {
            let detected = detector
                .feed(chunk)
                .map(|mode| (mode, detector.take_remaining()));

            return match detected {
                Some((mode, remaining)) => {
                    self.begin_decoding(mode);
                    self.drive_decoder(&remaining)
                }
                None => {
                    self.listening_telemetry(chunk);
                    Ok(())
                }
            };
        }

        self.drive_decoder(chunk)
    }

    /// Decodes a whole recording in one call.
    ///
    /// Feeds the buffer in [`SessionConfig::chunk_samples`] chunks,
    /// honoring the stop flag between chunks, then pads with enough
    /// silence for a recording cropped at its last scanline to finish.
    /// An image still in progress after that is discarded with a status
    /// event; that is not an error. Returns the images this call
    /// completed.
    pub fn decode_buffer(&mut self, samples: &[f32]) -> Result<&[DecodedImage], SessionError> {
        self.ensure_started();
        let before = self.images.len();

        for chunk in samples.chunks(self.config.chunk_samples.max(1)) {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            self.feed(chunk)?;
        }

        // the per-line sync search reads past a line's nominal audio, so
        // a cropped recording leaves its last line short of lookahead
        let flush = match &self.state {
            SessionState::Decoding { decoder, .. } => 2 * decoder.lookahead(),
            _ => 0,
        };
        if flush > 0 && !self.stop.load(Ordering::Relaxed) {
            let silence = vec![0.0f32; flush];
            self.feed(&silence)?;
        }

        self.discard_partial();
        Ok(&self.images[before..])
    }

    /// Runs the session over a live source until stopped or the source
    /// fails.
    ///
    /// Reads are bounded by [`SessionConfig::read_timeout`]. End of stream
    /// is an error for a live source; a receiver does not hang up
    /// mid-pass.
    pub async fn run<S>(&mut self, source: &mut S) -> Result<(), RunError<S::Error>>
    where
        S: SampleSource,
    {
        self.ensure_started();
        let mut chunk = vec![0.0f32; self.config.chunk_samples.max(1)];

        loop {
            if self.stop.load(Ordering::Relaxed) {
                tracing::info!("session stopped");
                return Ok(());
            }

            let count =
                match tokio::time::timeout(self.config.read_timeout, source.read(&mut chunk)).await
                {
                    Ok(Ok(0)) => {
                        self.emit_error("sample source ended");
                        return Err(RunError::SourceEnded);
                    }
                    Ok(Ok(count)) => count,
                    Ok(Err(error)) => {
                        self.emit_error("sample source failed");
                        return Err(RunError::Source(error));
                    }
                    Err(_elapsed) => {
                        self.emit_error("sample source timed out");
                        return Err(RunError::SourceTimeout);
                    }
                };

            self.feed(&chunk[..count])?;
        }
    }

    fn ensure_started(&mut self) {
        if matches!(self.state, SessionState::Idle) {
            tracing::debug!(sample_rate = self.sample_rate, "session listening");
            self.state = SessionState::Listening {
                detector: self.new_detector(),
            };
            self.emit(ProgressEvent::new(SessionStatus::Listening));
        }
    }

    fn new_detector(&self) -> HeaderDetector {
        HeaderDetector::with_config(self.sample_rate, self.config.detector)
    }

    fn begin_decoding(&mut self, mode: &'static ModeSpec) {
        tracing::info!(mode = mode.name, "decoding image");
        self.state = SessionState::Decoding {
            decoder: ImageDecoder::new(mode, self.sample_rate),
            started: Utc::now(),
            next_preview: self.config.preview_step_percent,
        };
        let mut event = ProgressEvent::new(SessionStatus::Decoding);
        event.mode = Some(mode.name);
        self.emit(event);
    }

    fn drive_decoder(&mut self, chunk: &[f32]) -> Result<(), SessionError> {
        let SessionState::Decoding {
            decoder,
            next_preview,
            ..
        } = &mut self.state
        else {
            return Ok(());
        };

        if decoder.feed(chunk) {
            return self.finish_image();
        }

        let step = self.config.preview_step_percent;
        let percent = decoder.progress() * 100.0;
        if step <= 0.0 || percent < *next_preview {
            return Ok(());
        }
        while *next_preview <= percent {
            *next_preview += step;
        }

        let preview = render_preview(decoder)?;
        let mut event = ProgressEvent::new(SessionStatus::Decoding);
        event.mode = Some(decoder.mode().name);
        event.percent = percent;
        event.preview_png = Some(preview);
        self.emit(event);
        Ok(())
    }

    fn finish_image(&mut self) -> Result<(), SessionError> {
        let detector = self.new_detector();
        let state = std::mem::replace(&mut self.state, SessionState::Listening { detector });
        let SessionState::Decoding {
            mut decoder,
            started,
            ..
        } = state
        else {
            return Ok(());
        };

        let remaining = decoder.take_remaining();
        let image = decoder.assemble();
        let png = encode_png(&image)?;
        let decoded = DecodedImage {
            mode: decoder.mode(),
            timestamp: started,
            frequency_hz: self.config.frequency_hz,
            image,
            png,
        };

        self.sink
            .store(&decoded)
            .map_err(|error| SessionError::Sink(Box::new(error)))?;
        tracing::info!(
            mode = decoded.mode.name,
            bytes = decoded.byte_size(),
            "image decoded"
        );

        let mut event = ProgressEvent::new(SessionStatus::Complete);
        event.mode = Some(decoded.mode.name);
        event.percent = 100.0;
        self.emit(event);
        self.images.push(decoded);

        if !remaining.is_empty() {
            // audio past the image end may already hold the next header
            self.feed(&remaining)?;
        }
        Ok(())
    }

    fn discard_partial(&mut self) {
        let info = match &self.state {
            SessionState::Decoding { decoder, .. } => {
                Some((decoder.mode().name, decoder.progress() * 100.0))
            }
            _ => None,
        };
        let Some((mode, percent)) = info
        else {
            return;
        };

        tracing::warn!(mode, percent, "discarding incomplete image at end of input");
        self.state = SessionState::Listening {
            detector: self.new_detector(),
        };
        let mut event = ProgressEvent::new(SessionStatus::Listening);
        event.message = Some(format!("incomplete {mode} image discarded at {percent:.0}%"));
        self.emit(event);
    }

    fn listening_telemetry(&mut self, chunk: &[f32]) {
        let framing = match &self.state {
            SessionState::Listening { detector } => detector.is_framing(),
            _ => return,
        };
        let status = if framing {
            SessionStatus::Framing
        }
        else {
            SessionStatus::Listening
        };

        if status != self.last_status {
            self.emit(ProgressEvent::new(status));
        }

        self.listen_samples += chunk.len();
        let interval = samples_for_duration(self.config.signal_report_time, self.sample_rate).max(1);
        if self.listen_samples >= interval {
            self.listen_samples = 0;
            let mut event = ProgressEvent::new(status);
            event.signal = Some(signal_report(chunk, self.sample_rate));
            self.emit(event);
        }
    }

    fn emit(&mut self, event: ProgressEvent) {
        self.last_status = event.status;
        self.progress.emit(event);
    }

    fn emit_error(&mut self, message: &str) {
        let mut event = ProgressEvent::new(SessionStatus::Error);
        event.message = Some(message.to_owned());
        self.emit(event);
    }
}

fn encode_png(image: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut png = Vec::new();
    image.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)?;
    Ok(png)
}

fn render_preview(decoder: &ImageDecoder) -> Result<Vec<u8>, image::ImageError> {
    let full = decoder.assemble();
    let preview = image::imageops::thumbnail(
        &full,
        (full.width() / 2).max(1),
        (full.height() / 2).max(1),
    );
    encode_png(&preview)
}

/// Measures level and tone content of one chunk.
fn signal_report(chunk: &[f32], sample_rate: f32) -> SignalReport {
    let mean_square = if chunk.is_empty() {
        0.0
    }
    else {
        chunk.iter().map(|sample| sample * sample).sum::<f32>() / chunk.len() as f32
    };
    let level_dbfs = 10.0 * mean_square.max(1e-12).log10();

    let lead = goertzel_energy(chunk, LEAD_TONE, sample_rate);
    let frame = goertzel_energy(chunk, FRAME_TONE, sample_rate);
    let tone = if lead > 0.0 && lead > 2.0 * frame {
        ToneClass::LeadDominant
    }
    else if frame > 0.0 && frame > 2.0 * lead {
        ToneClass::FrameDominant
    }
    else {
        ToneClass::Noise
    };

    SignalReport {
        level_dbfs,
        tone,
        peak_hz: estimate_frequency(chunk, 1000.0, 2400.0, sample_rate),
    }
}

#[cfg(test)]
mod tests {
    use std::f32::consts::TAU;

    use super::{
        signal_report,
        ProgressEvent,
        ProgressSink,
        SessionStatus,
        ToneClass,
    };

    fn tone(frequency: f32, sample_rate: f32, count: usize) -> Vec<f32> {
        (0..count)
            .map(|i| 0.5 * (TAU * frequency * i as f32 / sample_rate).sin())
            .collect()
    }

    #[test]
    fn silence_reports_as_quiet_noise() {
        let report = signal_report(&vec![0.0; 4800], 48000.0);
        assert_eq!(report.tone, ToneClass::Noise);
        assert!(report.level_dbfs < -100.0);
    }

    #[test]
    fn lead_tone_reports_as_lead_dominant() {
        let report = signal_report(&tone(1900.0, 48000.0, 4800), 48000.0);
        assert_eq!(report.tone, ToneClass::LeadDominant);
        assert!((report.peak_hz - 1900.0).abs() <= 10.0);
        // a half amplitude sine sits near -9 dBFS
        assert!((report.level_dbfs + 9.0).abs() < 1.0);
    }

    #[test]
    fn sync_tone_reports_as_frame_dominant() {
        let report = signal_report(&tone(1200.0, 48000.0, 4800), 48000.0);
        assert_eq!(report.tone, ToneClass::FrameDominant);
    }

    #[test]
    fn event_sinks_collect_in_order() {
        let mut events: Vec<ProgressEvent> = Vec::new();
        events.emit(ProgressEvent::new(SessionStatus::Listening));
        events.emit(ProgressEvent::new(SessionStatus::Framing));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, SessionStatus::Listening);
        assert_eq!(events[1].status, SessionStatus::Framing);
        assert!(events[1].preview_png.is_none());
    }
}
