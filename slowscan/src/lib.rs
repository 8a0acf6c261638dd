//! Slow-scan television (SSTV) decoding from demodulated audio.
//!
//! The pipeline is: [`HeaderDetector`] frames and decodes the calibration
//! header from a sample stream, [`ImageDecoder`] reconstructs scanlines for
//! the identified [`modes::ModeSpec`], and [`Session`] owns the lifecycle
//! around both, from listening on a stream to a persisted image.
//!
//! # References
//!
//! - <http://lionel.cordesses.free.fr/gpages/sstv.html>
//! - <http://www.barberdsp.com/downloads/Dayton%20Paper.pdf>
//! - <https://www.sstv-handbook.com/download/sstv_03.pdf>

pub mod buffer;
pub mod dsp;
pub mod header;
pub mod modes;
pub mod scan;
pub mod session;
pub mod sink;
pub mod source;

pub use crate::{
    header::{
        DetectorConfig,
        HeaderDetector,
    },
    scan::ImageDecoder,
    session::{
        ProgressEvent,
        Session,
        SessionConfig,
        SessionStatus,
    },
    sink::DecodedImage,
};

/// Calibration tone that opens the header, re-sent after the break.
pub const LEAD_TONE: f32 = 1900.0;
pub const LEAD_TIME: f32 = 0.300;

pub const BREAK_TIME: f32 = 0.010;

/// Header framing and scanline sync pulses.
pub const FRAME_TONE: f32 = 1200.0;

pub const BIT_TIME: f32 = 0.030;
pub const BIT_ONE_TONE: f32 = 1100.0;
pub const BIT_ZERO_TONE: f32 = 1300.0;

pub const PORCH_TONE: f32 = 1500.0;

/// Pixel luminance range. Black maps to 1500 Hz, white to 2300 Hz.
pub const BLACK_TONE: f32 = 1500.0;
pub const WHITE_TONE: f32 = 2300.0;
