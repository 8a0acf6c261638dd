//! Persistence of decoded images.

use std::{
    convert::Infallible,
    io,
    path::{
        Path,
        PathBuf,
    },
};

use chrono::{
    DateTime,
    Utc,
};
use image::RgbImage;

use crate::modes::ModeSpec;

/// A fully decoded image with its capture context.
#[derive(Clone, derive_more::Debug)]
pub struct DecodedImage {
    pub mode: &'static ModeSpec,
    /// When decoding of the image began.
    pub timestamp: DateTime<Utc>,
    /// Receiver tuning at capture time, in Hz.
    pub frequency_hz: f64,
    #[debug(skip)]
    pub image: RgbImage,
    /// The image encoded as PNG.
    #[debug(skip)]
    pub png: Vec<u8>,
}

impl DecodedImage {
    /// Size of the encoded PNG in bytes.
    #[inline]
    pub fn byte_size(&self) -> usize {
        self.png.len()
    }

    /// File name the image persists under: mode short name plus UTC
    /// capture timestamp.
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}.png",
            self.mode.short_name,
            self.timestamp.format("%Y%m%dT%H%M%SZ")
        )
    }
}

/// Receives every image a session completes.
pub trait ImageSink {
    type Error: std::error::Error + Send + Sync + 'static;

    fn store(&mut self, image: &DecodedImage) -> Result<(), Self::Error>;
}

/// Discards images. Useful when only the progress stream matters.
impl ImageSink for () {
    type Error = Infallible;

    fn store(&mut self, _image: &DecodedImage) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Writes each image as a PNG file into one directory.
#[derive(Clone, Debug)]
pub struct DirectorySink {
    directory: PathBuf,
}

impl DirectorySink {
    /// Creates the directory if it does not exist yet.
    pub fn new(directory: impl Into<PathBuf>) -> io::Result<Self> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)?;
        Ok(Self { directory })
    }

    #[inline]
    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl ImageSink for DirectorySink {
    type Error = io::Error;

    fn store(&mut self, image: &DecodedImage) -> Result<(), Self::Error> {
        let path = self.directory.join(image.file_name());
        std::fs::write(&path, &image.png)?;
        tracing::info!(path = %path.display(), bytes = image.byte_size(), "image written");
        Ok(())
    }
}

/// Keeps stored images in memory.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    pub images: Vec<DecodedImage>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ImageSink for MemorySink {
    type Error = Infallible;

    fn store(&mut self, image: &DecodedImage) -> Result<(), Self::Error> {
        self.images.push(image.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::DecodedImage;
    use crate::modes::ModeSpec;

    #[test]
    fn file_names_carry_mode_and_timestamp() {
        let image = DecodedImage {
            mode: &ModeSpec::SCOTTIE_S1,
            timestamp: chrono::Utc.with_ymd_and_hms(2024, 3, 7, 12, 30, 5).unwrap(),
            frequency_hz: 145_800_000.0,
            image: image::RgbImage::new(1, 1),
            png: vec![0; 4],
        };
        assert_eq!(image.file_name(), "s1_20240307T123005Z.png");
        assert_eq!(image.byte_size(), 4);
    }
}
