//! Image acquisition sources.
//!
//! Every session acquires exactly one still image from one of:
//! - a local file (`FileImageSource`)
//! - an uploaded payload, raw bytes or a base64 data URL (`UploadSource`)
//!
//! Sources hand back encoded bytes; decoding happens once, in the inference
//! adapter. An empty payload or one that is not a recognizable image is an
//! acquisition failure and never reaches the detector.

pub mod file;
pub mod upload;

use image::ImageFormat;

use crate::error::{InspectError, Result};

pub use file::FileImageSource;
pub use upload::UploadSource;

/// Encoded image bytes plus where they came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcquiredImage {
    bytes: Vec<u8>,
    origin: String,
    extension: &'static str,
}

impl AcquiredImage {
    pub fn new(bytes: Vec<u8>, origin: impl Into<String>) -> Result<Self> {
        let origin = origin.into();
        if bytes.is_empty() {
            return Err(InspectError::Acquisition(format!("{origin}: image is empty")));
        }
        let format = image::guess_format(&bytes).map_err(|_| {
            InspectError::Acquisition(format!("{origin}: payload is not a recognized image"))
        })?;
        let extension = match format {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            other => {
                return Err(InspectError::Acquisition(format!(
                    "{origin}: unsupported image format {other:?}"
                )))
            }
        };
        Ok(Self {
            bytes,
            origin,
            extension,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// File extension matching the encoded format (`png` or `jpg`).
    pub fn extension(&self) -> &'static str {
        self.extension
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Source of a single inspection image.
pub trait ImageSource {
    fn acquire(&mut self) -> Result<AcquiredImage>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}
