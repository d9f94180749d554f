//! Uploaded image payloads (HTTP body or browser capture).

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use super::{AcquiredImage, ImageSource};
use crate::error::{InspectError, Result};

/// One-shot source over bytes already in memory.
#[derive(Debug)]
pub struct UploadSource {
    bytes: Option<Vec<u8>>,
    origin: String,
}

impl UploadSource {
    pub fn new(bytes: Vec<u8>, origin: impl Into<String>) -> Self {
        Self {
            bytes: Some(bytes),
            origin: origin.into(),
        }
    }

    /// Accepts `data:image/...;base64,<payload>` or a bare base64 payload.
    pub fn from_data_url(data: &str, origin: impl Into<String>) -> Result<Self> {
        let payload = match data.split_once(',') {
            Some((prefix, payload)) if prefix.starts_with("data:") => {
                if !prefix.ends_with(";base64") {
                    return Err(InspectError::Acquisition(
                        "data URL must be base64 encoded".into(),
                    ));
                }
                payload
            }
            _ => data,
        };
        let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        let bytes = STANDARD
            .decode(compact.as_bytes())
            .map_err(|e| InspectError::Acquisition(format!("invalid base64 image data: {e}")))?;
        Ok(Self::new(bytes, origin))
    }
}

impl ImageSource for UploadSource {
    fn acquire(&mut self) -> Result<AcquiredImage> {
        let bytes = self.bytes.take().ok_or_else(|| {
            InspectError::Acquisition(format!("{}: payload already consumed", self.origin))
        })?;
        AcquiredImage::new(bytes, self.origin.clone())
    }

    fn describe(&self) -> String {
        match &self.bytes {
            Some(bytes) => format!("{} ({} bytes)", self.origin, bytes.len()),
            None => format!("{} (consumed)", self.origin),
        }
    }
}
