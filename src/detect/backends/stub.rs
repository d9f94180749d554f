use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::error::{InspectError, Result};

/// Scripted backend for dry runs and tests.
///
/// Returns the same detection list for every image. Pixels are only checked
/// for a consistent RGB8 length.
#[derive(Clone, Debug, Default)]
pub struct StubBackend {
    script: Vec<Detection>,
    calls: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_detections(script: Vec<Detection>) -> Self {
        Self { script, calls: 0 }
    }

    /// Number of `detect` calls served so far.
    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| InspectError::Acquisition("image dimensions overflow".into()))?;
        if pixels.len() != expected {
            return Err(InspectError::Acquisition(format!(
                "expected {} RGB bytes, received {}",
                expected,
                pixels.len()
            )));
        }
        self.calls += 1;
        Ok(self.script.clone())
    }
}
