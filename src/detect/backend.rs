use crate::detect::result::Detection;
use crate::error::Result;

/// Detector backend trait.
///
/// A backend is the opaque detection capability: decoded RGB pixels in,
/// detections out. Backends are held behind a mutex by the
/// [`InferenceAdapter`](crate::detect::InferenceAdapter), so `detect` may keep
/// per-model scratch state in `&mut self`.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a packed RGB8 image (`width * height * 3` bytes).
    ///
    /// Box coordinates are in source-image pixels. An empty vector is a valid
    /// result. Implementations fail with `ModelUnavailable` when the model
    /// cannot run.
    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, run once when the adapter is built.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
