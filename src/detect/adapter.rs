use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use image::RgbImage;

use crate::config::DetectorSettings;
use crate::error::{InspectError, Result};

use super::backend::DetectorBackend;
use super::registry::{BackendRegistry, SharedBackend};
use super::result::Detection;

/// Converts encoded image bytes into a normalized detection list.
///
/// The adapter owns decoding (failures are `Acquisition` errors) and the
/// optional inference bound. It never touches the result store, so a slow
/// model cannot hold up persistence for other sessions.
pub struct InferenceAdapter {
    backend: SharedBackend,
    backend_name: String,
    timeout: Option<Duration>,
}

impl InferenceAdapter {
    pub fn new<B: DetectorBackend + 'static>(backend: B) -> Self {
        let backend_name = backend.name().to_string();
        Self {
            backend: Arc::new(Mutex::new(backend)),
            backend_name,
            timeout: None,
        }
    }

    /// Use the registry's default backend, running its warm-up hook.
    pub fn from_registry(registry: &BackendRegistry) -> Result<Self> {
        let backend = registry.default_backend().ok_or_else(|| {
            InspectError::ModelUnavailable("no detector backend registered".into())
        })?;
        let backend_name = {
            let mut guard = backend
                .lock()
                .map_err(|_| InspectError::ModelUnavailable("backend lock poisoned".into()))?;
            guard.warm_up()?;
            guard.name().to_string()
        };
        Ok(Self {
            backend,
            backend_name,
            timeout: None,
        })
    }

    pub fn from_settings(settings: &DetectorSettings) -> Result<Self> {
        let registry = BackendRegistry::from_settings(settings)?;
        let adapter = Self::from_registry(&registry)?;
        Ok(match settings.timeout {
            Some(timeout) => adapter.with_timeout(timeout),
            None => adapter,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Decode `image` and run the backend on it.
    ///
    /// No retries. With a timeout configured the backend runs on a helper
    /// thread; on expiry the caller gets `InferenceTimeout` while the helper
    /// finishes in the background and its result is dropped.
    pub fn detect(&self, image: &[u8]) -> Result<Vec<Detection>> {
        let decoded = decode_rgb(image)?;
        match self.timeout {
            None => run_backend(&self.backend, &decoded),
            Some(timeout) => self.detect_bounded(decoded, timeout),
        }
    }

    fn detect_bounded(&self, decoded: RgbImage, timeout: Duration) -> Result<Vec<Detection>> {
        let backend = self.backend.clone();
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("inference".to_string())
            .spawn(move || {
                let _ = tx.send(run_backend(&backend, &decoded));
            })
            .map_err(|e| {
                InspectError::ModelUnavailable(format!("failed to spawn inference thread: {e}"))
            })?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "inference on backend {} exceeded {}ms",
                    self.backend_name,
                    timeout.as_millis()
                );
                Err(InspectError::InferenceTimeout(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(InspectError::ModelUnavailable(
                "inference thread exited without a result".into(),
            )),
        }
    }
}

fn decode_rgb(bytes: &[u8]) -> Result<RgbImage> {
    if bytes.is_empty() {
        return Err(InspectError::Acquisition("image is empty".into()));
    }
    let image = image::load_from_memory(bytes)
        .map_err(|e| InspectError::Acquisition(format!("cannot decode image: {e}")))?;
    Ok(image.to_rgb8())
}

fn run_backend(backend: &SharedBackend, image: &RgbImage) -> Result<Vec<Detection>> {
    let mut guard = backend
        .lock()
        .map_err(|_| InspectError::ModelUnavailable("backend lock poisoned".into()))?;
    let started = Instant::now();
    let detections = guard.detect(image.as_raw(), image.width(), image.height())?;
    log::debug!(
        "backend {} produced {} detections in {}ms ({}x{})",
        guard.name(),
        detections.len(),
        started.elapsed().as_millis(),
        image.width(),
        image.height()
    );
    Ok(detections)
}
