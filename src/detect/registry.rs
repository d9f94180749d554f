use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::DetectorSettings;
use crate::error::{InspectError, Result};

use super::backend::DetectorBackend;
use super::backends::StubBackend;

pub type SharedBackend = Arc<Mutex<dyn DetectorBackend>>;

/// Thread-safe registry of detector backends.
///
/// Backends are wrapped in `Mutex` because `DetectorBackend::detect` takes `&mut self`.
pub struct BackendRegistry {
    backends: HashMap<String, SharedBackend>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_name: None,
        }
    }

    /// Build the registry described by configuration.
    ///
    /// The stub backend is always available. The tract backend is loaded only
    /// when it is the configured default, so a missing model file fails here
    /// with `ModelUnavailable` instead of at the first submission.
    pub fn from_settings(settings: &DetectorSettings) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(StubBackend::new());

        match settings.backend.as_str() {
            "stub" => {}
            #[cfg(feature = "backend-tract")]
            "tract" => {
                let model_path = settings.model_path.as_ref().ok_or_else(|| {
                    InspectError::ModelUnavailable("tract backend requires a model path".into())
                })?;
                let backend = super::backends::TractBackend::new(model_path, settings.input_size)?
                    .with_thresholds(settings.confidence_threshold, settings.iou_threshold);
                registry.register(backend);
            }
            #[cfg(not(feature = "backend-tract"))]
            "tract" => {
                return Err(InspectError::ModelUnavailable(
                    "tract backend requires the backend-tract feature".into(),
                ));
            }
            other => {
                return Err(InspectError::ModelUnavailable(format!(
                    "unknown detector backend '{}'",
                    other
                )));
            }
        }

        registry.set_default(&settings.backend)?;
        Ok(registry)
    }

    /// Register a backend. The first registered backend becomes the default.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.backends.insert(name, Arc::new(Mutex::new(backend)));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(InspectError::ModelUnavailable(format!(
                "backend '{}' not registered",
                name
            )));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    pub fn get(&self, name: &str) -> Option<SharedBackend> {
        self.backends.get(name).cloned()
    }

    pub fn default_backend(&self) -> Option<SharedBackend> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    /// Registered backend names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_registered_backend_is_default() {
        let mut registry = BackendRegistry::new();
        assert!(registry.default_backend().is_none());
        registry.register(StubBackend::new());
        assert_eq!(registry.default_name(), Some("stub"));
        assert_eq!(registry.list(), vec!["stub".to_string()]);
    }

    #[test]
    fn set_default_rejects_unknown_backend() {
        let mut registry = BackendRegistry::new();
        registry.register(StubBackend::new());
        assert!(matches!(
            registry.set_default("yolo"),
            Err(InspectError::ModelUnavailable(_))
        ));
        assert_eq!(registry.default_name(), Some("stub"));
    }

    #[test]
    fn from_settings_rejects_unknown_backend_name() {
        let settings = DetectorSettings {
            backend: "mystery".to_string(),
            ..DetectorSettings::default()
        };
        assert!(matches!(
            BackendRegistry::from_settings(&settings),
            Err(InspectError::ModelUnavailable(_))
        ));
    }
}
