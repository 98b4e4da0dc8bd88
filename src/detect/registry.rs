use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use crate::config::DetectorSettings;

use super::backend::DetectorBackend;
use super::backends::ScriptedBackend;

pub type SharedDetector = Arc<Mutex<dyn DetectorBackend + 'static>>;

/// Thread-safe registry of detector backends.
///
/// Backends are wrapped in `Mutex` because `DetectorBackend::detect` takes
/// `&mut self`. They outlive individual engines, so a re-setup reuses an
/// already loaded model.
pub struct BackendRegistry {
    backends: HashMap<String, SharedDetector>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_name: None,
        }
    }

    /// Build the registry described by the detector settings and select the
    /// configured backend as default.
    pub fn from_settings(settings: &DetectorSettings) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(ScriptedBackend::from_config(&settings.script));

        #[cfg(feature = "backend-tract")]
        if let Some(model_path) = &settings.model_path {
            registry.register(super::backends::TractBackend::new(
                model_path,
                settings.input_size,
            ));
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
            return Err(anyhow!(
                "detector backend '{}' not available (registered: {})",
                name,
                self.list().join(", ")
            ));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<SharedDetector> {
        self.backends.get(name).cloned()
    }

    pub fn default_backend(&self) -> Option<SharedDetector> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
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
    fn unknown_default_is_rejected() {
        let settings = DetectorSettings {
            backend: "yolo-cloud".to_string(),
            ..DetectorSettings::default()
        };
        let err = BackendRegistry::from_settings(&settings).err().unwrap();
        assert!(err.to_string().contains("yolo-cloud"));
    }

    #[test]
    fn scripted_backend_is_always_available() {
        let registry = BackendRegistry::from_settings(&DetectorSettings::default()).unwrap();
        assert_eq!(registry.default_name(), Some("scripted"));
        let backend = registry.default_backend().unwrap();
        assert_eq!(backend.lock().unwrap().name(), "scripted");
    }
}
