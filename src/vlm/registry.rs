use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::backend::VlmBackend;

/// Named VLM backends with a default.
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn VlmBackend>>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_name: None,
        }
    }

    /// Register a backend. The first registered backend becomes the default.
    pub fn register<B: VlmBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.backends.insert(name, Arc::new(backend));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!("backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn VlmBackend>> {
        self.backends.get(name).cloned()
    }

    pub fn default_backend(&self) -> Option<Arc<dyn VlmBackend>> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    /// Registered backend names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve a backend by name, or the default when no name is given.
    pub fn select(&self, name: Option<&str>) -> Result<Arc<dyn VlmBackend>> {
        match name {
            Some(name) => self.get(name).ok_or_else(|| {
                anyhow!(
                    "unknown vlm backend '{}' (registered: {})",
                    name,
                    self.list().join(", ")
                )
            }),
            None => self
                .default_backend()
                .ok_or_else(|| anyhow!("no vlm backend registered")),
        }
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
