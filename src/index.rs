//! Dependency index: backing Service -> dependent APIServices
//!
//! Service and Endpoints events carry no APIService names, so fan-out needs a
//! reverse mapping. The index is updated once per APIService change, removing
//! the old backend entry and inserting the new one in the same critical
//! section, so a lookup never sees a name under two services or a stale one.
//!
//! A forward map (APIService -> Service) is kept alongside the reverse map.
//! The watch stream does not deliver the previous object version, so the
//! index itself is the source of truth for "what did this name point at".

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::apiservice::ServiceKey;

#[derive(Debug, Default)]
struct IndexState {
    /// Service -> APIService names that declare it
    dependents: HashMap<ServiceKey, HashSet<String>>,
    /// APIService name -> the Service it currently declares
    backends: HashMap<String, ServiceKey>,
}

impl IndexState {
    fn unlink(&mut self, name: &str) -> Option<ServiceKey> {
        let old = self.backends.remove(name)?;
        if let Some(names) = self.dependents.get_mut(&old) {
            names.remove(name);
            if names.is_empty() {
                self.dependents.remove(&old);
            }
        }
        Some(old)
    }

    fn link(&mut self, name: &str, backend: ServiceKey) {
        self.dependents
            .entry(backend.clone())
            .or_default()
            .insert(name.to_string());
        self.backends.insert(name.to_string(), backend);
    }
}

/// Thread-safe reverse index from Services to the APIServices backed by them
#[derive(Debug, Default)]
pub struct DependencyIndex {
    state: RwLock<IndexState>,
}

impl DependencyIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the current backend of an APIService
    ///
    /// `None` means the APIService is local. Returns the backend the name was
    /// previously registered under, if any.
    pub fn on_api_service_changed(
        &self,
        name: &str,
        backend: Option<ServiceKey>,
    ) -> Option<ServiceKey> {
        let mut state = self.state.write();
        let old = state.unlink(name);
        if let Some(backend) = backend {
            state.link(name, backend);
        }
        old
    }

    /// Drop an APIService from the index (delete path)
    pub fn remove(&self, name: &str) -> Option<ServiceKey> {
        self.state.write().unlink(name)
    }

    /// APIService names that declare `service` as their backend
    pub fn dependents(&self, service: &ServiceKey) -> Vec<String> {
        self.state
            .read()
            .dependents
            .get(service)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every APIService name that currently has a backend
    pub fn all_dependents(&self) -> Vec<String> {
        self.state.read().backends.keys().cloned().collect()
    }

    #[cfg(test)]
    fn backend_of(&self, name: &str) -> Option<ServiceKey> {
        self.state.read().backends.get(name).cloned()
    }

    /// Keep only the APIServices for which `keep` returns true
    ///
    /// Returns the names that were dropped.
    pub fn retain<F>(&self, mut keep: F) -> Vec<String>
    where
        F: FnMut(&str) -> bool,
    {
        let mut state = self.state.write();
        let stale: Vec<String> = state
            .backends
            .keys()
            .filter(|name| !keep(name))
            .cloned()
            .collect();
        for name in &stale {
            state.unlink(name);
        }
        stale
    }

    /// Number of APIServices with a backend
    pub fn len(&self) -> usize {
        self.state.read().backends.len()
    }

    /// Whether no APIService has a backend
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of distinct Services referenced
    pub fn service_count(&self) -> usize {
        self.state.read().dependents.len()
    }
}
