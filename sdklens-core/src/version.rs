//! Exact-match selection of the registry for a running build.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::{LayoutError, Result};
use crate::layout::LayoutRegistry;
use crate::snapshot;

/// Registries keyed by build identifier. Identifiers are compared as exact strings.
#[derive(Debug, Default, Clone)]
pub struct VersionResolver {
    registries: BTreeMap<String, Arc<LayoutRegistry>>,
}

impl VersionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a registry under its own build identifier, replacing any previous one.
    pub fn register(&mut self, registry: LayoutRegistry) -> Arc<LayoutRegistry> {
        self.register_shared(Arc::new(registry))
    }

    pub fn register_shared(&mut self, registry: Arc<LayoutRegistry>) -> Arc<LayoutRegistry> {
        let build = registry.build_version().to_string();
        if self.registries.insert(build.clone(), Arc::clone(&registry)).is_some() {
            log::debug!("build {build}: replaced registered layouts");
        } else {
            log::debug!("build {build}: registered {} structures", registry.len());
        }
        registry
    }

    pub fn unregister(&mut self, build: &str) -> Option<Arc<LayoutRegistry>> {
        self.registries.remove(build)
    }

    pub fn resolve(&self, build: &str) -> Result<Arc<LayoutRegistry>> {
        self.registries
            .get(build)
            .cloned()
            .ok_or_else(|| LayoutError::NoMatchingVersion {
                build: build.to_string(),
            })
    }

    pub fn contains(&self, build: &str) -> bool {
        self.registries.contains_key(build)
    }

    /// Registered build identifiers in sorted order.
    pub fn builds(&self) -> impl Iterator<Item = &str> {
        self.registries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.registries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registries.is_empty()
    }

    /// Register every snapshot file in `dir`. Unreadable snapshots are logged and skipped.
    ///
    /// Returns the number of registries loaded.
    pub fn load_dir(&mut self, dir: impl AsRef<Path>) -> Result<usize> {
        let dir = dir.as_ref();
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(snapshot::EXTENSION) {
                entries.push(path);
            }
        }
        entries.sort();

        let mut loaded = 0;
        for path in entries {
            match snapshot::load(&path) {
                Ok(registry) => {
                    self.register(registry);
                    loaded += 1;
                }
                Err(e) => log::warn!("skipping snapshot {}: {e}", path.display()),
            }
        }
        log::info!("loaded {loaded} snapshot(s) from {}", dir.display());
        Ok(loaded)
    }
}
