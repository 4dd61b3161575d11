use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::build::build_types::PluginDescriptor;

/// Which class loader the daemon should use for a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum LoaderScope {
    /// Reuse the loader registered under `key` across calls.
    Shared { key: String },
    /// Build a fresh loader for this call and drop it afterwards.
    PerCall,
}

/// A plugin together with the loader scope it was resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPlugin {
    pub name: String,
    pub classpath: Vec<PathBuf>,
    pub processors: Vec<String>,
    pub loader: LoaderScope,
}

#[derive(Debug)]
struct SharedLoader {
    classpath: Vec<PathBuf>,
    uses: u64,
}

/// Loader registry shared by every dispatch of one build.
///
/// Passed explicitly through the build context; there is no process-wide instance.
#[derive(Debug, Default)]
pub struct ClassLoaderCache {
    shared: Mutex<AHashMap<String, SharedLoader>>,
}

impl ClassLoaderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, plugin: &PluginDescriptor) -> ResolvedPlugin {
        let loader = if plugin.can_reuse_class_loader {
            let key = loader_key(&plugin.classpath);
            let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
            let entry = shared.entry(key.clone()).or_insert_with(|| {
                log::debug!("Registering shared class loader {} for {}", key, plugin.name);
                SharedLoader {
                    classpath: plugin.classpath.clone(),
                    uses: 0,
                }
            });
            entry.uses += 1;
            LoaderScope::Shared { key }
        } else {
            LoaderScope::PerCall
        };

        ResolvedPlugin {
            name: plugin.name.clone(),
            classpath: plugin.classpath.clone(),
            processors: plugin.processors.clone(),
            loader,
        }
    }

    pub fn resolve_all(&self, plugins: &[PluginDescriptor]) -> Vec<ResolvedPlugin> {
        plugins.iter().map(|plugin| self.resolve(plugin)).collect()
    }

    pub fn shared_loaders(&self) -> usize {
        self.shared.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn uses(&self, key: &str) -> u64 {
        self.shared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|loader| loader.uses)
            .unwrap_or(0)
    }

    pub fn classpath(&self, key: &str) -> Option<Vec<PathBuf>> {
        self.shared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|loader| loader.classpath.clone())
    }
}

fn loader_key(classpath: &[PathBuf]) -> String {
    let mut hasher = blake3::Hasher::new();
    for entry in classpath {
        hasher.update(entry.to_string_lossy().as_bytes());
        hasher.update(&[0]);
    }
    hasher.finalize().to_hex().to_string()
}
