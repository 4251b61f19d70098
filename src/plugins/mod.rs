//! Plugin contract and the per-engine plugin registry.

// Module declarations
mod mock_uploader;
mod processor;

pub use mock_uploader::{MockUploader, MockUploaderOptions};
pub use processor::{Phase, PhaseContext, Processor, ProcessorRef, ProcessorRegistry};

use crate::engine::Uploader;
use crate::error::UploadError;
use crate::state::GlobalState;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

/// Declared category of a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Acquirer,
    Modifier,
    Uploader,
    Presenter,
    Orchestrator,
    Progressindicator,
    Editor,
    Debugger,
    Logger,
}

impl PluginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginKind::Acquirer => "acquirer",
            PluginKind::Modifier => "modifier",
            PluginKind::Uploader => "uploader",
            PluginKind::Presenter => "presenter",
            PluginKind::Orchestrator => "orchestrator",
            PluginKind::Progressindicator => "progressindicator",
            PluginKind::Editor => "editor",
            PluginKind::Debugger => "debugger",
            PluginKind::Logger => "logger",
        }
    }
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something installed into an [`Uploader`].
///
/// `install` is where a plugin registers processors and event listeners.
/// Anything it registers must be torn down again in `uninstall`.
pub trait Plugin: Send + Sync + std::fmt::Debug {
    fn id(&self) -> &str;

    fn kind(&self) -> PluginKind;

    fn install(&self, uploader: &Uploader) -> Result<(), UploadError>;

    fn uninstall(&self, _uploader: &Uploader) -> Result<(), UploadError> {
        Ok(())
    }

    /// Called with every new state snapshot
    fn update(&self, _state: &GlobalState) {}
}

/// Installed plugins, keyed by id, in installation order
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Mutex<IndexMap<String, Arc<dyn Plugin>>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.ids())
            .finish()
    }
}

impl PluginRegistry {
    fn guard(&self) -> MutexGuard<'_, IndexMap<String, Arc<dyn Plugin>>> {
        self.plugins
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fails on an empty or already-registered id
    pub fn insert(&self, plugin: Arc<dyn Plugin>) -> Result<(), UploadError> {
        let id = plugin.id().to_string();
        if id.is_empty() {
            return Err(UploadError::Plugin(
                "Your plugin must have an id".to_string(),
            ));
        }

        let mut plugins = self.guard();
        if let Some(existing) = plugins.get(&id) {
            return Err(UploadError::Plugin(format!(
                "Already found a plugin named '{}'. Tried to use: '{}'. Uppy plugins must have unique `id` options.",
                existing.id(),
                id
            )));
        }
        plugins.insert(id, plugin);
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<dyn Plugin>> {
        self.guard().shift_remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Plugin>> {
        self.guard().get(id).cloned()
    }

    /// Snapshot, so callers may re-enter the registry while iterating
    pub fn all(&self) -> Vec<Arc<dyn Plugin>> {
        self.guard().values().cloned().collect()
    }

    pub fn of_kind(&self, kind: PluginKind) -> Vec<Arc<dyn Plugin>> {
        self.guard()
            .values()
            .filter(|p| p.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.guard().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }
}
