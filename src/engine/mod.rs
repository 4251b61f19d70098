//! The upload engine: one [`Uploader`] owns the state store, the event bus,
//! the installed plugins and the phase pipeline.

// Module declarations
mod connectivity;
mod core_events;
mod files;
mod info;
mod lifecycle;

pub use connectivity::{ConnectivityMonitor, NetworkProbe, CONNECTIVITY_INITIAL_DELAY};
pub use info::{ReportedError, DEFAULT_INFO_DURATION};
pub use lifecycle::AUTO_PROCEED_DELAY;

use crate::config::{Hooks, OptionsPatch, UploaderOptions};
use crate::error::UploadError;
use crate::events::{EventBus, EventKind, ListenerId, UploadEvent};
use crate::plugins::{Phase, Plugin, PluginRegistry, ProcessorRef, ProcessorRegistry};
use crate::progress::{Throttle, PROGRESS_THROTTLE};
use crate::restrictions::Restricter;
use crate::state::{Capabilities, GlobalState, Meta, StatePatch, Store, SubscriptionId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Inner {
    store: Store,
    bus: EventBus,
    options: RwLock<UploaderOptions>,
    hooks: RwLock<Hooks>,
    processors: ProcessorRegistry,
    plugins: PluginRegistry,
    progress_throttle: Throttle,
    /// Upload id -> token cancelled when the batch leaves the live mapping
    abort_tokens: Mutex<HashMap<String, CancellationToken>>,
    auto_proceed_scheduled: AtomicBool,
    was_offline: AtomicBool,
    stalled_warning_until: Mutex<Option<std::time::Instant>>,
    next_info_id: AtomicU64,
    store_subscription: Mutex<Option<SubscriptionId>>,
}

/// Handle to one upload engine. Clones share the same engine.
#[derive(Clone)]
pub struct Uploader {
    inner: Arc<Inner>,
}

/// Non-owning handle, used by timers and listeners the engine itself installs
#[derive(Clone)]
pub struct WeakUploader {
    inner: Weak<Inner>,
}

impl WeakUploader {
    pub fn upgrade(&self) -> Option<Uploader> {
        self.inner.upgrade().map(|inner| Uploader { inner })
    }
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.get_state();
        f.debug_struct("Uploader")
            .field("id", &self.id())
            .field("files", &state.files.len())
            .field("current_uploads", &state.current_uploads.len())
            .field("plugins", &self.inner.plugins)
            .field("processors", &self.inner.processors)
            .finish()
    }
}

impl Default for Uploader {
    fn default() -> Self {
        Self::new(UploaderOptions::default())
    }
}

impl Uploader {
    pub fn new(options: UploaderOptions) -> Self {
        Self::with_hooks(options, Hooks::default())
    }

    pub fn with_hooks(options: UploaderOptions, hooks: Hooks) -> Self {
        let initial = GlobalState {
            meta: options.meta.clone(),
            ..GlobalState::default()
        };
        let id = options.id.clone();

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            Inner {
                store: Store::new(initial),
                bus: EventBus::new(EVENT_CAPACITY),
                options: RwLock::new(options),
                hooks: RwLock::new(hooks),
                processors: ProcessorRegistry::default(),
                plugins: PluginRegistry::default(),
                progress_throttle: Throttle::new(PROGRESS_THROTTLE, move || {
                    if let Some(inner) = weak.upgrade() {
                        Uploader { inner }.update_total_progress();
                    }
                }),
                abort_tokens: Mutex::new(HashMap::new()),
                auto_proceed_scheduled: AtomicBool::new(false),
                was_offline: AtomicBool::new(false),
                stalled_warning_until: Mutex::new(None),
                next_info_id: AtomicU64::new(1),
                store_subscription: Mutex::new(None),
            }
        });
        let uploader = Uploader { inner };

        let weak = uploader.downgrade();
        let subscription = uploader.inner.store.subscribe(Arc::new(move |prev, next, patch| {
            if let Some(uploader) = weak.upgrade() {
                uploader.emit(UploadEvent::StateUpdate {
                    prev: Arc::clone(prev),
                    next: Arc::clone(next),
                    patch: Arc::clone(patch),
                });
            }
        }));
        *lock(&uploader.inner.store_subscription) = Some(subscription);

        debug!(uploader = %id, "Uploader created");
        uploader
    }

    pub fn downgrade(&self) -> WeakUploader {
        WeakUploader {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn id(&self) -> String {
        self.read_options().id.clone()
    }

    fn read_options(&self) -> RwLockReadGuard<'_, UploaderOptions> {
        self.inner
            .options
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn options(&self) -> UploaderOptions {
        self.read_options().clone()
    }

    fn hooks(&self) -> Hooks {
        self.inner
            .hooks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_hooks(&self, hooks: Hooks) {
        *self
            .inner
            .hooks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = hooks;
    }

    fn restricter(&self) -> Restricter {
        Restricter::new(self.read_options().restrictions.clone())
    }

    /// Merge options. Restrictions merge field by field and `meta` goes
    /// through [`Uploader::set_meta`].
    pub fn set_options(&self, patch: OptionsPatch) {
        {
            let mut options = self
                .inner
                .options
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(auto_proceed) = patch.auto_proceed {
                options.auto_proceed = auto_proceed;
            }
            if let Some(allow) = patch.allow_multiple_upload_batches {
                options.allow_multiple_upload_batches = allow;
            }
            if let Some(timeout) = patch.info_timeout {
                options.info_timeout = timeout;
            }
            if let Some(restrictions) = patch.restrictions {
                options.restrictions.merge(restrictions);
            }
            if let Some(meta) = &patch.meta {
                options.meta.extend(meta.clone());
            }
        }

        match patch.meta {
            Some(meta) => self.set_meta(meta),
            // Let plugins re-render against the new options
            None => self.set_state(StatePatch::new()),
        }
    }

    // State

    pub fn get_state(&self) -> Arc<GlobalState> {
        self.inner.store.get_state()
    }

    pub fn set_state(&self, patch: StatePatch) {
        self.inner.store.set_state(patch);
    }

    pub(crate) fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn set_capabilities(&self, capabilities: Capabilities) {
        self.set_state(StatePatch::new().capabilities(capabilities));
    }

    pub fn get_plugin_state(&self, plugin_id: &str) -> Meta {
        self.get_state()
            .plugins
            .get(plugin_id)
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default()
    }

    /// Shallow merge into the plugin's state object
    pub fn set_plugin_state(&self, plugin_id: &str, patch: Meta) {
        self.inner.store.update(|state| {
            let mut plugins = state.plugins.clone();
            let mut current = plugins
                .get(plugin_id)
                .and_then(|v| v.as_object())
                .cloned()
                .unwrap_or_default();
            current.extend(patch);
            plugins.insert(plugin_id.to_string(), serde_json::Value::Object(current));
            StatePatch::new().plugins(plugins)
        });
    }

    // Events

    pub fn events(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn on<F>(&self, kind: EventKind, f: F) -> ListenerId
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.inner.bus.on(kind, f)
    }

    pub fn once<F>(&self, kind: EventKind, f: F) -> ListenerId
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.inner.bus.once(kind, f)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.bus.off(id)
    }

    /// Apply the engine's own handling, then notify listeners
    pub fn emit(&self, event: UploadEvent) {
        self.apply_core_effects(&event);
        self.inner.bus.publish(event);
    }

    // Plugins and processors

    /// Install a plugin. Ids must be unique and non-empty.
    pub fn use_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<&Self, UploadError> {
        self.inner.plugins.insert(Arc::clone(&plugin))?;

        if let Err(e) = plugin.install(self) {
            self.inner.plugins.remove(plugin.id());
            return Err(e);
        }

        info!(uploader = %self.id(), plugin = %plugin.id(), kind = %plugin.kind(), "Using plugin");
        self.emit(UploadEvent::PluginAdded {
            id: plugin.id().to_string(),
            kind: plugin.kind(),
        });
        Ok(self)
    }

    pub fn get_plugin(&self, id: &str) -> Option<Arc<dyn Plugin>> {
        self.inner.plugins.get(id)
    }

    pub fn iterate_plugins<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<dyn Plugin>),
    {
        for plugin in self.inner.plugins.all() {
            f(&plugin);
        }
    }

    pub fn remove_plugin(&self, id: &str) -> Result<(), UploadError> {
        let plugin = self
            .inner
            .plugins
            .get(id)
            .ok_or_else(|| UploadError::Plugin(format!("No plugin named '{}'", id)))?;

        debug!(plugin = %id, "Removing plugin");
        self.emit(UploadEvent::PluginRemove {
            id: id.to_string(),
            kind: plugin.kind(),
        });

        let uninstalled = plugin.uninstall(self);
        self.inner.plugins.remove(id);
        self.inner.store.update(|state| {
            let mut plugins = state.plugins.clone();
            plugins.remove(id);
            StatePatch::new().plugins(plugins)
        });
        uninstalled
    }

    pub fn register_processor(&self, phase: Phase, processor: ProcessorRef) {
        self.inner.processors.register(phase, processor);
    }

    pub fn unregister_processor(&self, phase: Phase, processor: &ProcessorRef) -> bool {
        self.inner.processors.unregister(phase, processor)
    }

    pub fn processor_count(&self, phase: Phase) -> usize {
        self.inner.processors.count(phase)
    }

    /// Cancel everything, uninstall every plugin and detach from the store
    pub fn destroy(&self) {
        info!(uploader = %self.id(), "Closing uploader: removing all files and uninstalling plugins");
        self.cancel_all();

        if let Some(subscription) = lock(&self.inner.store_subscription).take() {
            self.inner.store.unsubscribe(subscription);
        }

        for id in self.inner.plugins.ids() {
            if let Err(e) = self.remove_plugin(&id) {
                warn!(plugin = %id, error = %e, "Plugin failed to uninstall");
            }
        }

        self.inner.progress_throttle.cancel();
        for (_, token) in lock(&self.inner.abort_tokens).drain() {
            token.cancel();
        }
    }
}
