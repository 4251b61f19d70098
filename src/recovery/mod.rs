//! Saves engine state and file payloads so an interrupted session can be
//! picked up again.

// Module declarations
mod blobs;
mod metadata;

pub use blobs::BlobStore;
pub use metadata::{MetadataStore, SavedMetadata};

use crate::engine::{Uploader, WeakUploader};
use crate::error::UploadError;
use crate::events::{EventKind, ListenerId, UploadEvent};
use crate::plugins::{Plugin, PluginKind};
use crate::shutdown::ShutdownCoordinator;
use crate::state::{FileData, GlobalState, RecoveredState, StatePatch, UploadResult};
use crate::storage::StorageAdapter;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct RecoveryOptions {
    pub id: String,
    pub expiry: Duration,
    /// Blob store name; the uploader id when unset
    pub store_name: Option<String>,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            id: "GoldenRetriever".to_string(),
            expiry: DEFAULT_EXPIRY,
            store_name: None,
        }
    }
}

#[derive(Clone)]
struct Stores {
    metadata: MetadataStore,
    blobs: BlobStore,
}

impl Stores {
    async fn save(&self, state: &GlobalState) -> Result<(), UploadError> {
        let saved = saved_metadata(state);
        if saved.files.is_empty() && saved.current_uploads.is_empty() {
            return self.metadata.remove().await;
        }
        self.metadata.save(saved).await
    }

    async fn handle_complete(
        &self,
        uploader: &Uploader,
        result: &UploadResult,
    ) -> Result<(), UploadError> {
        if !result.successful.is_empty() {
            for file in &result.successful {
                self.blobs.delete(&file.id).await?;
            }
            uploader.set_state(StatePatch::new().recovered_state(None));
            self.metadata.remove().await?;
            info!(
                files = result.successful.len(),
                "Uploads finished, removed saved state"
            );
            return Ok(());
        }

        let all_aborted = !result.failed.is_empty()
            && result.failed.iter().all(|file| {
                file.error
                    .as_deref()
                    .is_some_and(|e| e.contains("Aborted") || e.contains("AbortError"))
            });
        if all_aborted {
            info!("Upload was aborted, preserving state for recovery");
        }
        Ok(())
    }
}

/// Unfinished files plus anything still referenced by a live batch
fn saved_metadata(state: &GlobalState) -> SavedMetadata {
    let batched: HashSet<&str> = state.batched_file_ids().into_iter().collect();
    let files = state
        .files
        .iter()
        .filter(|(id, file)| !file.progress.upload_complete || batched.contains(id.as_str()))
        .map(|(id, file)| (id.clone(), file.clone()))
        .collect();

    SavedMetadata {
        current_uploads: state.current_uploads.clone(),
        files,
        plugin_data: serde_json::Value::Object(state.plugins.clone()),
    }
}

/// Debugger-kind plugin persisting state through a [`StorageAdapter`]
pub struct RecoveryPlugin {
    options: RecoveryOptions,
    storage: Arc<dyn StorageAdapter>,
    stores: Mutex<Option<Stores>>,
    listeners: Mutex<Vec<ListenerId>>,
    shutdown: ShutdownCoordinator,
    /// Stops the saver of the current installation
    session: Mutex<Option<ShutdownCoordinator>>,
}

impl std::fmt::Debug for RecoveryPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryPlugin")
            .field("options", &self.options)
            .field("installed", &self.guard_stores().is_some())
            .finish()
    }
}

fn spawn_on<F>(handle: &Handle, task: F)
where
    F: Future<Output = Result<(), UploadError>> + Send + 'static,
{
    handle.spawn(async move {
        if let Err(e) = task.await {
            warn!(error = %e, "Recovery storage operation failed");
        }
    });
}

impl RecoveryPlugin {
    pub fn new(storage: Arc<dyn StorageAdapter>, options: RecoveryOptions) -> Self {
        Self {
            options,
            storage,
            stores: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            shutdown: ShutdownCoordinator::new(),
            session: Mutex::new(None),
        }
    }

    fn guard_stores(&self) -> MutexGuard<'_, Option<Stores>> {
        self.stores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stores(&self) -> Result<Stores, UploadError> {
        self.guard_stores()
            .clone()
            .ok_or_else(|| UploadError::Plugin(format!("{} is not installed", self.options.id)))
    }

    /// Load saved state into the engine. Returns how many files came back,
    /// or `None` when nothing was saved.
    pub async fn restore(&self, uploader: &Uploader) -> Result<Option<usize>, UploadError> {
        let stores = self.stores()?;
        let Some(saved) = stores.metadata.load().await? else {
            debug!("No saved state to restore");
            return Ok(None);
        };

        let payloads = stores.blobs.list().await?;
        let mut files = saved.files;
        for (id, file) in files.iter_mut() {
            if let Some(bytes) = payloads.get(id) {
                file.data = Some(FileData::Bytes(bytes.clone()));
            }
        }

        let count = files.len();
        info!(files = count, payloads = payloads.len(), "Restoring saved upload state");
        uploader.restore_state(
            RecoveredState {
                files,
                current_uploads: saved.current_uploads,
            },
            saved.plugin_data,
        );
        Ok(Some(count))
    }

    pub async fn handle_complete(
        &self,
        uploader: &Uploader,
        result: &UploadResult,
    ) -> Result<(), UploadError> {
        self.stores()?.handle_complete(uploader, result).await
    }

    /// Drop expired metadata and payloads
    pub async fn cleanup(&self) -> Result<usize, UploadError> {
        let stores = self.stores()?;
        let removed = MetadataStore::cleanup(self.storage.as_ref()).await?
            + stores.blobs.cleanup().await?;
        Ok(removed)
    }

    /// Save the current snapshot right away instead of waiting for the saver
    pub async fn save_now(&self, uploader: &Uploader) -> Result<(), UploadError> {
        self.stores()?.save(&uploader.get_state()).await
    }

    /// Tie the saver to an outer shutdown, e.g. the application's
    pub fn with_shutdown(mut self, shutdown: &ShutdownCoordinator) -> Self {
        self.shutdown = shutdown.child();
        self
    }

    fn start_saver(&self, handle: &Handle, stores: Stores) -> watch::Sender<Option<Arc<GlobalState>>> {
        let (tx, mut rx) = watch::channel::<Option<Arc<GlobalState>>>(None);
        let session = self.shutdown.child();
        let mut shutdown_rx = session.subscribe();
        if let Some(previous) = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(session)
        {
            previous.shutdown();
        }

        handle.spawn(async move {
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = rx.borrow_and_update().clone();
                        if let Some(state) = snapshot {
                            if let Err(e) = stores.save(&state).await {
                                warn!(error = %e, "Failed to save upload state");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Recovery saver shutting down");
                        break;
                    }
                }
            }
        });
        tx
    }

    fn listen(
        &self,
        uploader: &Uploader,
        kind: EventKind,
        f: impl Fn(&UploadEvent) + Send + Sync + 'static,
    ) {
        let id = uploader.on(kind, f);
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(id);
    }
}

impl Plugin for RecoveryPlugin {
    fn id(&self) -> &str {
        &self.options.id
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Debugger
    }

    fn install(&self, uploader: &Uploader) -> Result<(), UploadError> {
        let uploader_id = uploader.id();
        let store_name = self.options.store_name.clone().unwrap_or_else(|| uploader_id.clone());
        let stores = Stores {
            metadata: MetadataStore::new(Arc::clone(&self.storage), &uploader_id, self.options.expiry),
            blobs: BlobStore::new(Arc::clone(&self.storage), &store_name, self.options.expiry),
        };
        *self.guard_stores() = Some(stores.clone());

        let Ok(handle) = Handle::try_current() else {
            warn!(plugin = %self.options.id, "No async runtime available, upload state will not be saved");
            return Ok(());
        };

        let tx = self.start_saver(&handle, stores.clone());
        self.listen(uploader, EventKind::StateUpdate, move |event| {
            if let UploadEvent::StateUpdate { next, .. } = event {
                tx.send_replace(Some(Arc::clone(next)));
            }
        });

        let (blobs, h) = (stores.blobs.clone(), handle.clone());
        self.listen(uploader, EventKind::FileAdded, move |event| {
            if let UploadEvent::FileAdded { file } = event {
                if let Some(FileData::Bytes(bytes)) = &file.data {
                    let (blobs, id, bytes) = (blobs.clone(), file.id.clone(), bytes.clone());
                    spawn_on(&h, async move { blobs.put(&id, bytes).await });
                }
            }
        });

        let (blobs, h) = (stores.blobs.clone(), handle.clone());
        self.listen(uploader, EventKind::FileRemoved, move |event| {
            if let UploadEvent::FileRemoved { file } = event {
                let (blobs, id) = (blobs.clone(), file.id.clone());
                spawn_on(&h, async move { blobs.delete(&id).await });
            }
        });

        let weak: WeakUploader = uploader.downgrade();
        let (complete_stores, h) = (stores.clone(), handle.clone());
        self.listen(uploader, EventKind::Complete, move |event| {
            let UploadEvent::Complete { result } = event else {
                return;
            };
            let Some(uploader) = weak.upgrade() else {
                return;
            };
            let (stores, result) = (complete_stores.clone(), result.clone());
            spawn_on(&h, async move { stores.handle_complete(&uploader, &result).await });
        });

        let storage = Arc::clone(&self.storage);
        spawn_on(&handle, async move {
            let removed =
                MetadataStore::cleanup(storage.as_ref()).await? + stores.blobs.cleanup().await?;
            if removed > 0 {
                debug!(removed, "Removed expired saved state");
            }
            Ok(())
        });

        Ok(())
    }

    fn uninstall(&self, uploader: &Uploader) -> Result<(), UploadError> {
        let ids: Vec<ListenerId> = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for id in ids {
            uploader.off(id);
        }
        if let Some(session) = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            session.shutdown();
        }
        Ok(())
    }
}
