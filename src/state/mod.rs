// Module declarations
mod store;
mod types;

pub use store::{StateListener, Store, SubscriptionId};
pub use types::*;

use serde::Serialize;

/// Root aggregate. Every snapshot is immutable; changes produce a new one.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalState {
    pub files: FileMap,
    pub current_uploads: UploadMap,
    pub total_progress: u8,
    pub allow_new_upload: bool,
    pub error: Option<String>,
    pub info: Vec<InfoMessage>,
    pub meta: Meta,
    /// Plugin id -> plugin state object
    pub plugins: Meta,
    pub capabilities: Capabilities,
    pub recovered_state: Option<RecoveredState>,
}

impl Default for GlobalState {
    fn default() -> Self {
        Self {
            files: FileMap::new(),
            current_uploads: UploadMap::new(),
            total_progress: 0,
            allow_new_upload: true,
            error: None,
            info: Vec::new(),
            meta: Meta::new(),
            plugins: Meta::new(),
            capabilities: Capabilities::default(),
            recovered_state: None,
        }
    }
}

impl GlobalState {
    /// Shallow merge: every field present in the patch replaces the current one
    pub fn apply(&self, patch: &StatePatch) -> GlobalState {
        let mut next = self.clone();
        if let Some(files) = &patch.files {
            next.files = files.clone();
        }
        if let Some(uploads) = &patch.current_uploads {
            next.current_uploads = uploads.clone();
        }
        if let Some(total_progress) = patch.total_progress {
            next.total_progress = total_progress;
        }
        if let Some(allow) = patch.allow_new_upload {
            next.allow_new_upload = allow;
        }
        if let Some(error) = &patch.error {
            next.error = error.clone();
        }
        if let Some(info) = &patch.info {
            next.info = info.clone();
        }
        if let Some(meta) = &patch.meta {
            next.meta = meta.clone();
        }
        if let Some(plugins) = &patch.plugins {
            next.plugins = plugins.clone();
        }
        if let Some(capabilities) = patch.capabilities {
            next.capabilities = capabilities;
        }
        if let Some(recovered) = &patch.recovered_state {
            next.recovered_state = recovered.clone();
        }
        next
    }

    pub fn file(&self, id: &str) -> Option<&FileRecord> {
        self.files.get(id)
    }

    pub fn batch(&self, upload_id: &str) -> Option<&UploadBatch> {
        self.current_uploads.get(upload_id)
    }

    /// Ids claimed by any live batch
    pub fn batched_file_ids(&self) -> Vec<&str> {
        self.current_uploads
            .values()
            .flat_map(|b| b.file_ids.iter().map(String::as_str))
            .collect()
    }

    pub fn files_by_state(&self) -> FilesByState {
        FilesByState::collect(self)
    }
}

/// Partial update of [`GlobalState`]; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    pub files: Option<FileMap>,
    pub current_uploads: Option<UploadMap>,
    pub total_progress: Option<u8>,
    pub allow_new_upload: Option<bool>,
    pub error: Option<Option<String>>,
    pub info: Option<Vec<InfoMessage>>,
    pub meta: Option<Meta>,
    pub plugins: Option<Meta>,
    pub capabilities: Option<Capabilities>,
    pub recovered_state: Option<Option<RecoveredState>>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session-scoped upload fields back to their defaults
    pub fn default_upload_state() -> Self {
        Self {
            total_progress: Some(0),
            allow_new_upload: Some(true),
            error: Some(None),
            recovered_state: Some(None),
            ..Default::default()
        }
    }

    pub fn files(mut self, files: FileMap) -> Self {
        self.files = Some(files);
        self
    }

    pub fn current_uploads(mut self, uploads: UploadMap) -> Self {
        self.current_uploads = Some(uploads);
        self
    }

    pub fn total_progress(mut self, value: u8) -> Self {
        self.total_progress = Some(value);
        self
    }

    pub fn allow_new_upload(mut self, value: bool) -> Self {
        self.allow_new_upload = Some(value);
        self
    }

    pub fn error(mut self, error: Option<String>) -> Self {
        self.error = Some(error);
        self
    }

    pub fn info(mut self, info: Vec<InfoMessage>) -> Self {
        self.info = Some(info);
        self
    }

    pub fn meta(mut self, meta: Meta) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn plugins(mut self, plugins: Meta) -> Self {
        self.plugins = Some(plugins);
        self
    }

    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn recovered_state(mut self, recovered: Option<RecoveredState>) -> Self {
        self.recovered_state = Some(recovered);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == StatePatch::default()
    }
}

/// Files bucketed by lifecycle state, plus summary flags
#[derive(Debug, Clone, Default)]
pub struct FilesByState {
    pub new_files: Vec<FileRecord>,
    pub started_files: Vec<FileRecord>,
    pub upload_started_files: Vec<FileRecord>,
    pub paused_files: Vec<FileRecord>,
    pub complete_files: Vec<FileRecord>,
    pub errored_files: Vec<FileRecord>,
    pub in_progress_files: Vec<FileRecord>,
    pub in_progress_not_paused_files: Vec<FileRecord>,
    pub processing_files: Vec<FileRecord>,
    pub is_upload_started: bool,
    pub is_all_complete: bool,
    pub is_all_errored: bool,
    pub is_all_paused: bool,
    pub is_upload_in_progress: bool,
    pub is_some_ghost: bool,
}

impl FilesByState {
    fn collect(state: &GlobalState) -> Self {
        let mut out = FilesByState::default();

        for file in state.files.values() {
            let progress = &file.progress;

            if !progress.upload_complete && progress.upload_started.is_some() {
                out.in_progress_files.push(file.clone());
                if !file.is_paused {
                    out.in_progress_not_paused_files.push(file.clone());
                }
            }
            if progress.upload_started.is_none() {
                out.new_files.push(file.clone());
            }
            if progress.is_in_progress() {
                out.started_files.push(file.clone());
            }
            if progress.upload_started.is_some() {
                out.upload_started_files.push(file.clone());
            }
            if file.is_paused {
                out.paused_files.push(file.clone());
            }
            if progress.upload_complete {
                out.complete_files.push(file.clone());
            }
            if file.error.is_some() {
                out.errored_files.push(file.clone());
            }
            if progress.is_processing() {
                out.processing_files.push(file.clone());
            }
            if file.is_ghost {
                out.is_some_ghost = true;
            }
        }

        out.is_upload_started = !out.upload_started_files.is_empty();
        out.is_all_complete = state.total_progress == 100
            && out.complete_files.len() == state.files.len()
            && out.processing_files.is_empty();
        out.is_all_errored =
            out.is_upload_started && out.errored_files.len() == out.upload_started_files.len();
        out.is_all_paused =
            !out.in_progress_files.is_empty() && out.paused_files.len() == out.in_progress_files.len();
        out.is_upload_in_progress = !out.in_progress_files.is_empty();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> FileRecord {
        FileRecord {
            id: id.to_string(),
            name: format!("{}.txt", id),
            extension: "txt".to_string(),
            mime_type: "text/plain".to_string(),
            size: Some(10),
            source: String::new(),
            meta: Meta::new(),
            data: None,
            progress: FileProgress::not_started(Some(10)),
            is_remote: false,
            remote: None,
            is_ghost: false,
            is_paused: false,
            error: None,
            upload_url: None,
            response: None,
            relative_path: None,
            missing_required_meta_fields: Vec::new(),
        }
    }

    #[test]
    fn test_apply_replaces_only_patched_fields() {
        let state = GlobalState::default();
        let mut files = FileMap::new();
        files.insert("a".into(), record("a"));

        let next = state.apply(&StatePatch::new().files(files).error(Some("boom".into())));

        assert_eq!(next.files.len(), 1);
        assert_eq!(next.error.as_deref(), Some("boom"));
        assert!(next.allow_new_upload);
        assert_eq!(state.files.len(), 0);

        let cleared = next.apply(&StatePatch::new().error(None));
        assert!(cleared.error.is_none());
        assert_eq!(cleared.files.len(), 1);
    }

    #[test]
    fn test_default_upload_state_patch() {
        let mut state = GlobalState::default();
        state.total_progress = 40;
        state.allow_new_upload = false;
        state.error = Some("x".into());
        state.recovered_state = Some(RecoveredState::default());

        let reset = state.apply(&StatePatch::default_upload_state());
        assert_eq!(reset.total_progress, 0);
        assert!(reset.allow_new_upload);
        assert!(reset.error.is_none());
        assert!(reset.recovered_state.is_none());
    }

    #[test]
    fn test_files_by_state_flags() {
        let mut state = GlobalState::default();
        let mut started = record("started");
        started.progress.upload_started = Some(chrono::Utc::now());
        started.is_paused = true;
        let mut ghost = record("ghost");
        ghost.is_ghost = true;
        state.files.insert(started.id.clone(), started);
        state.files.insert(ghost.id.clone(), ghost);

        let by_state = state.files_by_state();
        assert_eq!(by_state.in_progress_files.len(), 1);
        assert_eq!(by_state.new_files.len(), 1);
        assert!(by_state.is_all_paused);
        assert!(by_state.is_some_ghost);
        assert!(by_state.is_upload_in_progress);
        assert!(!by_state.is_all_complete);
    }
}
