use crate::error::RestrictionError;
use crate::plugins::PluginKind;
use crate::state::{
    FileRecord, GlobalState, PhaseProgress, StatePatch, UploadResponse, UploadResult,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Sequence number for ordering events
pub type EventSequence = u64;

/// Byte counters reported by a transfer function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    pub bytes_uploaded: u64,
    pub bytes_total: Option<u64>,
}

/// Every notification the engine emits
#[derive(Debug, Clone)]
pub enum UploadEvent {
    FileAdded {
        file: FileRecord,
    },
    FilesAdded {
        files: Vec<FileRecord>,
    },
    FileRemoved {
        file: FileRecord,
    },
    /// A batch was created
    Upload {
        upload_id: String,
        file_ids: Vec<String>,
    },
    /// Transfer began for these files
    UploadStart {
        file_ids: Vec<String>,
    },
    UploadProgress {
        file_id: String,
        progress: ProgressReport,
    },
    UploadSuccess {
        file_id: String,
        response: UploadResponse,
    },
    UploadError {
        file_id: String,
        error: String,
        response: Option<UploadResponse>,
    },
    UploadPause {
        file_id: String,
        is_paused: bool,
    },
    UploadRetry {
        file_id: String,
    },
    UploadStalled {
        message: String,
        file_ids: Vec<String>,
    },
    RetryAll {
        file_ids: Vec<String>,
    },
    PauseAll,
    ResumeAll,
    CancelAll,
    ResetProgress,
    PreprocessProgress {
        file_id: String,
        progress: PhaseProgress,
    },
    PreprocessComplete {
        file_id: String,
    },
    PostprocessProgress {
        file_id: String,
        progress: PhaseProgress,
    },
    PostprocessComplete {
        file_id: String,
    },
    RestrictionFailed {
        file_id: Option<String>,
        error: RestrictionError,
    },
    Error {
        message: String,
        details: Option<String>,
        file_id: Option<String>,
        response: Option<UploadResponse>,
    },
    /// Terminal notification, fired after the result is committed
    Complete {
        result: UploadResult,
    },
    /// Whole-number total progress
    Progress {
        percent: u8,
    },
    StateUpdate {
        prev: Arc<GlobalState>,
        next: Arc<GlobalState>,
        patch: Arc<StatePatch>,
    },
    InfoVisible,
    InfoHidden,
    IsOnline,
    IsOffline,
    BackOnline,
    PluginAdded {
        id: String,
        kind: PluginKind,
    },
    PluginRemove {
        id: String,
        kind: PluginKind,
    },
    Restored {
        plugin_data: serde_json::Value,
    },
}

/// Payload-free discriminant of [`UploadEvent`], used to filter listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    FileAdded,
    FilesAdded,
    FileRemoved,
    Upload,
    UploadStart,
    UploadProgress,
    UploadSuccess,
    UploadError,
    UploadPause,
    UploadRetry,
    UploadStalled,
    RetryAll,
    PauseAll,
    ResumeAll,
    CancelAll,
    ResetProgress,
    PreprocessProgress,
    PreprocessComplete,
    PostprocessProgress,
    PostprocessComplete,
    RestrictionFailed,
    Error,
    Complete,
    Progress,
    StateUpdate,
    InfoVisible,
    InfoHidden,
    IsOnline,
    IsOffline,
    BackOnline,
    PluginAdded,
    PluginRemove,
    Restored,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::FileAdded => "file-added",
            EventKind::FilesAdded => "files-added",
            EventKind::FileRemoved => "file-removed",
            EventKind::Upload => "upload",
            EventKind::UploadStart => "upload-start",
            EventKind::UploadProgress => "upload-progress",
            EventKind::UploadSuccess => "upload-success",
            EventKind::UploadError => "upload-error",
            EventKind::UploadPause => "upload-pause",
            EventKind::UploadRetry => "upload-retry",
            EventKind::UploadStalled => "upload-stalled",
            EventKind::RetryAll => "retry-all",
            EventKind::PauseAll => "pause-all",
            EventKind::ResumeAll => "resume-all",
            EventKind::CancelAll => "cancel-all",
            EventKind::ResetProgress => "reset-progress",
            EventKind::PreprocessProgress => "preprocess-progress",
            EventKind::PreprocessComplete => "preprocess-complete",
            EventKind::PostprocessProgress => "postprocess-progress",
            EventKind::PostprocessComplete => "postprocess-complete",
            EventKind::RestrictionFailed => "restriction-failed",
            EventKind::Error => "error",
            EventKind::Complete => "complete",
            EventKind::Progress => "progress",
            EventKind::StateUpdate => "state-update",
            EventKind::InfoVisible => "info-visible",
            EventKind::InfoHidden => "info-hidden",
            EventKind::IsOnline => "is-online",
            EventKind::IsOffline => "is-offline",
            EventKind::BackOnline => "back-online",
            EventKind::PluginAdded => "plugin-added",
            EventKind::PluginRemove => "plugin-remove",
            EventKind::Restored => "restored",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl UploadEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            UploadEvent::FileAdded { .. } => EventKind::FileAdded,
            UploadEvent::FilesAdded { .. } => EventKind::FilesAdded,
            UploadEvent::FileRemoved { .. } => EventKind::FileRemoved,
            UploadEvent::Upload { .. } => EventKind::Upload,
            UploadEvent::UploadStart { .. } => EventKind::UploadStart,
            UploadEvent::UploadProgress { .. } => EventKind::UploadProgress,
            UploadEvent::UploadSuccess { .. } => EventKind::UploadSuccess,
            UploadEvent::UploadError { .. } => EventKind::UploadError,
            UploadEvent::UploadPause { .. } => EventKind::UploadPause,
            UploadEvent::UploadRetry { .. } => EventKind::UploadRetry,
            UploadEvent::UploadStalled { .. } => EventKind::UploadStalled,
            UploadEvent::RetryAll { .. } => EventKind::RetryAll,
            UploadEvent::PauseAll => EventKind::PauseAll,
            UploadEvent::ResumeAll => EventKind::ResumeAll,
            UploadEvent::CancelAll => EventKind::CancelAll,
            UploadEvent::ResetProgress => EventKind::ResetProgress,
            UploadEvent::PreprocessProgress { .. } => EventKind::PreprocessProgress,
            UploadEvent::PreprocessComplete { .. } => EventKind::PreprocessComplete,
            UploadEvent::PostprocessProgress { .. } => EventKind::PostprocessProgress,
            UploadEvent::PostprocessComplete { .. } => EventKind::PostprocessComplete,
            UploadEvent::RestrictionFailed { .. } => EventKind::RestrictionFailed,
            UploadEvent::Error { .. } => EventKind::Error,
            UploadEvent::Complete { .. } => EventKind::Complete,
            UploadEvent::Progress { .. } => EventKind::Progress,
            UploadEvent::StateUpdate { .. } => EventKind::StateUpdate,
            UploadEvent::InfoVisible => EventKind::InfoVisible,
            UploadEvent::InfoHidden => EventKind::InfoHidden,
            UploadEvent::IsOnline => EventKind::IsOnline,
            UploadEvent::IsOffline => EventKind::IsOffline,
            UploadEvent::BackOnline => EventKind::BackOnline,
            UploadEvent::PluginAdded { .. } => EventKind::PluginAdded,
            UploadEvent::PluginRemove { .. } => EventKind::PluginRemove,
            UploadEvent::Restored { .. } => EventKind::Restored,
        }
    }

    /// The single file this event is about, if any
    pub fn file_id(&self) -> Option<&str> {
        match self {
            UploadEvent::FileAdded { file } | UploadEvent::FileRemoved { file } => {
                Some(file.id.as_str())
            }
            UploadEvent::UploadProgress { file_id, .. }
            | UploadEvent::UploadSuccess { file_id, .. }
            | UploadEvent::UploadError { file_id, .. }
            | UploadEvent::UploadPause { file_id, .. }
            | UploadEvent::UploadRetry { file_id }
            | UploadEvent::PreprocessProgress { file_id, .. }
            | UploadEvent::PreprocessComplete { file_id }
            | UploadEvent::PostprocessProgress { file_id, .. }
            | UploadEvent::PostprocessComplete { file_id } => Some(file_id.as_str()),
            UploadEvent::RestrictionFailed { file_id, .. } | UploadEvent::Error { file_id, .. } => {
                file_id.as_deref()
            }
            _ => None,
        }
    }
}

/// Sequenced, timestamped event as seen by async subscribers
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub sequence: EventSequence,
    pub timestamp: DateTime<Utc>,
    pub event: UploadEvent,
}
