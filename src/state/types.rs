use bytes::Bytes;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Open key/value metadata attached to files and to the engine
pub type Meta = serde_json::Map<String, serde_json::Value>;

/// File id -> record, in insertion order
pub type FileMap = IndexMap<String, FileRecord>;

/// Upload id -> live batch, in creation order
pub type UploadMap = IndexMap<String, UploadBatch>;

/// Payload handle owned by a single FileRecord
#[derive(Debug, Clone, PartialEq)]
pub enum FileData {
    Bytes(Bytes),
    Path(PathBuf),
}

impl FileData {
    /// Byte length when it is known without touching the filesystem
    pub fn len_hint(&self) -> Option<u64> {
        match self {
            FileData::Bytes(b) => Some(b.len() as u64),
            FileData::Path(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressMode {
    Determinate,
    Indeterminate,
}

/// Marker for an in-flight pre- or post-processing phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseProgress {
    pub mode: ProgressMode,
    pub message: Option<String>,
    /// 0.0..=1.0 when determinate
    pub value: Option<f64>,
}

impl PhaseProgress {
    pub fn indeterminate() -> Self {
        Self {
            mode: ProgressMode::Indeterminate,
            message: None,
            value: None,
        }
    }

    pub fn determinate(value: f64, message: Option<String>) -> Self {
        Self {
            mode: ProgressMode::Determinate,
            message,
            value: Some(value.clamp(0.0, 1.0)),
        }
    }
}

/// Per-file transfer progress.
///
/// `bytes_uploaded` is `None` until the transfer has started. `percentage`
/// is `None` while `bytes_total` is unknown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileProgress {
    pub bytes_total: Option<u64>,
    pub bytes_uploaded: Option<u64>,
    pub percentage: Option<u8>,
    pub upload_started: Option<DateTime<Utc>>,
    pub upload_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub preprocess: Option<PhaseProgress>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub postprocess: Option<PhaseProgress>,
}

impl FileProgress {
    pub fn not_started(bytes_total: Option<u64>) -> Self {
        Self {
            bytes_total,
            bytes_uploaded: None,
            percentage: Some(0),
            upload_started: None,
            upload_complete: false,
            preprocess: None,
            postprocess: None,
        }
    }

    /// Started, or sitting in a pre/post-processing phase
    pub fn is_in_progress(&self) -> bool {
        self.upload_started.is_some() || self.preprocess.is_some() || self.postprocess.is_some()
    }

    pub fn is_processing(&self) -> bool {
        self.preprocess.is_some() || self.postprocess.is_some()
    }
}

/// Response reported by a transfer plugin
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub status: Option<u16>,
    pub body: Option<serde_json::Value>,
    #[serde(rename = "uploadURL")]
    pub upload_url: Option<String>,
    pub bytes_uploaded: Option<u64>,
}

/// One user-added file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: String,
    pub name: String,
    pub extension: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub size: Option<u64>,
    pub source: String,
    pub meta: Meta,
    #[serde(skip)]
    pub data: Option<FileData>,
    pub progress: FileProgress,
    pub is_remote: bool,
    #[serde(default)]
    pub remote: Option<serde_json::Value>,
    pub is_ghost: bool,
    #[serde(default)]
    pub is_paused: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(rename = "uploadURL", default)]
    pub upload_url: Option<String>,
    #[serde(default)]
    pub response: Option<UploadResponse>,
    #[serde(default)]
    pub relative_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_required_meta_fields: Vec<String>,
}

impl FileRecord {
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Result partition of a finished batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    #[serde(rename = "uploadID")]
    pub upload_id: Option<String>,
    pub successful: Vec<FileRecord>,
    pub failed: Vec<FileRecord>,
    /// Extra keys merged in through `add_result_data`
    #[serde(default)]
    pub data: Meta,
}

impl UploadResult {
    pub fn empty(upload_id: Option<String>) -> Self {
        Self {
            upload_id,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.successful.is_empty() && self.failed.is_empty()
    }
}

/// One steppable run of the phase pipeline over a fixed set of files
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadBatch {
    #[serde(rename = "fileIDs")]
    pub file_ids: Vec<String>,
    pub step: usize,
    pub result: UploadResult,
}

/// Declared by the active transfer plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub upload_progress: bool,
    pub individual_cancellation: bool,
    pub resumable_uploads: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            upload_progress: true,
            individual_cancellation: true,
            resumable_uploads: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfoKind {
    Info,
    Warning,
    Error,
    Success,
}

/// Transient user-facing message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoMessage {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: InfoKind,
    pub message: String,
    pub details: Option<String>,
}

/// Snapshot handed back by a persistence collaborator after a reload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveredState {
    pub files: FileMap,
    pub current_uploads: UploadMap,
}
