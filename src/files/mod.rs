//! File registry: normalizes raw inputs into [`FileRecord`]s and decides which
//! of them are admitted into the engine.

// Module declarations
mod identity;

pub use identity::{generate_file_id, IdentityParts};

use crate::error::{RestrictionError, RestrictionKind, UploadError};
use crate::restrictions::Restricter;
use crate::state::{FileData, FileMap, FileProgress, FileRecord, Meta};
use bytes::Bytes;
use indexmap::IndexMap;
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::debug;

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Raw, caller-supplied description of a file
#[derive(Debug, Clone, Default)]
pub struct FileDescriptor {
    pub name: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
    pub data: Option<FileData>,
    pub source: Option<String>,
    pub meta: Meta,
    pub is_remote: bool,
    pub remote: Option<serde_json::Value>,
    pub relative_path: Option<String>,
    /// Milliseconds since the unix epoch
    pub last_modified: Option<i64>,
}

impl FileDescriptor {
    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: Some(name.into()),
            data: Some(FileData::Bytes(bytes.into())),
            ..Default::default()
        }
    }

    /// Reads name, size and modification time from the filesystem
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, UploadError> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(UploadError::Other(format!("Not a file: {}", path.display())));
        }

        let last_modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64);

        Ok(Self {
            name: path.file_name().map(|n| n.to_string_lossy().into_owned()),
            size: Some(metadata.len()),
            data: Some(FileData::Path(path.to_path_buf())),
            last_modified,
            ..Default::default()
        })
    }

    /// A file that lives behind a remote provider; it never carries a local payload
    pub fn remote(name: impl Into<String>, size: Option<u64>, remote: serde_json::Value) -> Self {
        Self {
            name: Some(name.into()),
            size,
            is_remote: true,
            remote: Some(remote),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    pub fn with_relative_path(mut self, path: impl Into<String>) -> Self {
        self.relative_path = Some(path.into());
        self
    }
}

/// Verdict of the caller's pre-admission hook
#[derive(Debug, Clone)]
pub enum FileAddDecision {
    Allow,
    /// Drop the file with a non-user-facing error
    Veto,
    /// Admit this record instead
    Replace(FileRecord),
}

pub type BeforeFileAddedHook = Arc<dyn Fn(&FileRecord, &FileMap) -> FileAddDecision + Send + Sync>;

/// Everything the registry needs from the engine
pub struct AdmitContext<'a> {
    pub instance_id: &'a str,
    pub global_meta: &'a Meta,
    pub restricter: &'a Restricter,
    pub before_file_added: Option<&'a BeforeFileAddedHook>,
}

#[derive(Debug, Clone, Default)]
pub struct Admission {
    pub accepted: Vec<FileRecord>,
    pub rejected: Vec<RestrictionError>,
}

fn extension_of(name: &str) -> String {
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_string())
        .unwrap_or_default()
}

fn infer_mime_type(given: Option<&str>, name: Option<&str>) -> String {
    if let Some(t) = given.filter(|t| !t.is_empty()) {
        return t.to_string();
    }
    name.and_then(|n| mime_guess::from_path(n).first())
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string())
}

fn infer_name(given: Option<&str>, mime_type: &str) -> String {
    if let Some(name) = given.filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    match mime_type.split_once('/') {
        Some(("image", subtype)) => format!("image.{}", subtype),
        _ => "noname".to_string(),
    }
}

/// Canonical record for one raw input
pub fn transform(input: FileDescriptor, instance_id: &str, global_meta: &Meta) -> FileRecord {
    let mime_type = infer_mime_type(input.mime_type.as_deref(), input.name.as_deref());
    let name = infer_name(input.name.as_deref(), &mime_type);
    let extension = extension_of(&name);
    let size = input
        .size
        .or_else(|| input.data.as_ref().and_then(FileData::len_hint));
    let source = input.source.unwrap_or_default();

    let id = generate_file_id(&IdentityParts {
        instance_id,
        name: &name,
        mime_type: &mime_type,
        relative_path: input.relative_path.as_deref(),
        size,
        last_modified: input.last_modified,
        source: &source,
    });

    let mut meta = global_meta.clone();
    meta.extend(input.meta);
    meta.insert("name".into(), serde_json::Value::String(name.clone()));
    meta.insert("type".into(), serde_json::Value::String(mime_type.clone()));
    if let Some(path) = &input.relative_path {
        meta.insert("relativePath".into(), serde_json::Value::String(path.clone()));
    }

    FileRecord {
        id,
        name,
        extension,
        mime_type,
        size,
        source,
        meta,
        data: input.data,
        progress: FileProgress::not_started(size),
        is_remote: input.is_remote,
        remote: input.remote,
        is_ghost: false,
        is_paused: false,
        error: None,
        upload_url: None,
        response: None,
        relative_path: input.relative_path,
        missing_required_meta_fields: Vec::new(),
    }
}

/// Refuses ids that are already present
fn default_decision(file: &FileRecord, files: &FileMap) -> FileAddDecision {
    if files.contains_key(&file.id) {
        FileAddDecision::Veto
    } else {
        FileAddDecision::Allow
    }
}

/// Decide which inputs join `existing`.
///
/// Per-file failures only drop that file. An aggregate failure drops the
/// whole batch while still reporting the violation. Nothing is written; the
/// caller commits `accepted`.
pub fn admit(existing: &FileMap, inputs: Vec<FileDescriptor>, ctx: &AdmitContext<'_>) -> Admission {
    let mut working = existing.clone();
    let mut accepted: IndexMap<String, FileRecord> = IndexMap::new();
    let mut rejected = Vec::new();

    for input in inputs {
        let mut file = transform(input, ctx.instance_id, ctx.global_meta);

        let ghost = working.get(&file.id).filter(|f| f.is_ghost).cloned();
        let is_ghost = ghost.is_some();
        if let Some(ghost) = ghost {
            debug!(file_id = %file.id, "Replaced the payload of a restored ghost file");
            file = FileRecord {
                data: file.data,
                is_ghost: false,
                ..ghost
            };
        }

        let decision = match ctx.before_file_added {
            Some(hook) => hook(&file, &working),
            None => default_decision(&file, &working),
        };
        let already_present = working.get(&file.id).is_some_and(|f| !f.is_ghost);

        match decision {
            FileAddDecision::Veto if already_present => {
                rejected.push(
                    RestrictionError::new(
                        RestrictionKind::Duplicate,
                        format!("Cannot add the duplicate file '{}', it already exists", file.name),
                    )
                    .for_file(&file.id, &file.name),
                );
                continue;
            }
            FileAddDecision::Veto if !is_ghost => {
                rejected.push(
                    RestrictionError::new(
                        RestrictionKind::Vetoed,
                        "Cannot add the file because onBeforeFileAdded returned false.",
                    )
                    .silent()
                    .for_file(&file.id, &file.name),
                );
                continue;
            }
            FileAddDecision::Veto | FileAddDecision::Allow => {}
            FileAddDecision::Replace(replacement) => file = replacement,
        }

        if let Err(err) = ctx.restricter.validate_single_file(&file) {
            rejected.push(err);
            continue;
        }

        working.insert(file.id.clone(), file.clone());
        accepted.insert(file.id.clone(), file);
    }

    let adding: Vec<FileRecord> = accepted.into_values().collect();
    let others = existing.values().filter(|f| !adding.iter().any(|a| a.id == f.id));
    if let Err(err) = ctx.restricter.validate_aggregate(others, &adding) {
        rejected.push(err);
        return Admission {
            accepted: Vec::new(),
            rejected,
        };
    }

    Admission {
        accepted: adding,
        rejected,
    }
}
