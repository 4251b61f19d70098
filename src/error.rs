use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which restriction a file (or a whole batch) violated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RestrictionKind {
    MaxFileSize,
    MinFileSize,
    FileType,
    MaxNumberOfFiles,
    MinNumberOfFiles,
    MaxTotalFileSize,
    MissingRequiredMeta { fields: Vec<String> },
    /// Same id already present and not a ghost
    Duplicate,
    /// The pre-admission hook refused the file
    Vetoed,
    /// New uploads are currently disallowed
    NoMoreFilesAllowed,
}

/// A file rejected at admission or at aggregate-check time
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[error("{message}")]
#[serde(rename_all = "camelCase")]
pub struct RestrictionError {
    pub kind: RestrictionKind,
    pub message: String,
    pub is_user_facing: bool,
    pub file_id: Option<String>,
    pub file_name: Option<String>,
}

impl RestrictionError {
    pub fn new(kind: RestrictionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            is_user_facing: true,
            file_id: None,
            file_name: None,
        }
    }

    pub fn silent(mut self) -> Self {
        self.is_user_facing = false;
        self
    }

    pub fn for_file(mut self, id: &str, name: &str) -> Self {
        self.file_id = Some(id.to_string());
        self.file_name = Some(name.to_string());
        self
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(
            self.kind,
            RestrictionKind::MaxNumberOfFiles
                | RestrictionKind::MinNumberOfFiles
                | RestrictionKind::MaxTotalFileSize
        )
    }
}

/// Upload engine errors
#[derive(Debug, Error)]
pub enum UploadError {
    /// File rejected by a configured restriction, a duplicate id, or a hook veto
    #[error("{0}")]
    Restriction(#[from] RestrictionError),

    /// Operation refused by the current upload policy
    #[error("Policy error: {0}")]
    Policy(String),

    /// A registered processor failed while running a batch
    #[error("Phase error: {0}")]
    Phase(String),

    /// The before-upload hook declined to start
    #[error("{0}")]
    Cancelled(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Nonexistent upload: {0}")]
    UnknownUpload(String),

    #[error("Plugin error: {0}")]
    Plugin(String),

    /// Storage adapter failures
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration file errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl UploadError {
    pub fn phase(message: impl Into<String>) -> Self {
        UploadError::Phase(message.into())
    }

    pub fn is_restriction(&self) -> bool {
        matches!(self, UploadError::Restriction(_))
    }

    pub fn restriction(&self) -> Option<&RestrictionError> {
        match self {
            UploadError::Restriction(e) => Some(e),
            _ => None,
        }
    }
}

impl From<UploadError> for String {
    fn from(err: UploadError) -> String {
        err.to_string()
    }
}

impl From<toml::de::Error> for UploadError {
    fn from(err: toml::de::Error) -> Self {
        UploadError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for UploadError {
    fn from(err: toml::ser::Error) -> Self {
        UploadError::Config(err.to_string())
    }
}

impl From<tokio::task::JoinError> for UploadError {
    fn from(err: tokio::task::JoinError) -> Self {
        UploadError::Other(format!("Background task failed: {}", err))
    }
}

/// Helper trait for adding context to errors
pub trait ErrorContext<T> {
    fn context(self, msg: &str) -> Result<T, UploadError>;
}

impl<T, E: Into<UploadError>> ErrorContext<T> for Result<T, E> {
    fn context(self, msg: &str) -> Result<T, UploadError> {
        self.map_err(|e| {
            let err: UploadError = e.into();
            match err {
                UploadError::Policy(s) => UploadError::Policy(format!("{}: {}", msg, s)),
                UploadError::Phase(s) => UploadError::Phase(format!("{}: {}", msg, s)),
                UploadError::Plugin(s) => UploadError::Plugin(format!("{}: {}", msg, s)),
                UploadError::Storage(s) => UploadError::Storage(format!("{}: {}", msg, s)),
                UploadError::Config(s) => UploadError::Config(format!("{}: {}", msg, s)),
                UploadError::Other(s) => UploadError::Other(format!("{}: {}", msg, s)),
                other => other,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = UploadError::Policy("Cannot create a new upload: already uploading.".to_string());
        assert_eq!(
            err.to_string(),
            "Policy error: Cannot create a new upload: already uploading."
        );
    }

    #[test]
    fn test_restriction_error_displays_message_only() {
        let err: UploadError =
            RestrictionError::new(RestrictionKind::MaxNumberOfFiles, "You can only upload 1 file")
                .into();
        assert_eq!(err.to_string(), "You can only upload 1 file");
        assert!(err.is_restriction());
        assert!(err.restriction().unwrap().is_aggregate());
    }

    #[test]
    fn test_error_conversion_to_string() {
        let err = UploadError::Config("Missing id".to_string());
        let s: String = err.into();
        assert_eq!(s, "Configuration error: Missing id");
    }

    #[test]
    fn test_error_context() {
        let result: Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"));
        let result = result.context("Failed to read options file");

        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("I/O error"));

        let result: Result<(), UploadError> = Err(UploadError::Storage("disk full".into()));
        let err_msg = result.context("Saving blob").unwrap_err().to_string();
        assert_eq!(err_msg, "Storage error: Saving blob: disk full");
    }

    #[test]
    fn test_silent_restriction() {
        let err = RestrictionError::new(RestrictionKind::Vetoed, "vetoed")
            .silent()
            .for_file("f1", "a.txt");
        assert!(!err.is_user_facing);
        assert_eq!(err.file_id.as_deref(), Some("f1"));
        assert!(!err.is_aggregate());
    }
}
