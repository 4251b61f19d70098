use crate::error::UploadError;
use crate::files::BeforeFileAddedHook;
use crate::restrictions::Restrictions;
use crate::state::{FileMap, Meta};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_INFO_TIMEOUT_MS: u64 = 5000;

fn default_id() -> String {
    "uppy".to_string()
}

fn default_true() -> bool {
    true
}

fn default_info_timeout() -> u64 {
    DEFAULT_INFO_TIMEOUT_MS
}

/// Serializable engine options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploaderOptions {
    #[serde(default = "default_id")]
    pub id: String,
    #[serde(default)]
    pub auto_proceed: bool,
    #[serde(default = "default_true")]
    pub allow_multiple_upload_batches: bool,
    #[serde(default)]
    pub restrictions: Restrictions,
    #[serde(default)]
    pub meta: Meta,
    /// Milliseconds before a transient message hides itself
    #[serde(default = "default_info_timeout")]
    pub info_timeout: u64,
}

impl Default for UploaderOptions {
    fn default() -> Self {
        Self {
            id: default_id(),
            auto_proceed: false,
            allow_multiple_upload_batches: true,
            restrictions: Restrictions::default(),
            meta: Meta::new(),
            info_timeout: DEFAULT_INFO_TIMEOUT_MS,
        }
    }
}

/// Partial options for `set_options`; restrictions merge field by field
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OptionsPatch {
    pub auto_proceed: Option<bool>,
    pub allow_multiple_upload_batches: Option<bool>,
    pub restrictions: Option<Restrictions>,
    pub meta: Option<Meta>,
    pub info_timeout: Option<u64>,
}

/// Verdict of the pre-upload hook
#[derive(Debug, Clone)]
pub enum UploadDecision {
    Proceed,
    Cancel,
    /// Upload with this file set instead
    Replace(FileMap),
}

pub type BeforeUploadHook = Arc<dyn Fn(&FileMap) -> UploadDecision + Send + Sync>;

/// Caller callbacks; not serializable, so kept apart from the options
#[derive(Clone, Default)]
pub struct Hooks {
    pub on_before_file_added: Option<BeforeFileAddedHook>,
    pub on_before_upload: Option<BeforeUploadHook>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("on_before_file_added", &self.on_before_file_added.is_some())
            .field("on_before_upload", &self.on_before_upload.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingOptions {
    /// Used when RUST_LOG is unset
    pub level: String,
    /// Daily rolling log files go here when set
    pub directory: Option<PathBuf>,
    pub json: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            json: false,
        }
    }
}

/// On-disk configuration for the demo binary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub options: UploaderOptions,
    pub logging: LoggingOptions,
}

pub fn get_config_dir() -> Result<PathBuf, UploadError> {
    dirs::config_dir()
        .map(|dir| dir.join("upload-engine"))
        .ok_or_else(|| UploadError::Config("Could not find config directory".to_string()))
}

pub fn get_config_file_path() -> Result<PathBuf, UploadError> {
    Ok(get_config_dir()?.join("options.json"))
}

fn ensure_dir(dir: &Path) -> Result<(), UploadError> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;

        // Set permissions to 700 (read/write/execute for owner only) on Unix systems
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut permissions = fs::metadata(dir)?.permissions();
            permissions.set_mode(0o700);
            fs::set_permissions(dir, permissions)?;
        }
    }
    Ok(())
}

fn is_toml(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"))
}

/// Missing file yields defaults
pub fn load_config_from(path: &Path) -> Result<AppConfig, UploadError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }

    let content = fs::read_to_string(path)?;
    let config = if is_toml(path) {
        toml::from_str(&content)?
    } else {
        serde_json::from_str(&content)?
    };
    Ok(config)
}

pub fn load_config() -> Result<AppConfig, UploadError> {
    load_config_from(&get_config_file_path()?)
}

pub fn save_config_to(path: &Path, config: &AppConfig) -> Result<(), UploadError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_dir(parent)?;
    }

    let content = if is_toml(path) {
        toml::to_string_pretty(config)?
    } else {
        serde_json::to_string_pretty(config)?
    };
    fs::write(path, content)?;

    // Set permissions to 600 (read/write for owner only) on Unix systems
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut permissions = fs::metadata(path)?.permissions();
        permissions.set_mode(0o600);
        fs::set_permissions(path, permissions)?;
    }

    Ok(())
}

pub fn save_config(config: &AppConfig) -> Result<(), UploadError> {
    save_config_to(&get_config_file_path()?, config)
}
