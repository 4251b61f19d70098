//! Client-side upload orchestration: files, restrictions, batches, progress,
//! plugins and events around a pluggable transfer step.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod files;
pub mod logging;
pub mod plugins;
pub mod progress;
pub mod recovery;
pub mod restrictions;
pub mod shutdown;
pub mod state;
pub mod storage;

pub use config::{Hooks, OptionsPatch, UploadDecision, UploaderOptions};
pub use engine::{Uploader, WeakUploader};
pub use error::{RestrictionError, RestrictionKind, UploadError};
pub use events::{EventKind, UploadEvent};
pub use files::FileDescriptor;
pub use plugins::{Phase, PhaseContext, Plugin, PluginKind, Processor};
pub use state::{FileRecord, GlobalState, StatePatch, UploadResult};
