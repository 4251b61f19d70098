use super::Uploader;
use crate::error::RestrictionError;
use crate::events::UploadEvent;
use crate::state::{InfoKind, InfoMessage, StatePatch};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::warn;

/// How long `info` messages stay up unless told otherwise
pub const DEFAULT_INFO_DURATION: Duration = Duration::from_millis(3000);

const MAX_ERRORS_SHOWN: usize = 4;

/// An error on its way to the user through events and info messages
#[derive(Debug, Clone)]
pub enum ReportedError {
    Restriction(RestrictionError),
    General {
        message: String,
        details: Option<String>,
        file_id: Option<String>,
        is_user_facing: bool,
    },
}

impl ReportedError {
    fn is_user_facing(&self) -> bool {
        match self {
            ReportedError::Restriction(e) => e.is_user_facing,
            ReportedError::General { is_user_facing, .. } => *is_user_facing,
        }
    }

    fn message_and_details(&self) -> (String, Option<String>) {
        match self {
            ReportedError::Restriction(e) => (e.message.clone(), None),
            ReportedError::General {
                message, details, ..
            } => (message.clone(), details.clone()),
        }
    }
}

impl Uploader {
    /// Queue a transient message. A zero duration never hides on its own.
    pub fn info(
        &self,
        kind: InfoKind,
        message: impl Into<String>,
        details: Option<String>,
        duration: Duration,
    ) -> u64 {
        let id = self.inner.next_info_id.fetch_add(1, Ordering::SeqCst);
        let message = InfoMessage {
            id,
            kind,
            message: message.into(),
            details,
        };
        self.store().update(|state| {
            let mut info = state.info.clone();
            info.push(message);
            StatePatch::new().info(info)
        });

        if !duration.is_zero() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let weak = self.downgrade();
                handle.spawn(async move {
                    tokio::time::sleep(duration).await;
                    if let Some(uploader) = weak.upgrade() {
                        uploader.hide_info_by_id(id);
                    }
                });
            }
        }

        self.emit(UploadEvent::InfoVisible);
        id
    }

    /// Drop the oldest message
    pub fn hide_info(&self) {
        self.store().update(|state| {
            StatePatch::new().info(state.info.iter().skip(1).cloned().collect())
        });
        self.emit(UploadEvent::InfoHidden);
    }

    fn hide_info_by_id(&self, id: u64) {
        let mut found = false;
        self.store().update(|state| {
            found = state.info.iter().any(|m| m.id == id);
            StatePatch::new().info(state.info.iter().filter(|m| m.id != id).cloned().collect())
        });
        if found {
            self.emit(UploadEvent::InfoHidden);
        }
    }

    /// Emit each error, then show the first few user-facing ones as toasts
    /// with one summary message for the rest.
    pub fn inform_and_emit(&self, errors: Vec<ReportedError>) {
        for error in &errors {
            match error {
                ReportedError::Restriction(e) => {
                    warn!(file_id = e.file_id.as_deref(), "{}", e.message);
                    self.emit(UploadEvent::RestrictionFailed {
                        file_id: e.file_id.clone(),
                        error: e.clone(),
                    });
                }
                ReportedError::General {
                    message,
                    details,
                    file_id,
                    ..
                } => {
                    warn!(file_id = file_id.as_deref(), details = details.as_deref(), "{}", message);
                    self.emit(UploadEvent::Error {
                        message: message.clone(),
                        details: details.clone(),
                        file_id: file_id.clone(),
                        response: None,
                    });
                }
            }
        }

        let timeout = Duration::from_millis(self.options().info_timeout);
        let user_facing: Vec<&ReportedError> = errors.iter().filter(|e| e.is_user_facing()).collect();

        for error in user_facing.iter().take(MAX_ERRORS_SHOWN) {
            let (message, details) = error.message_and_details();
            self.info(InfoKind::Error, message, details, timeout);
        }

        let additional = user_facing.len().saturating_sub(MAX_ERRORS_SHOWN);
        if additional > 0 {
            self.info(
                InfoKind::Info,
                format!("{} additional restrictions were not fulfilled", additional),
                None,
                DEFAULT_INFO_DURATION,
            );
        }
    }
}
