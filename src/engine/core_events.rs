//! Handling the engine applies to its own events before listeners see them.

use super::{lock, ReportedError, Uploader};
use crate::events::{ProgressReport, UploadEvent};
use crate::plugins::Phase;
use crate::progress::{apply_progress_report, total_progress_percent};
use crate::state::{FileProgress, InfoKind, PhaseProgress, StatePatch, UploadResponse};
use chrono::Utc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

fn join_details(message: &str, details: Option<&str>) -> String {
    match details.filter(|d| !d.is_empty()) {
        Some(details) => format!("{} {}", message, details),
        None => message.to_string(),
    }
}

impl Uploader {
    pub(super) fn apply_core_effects(&self, event: &UploadEvent) {
        match event {
            UploadEvent::Error {
                message,
                details,
                file_id,
                response,
            } => self.handle_error(message, details.as_deref(), file_id.as_deref(), response.clone()),
            UploadEvent::UploadError {
                file_id,
                error,
                response,
            } => self.handle_upload_error(file_id, error, response.clone()),
            UploadEvent::UploadStalled { message, file_ids } => {
                self.handle_upload_stalled(message, file_ids)
            }
            UploadEvent::Upload { .. } => self.set_state(StatePatch::new().error(None)),
            UploadEvent::UploadStart { file_ids } => self.mark_upload_started(file_ids),
            UploadEvent::UploadProgress { file_id, progress } => {
                self.handle_upload_progress(file_id, progress)
            }
            UploadEvent::UploadSuccess { file_id, response } => {
                self.handle_upload_success(file_id, response)
            }
            UploadEvent::PreprocessProgress { file_id, progress } => {
                let progress = progress.clone();
                self.patch_file(file_id, |file| file.progress.preprocess = Some(progress));
            }
            UploadEvent::PreprocessComplete { file_id } => {
                self.patch_file(file_id, |file| file.progress.preprocess = None);
            }
            UploadEvent::PostprocessProgress { file_id, progress } => {
                let progress = progress.clone();
                self.patch_file(file_id, |file| file.progress.postprocess = Some(progress));
            }
            UploadEvent::PostprocessComplete { file_id } => {
                self.patch_file(file_id, |file| file.progress.postprocess = None);
            }
            UploadEvent::Restored { .. } => self.inner.progress_throttle.call(),
            UploadEvent::StateUpdate { next, .. } => {
                self.iterate_plugins(|plugin| plugin.update(next));
            }
            _ => {}
        }
    }

    fn handle_error(
        &self,
        message: &str,
        details: Option<&str>,
        file_id: Option<&str>,
        response: Option<UploadResponse>,
    ) {
        let error = join_details(message, details);
        self.set_state(StatePatch::new().error(Some(error.clone())));

        if let Some(file_id) = file_id {
            self.patch_file(file_id, |file| {
                file.error = Some(error);
                file.response = response;
            });
        }
    }

    fn handle_upload_error(&self, file_id: &str, error: &str, response: Option<UploadResponse>) {
        self.handle_error(error, None, Some(file_id), response);
        warn!(file_id = %file_id, error = %error, "Upload failed");

        let name = self.get_file(file_id).map(|f| f.name).unwrap_or_default();
        self.inform_and_emit(vec![ReportedError::General {
            message: format!("Failed to upload {}", name),
            details: Some(error.to_string()),
            file_id: None,
            is_user_facing: true,
        }]);
    }

    fn handle_upload_stalled(&self, message: &str, file_ids: &[String]) {
        let names: Vec<String> = self
            .get_files_by_ids(file_ids)
            .into_iter()
            .map(|f| f.name)
            .collect();
        let names = names.join(", ");

        let timeout = Duration::from_millis(self.options().info_timeout);
        let show = {
            let mut until = lock(&self.inner.stalled_warning_until);
            let now = Instant::now();
            if until.is_some_and(|t| now < t) {
                false
            } else {
                *until = Some(now + timeout);
                true
            }
        };

        if show {
            self.info(InfoKind::Warning, message, Some(names.clone()), timeout);
        }
        warn!(files = %names, "{}", message);
    }

    fn mark_upload_started(&self, file_ids: &[String]) {
        let now = Utc::now();
        self.store().update(|state| {
            let mut files = state.files.clone();
            for id in file_ids {
                if let Some(file) = files.get_mut(id) {
                    file.progress = FileProgress {
                        upload_started: Some(now),
                        upload_complete: false,
                        percentage: Some(0),
                        bytes_uploaded: Some(0),
                        bytes_total: file.size,
                        ..file.progress.clone()
                    };
                }
            }
            StatePatch::new().files(files)
        });
    }

    /// Per-file progress. Reports for removed or already finished files are dropped.
    pub(super) fn handle_upload_progress(&self, file_id: &str, report: &ProgressReport) {
        let Some(file) = self.get_file(file_id) else {
            debug!(file_id = %file_id, "Not setting progress for a file that has been removed");
            return;
        };
        if file.progress.percentage == Some(100) {
            debug!(file_id = %file_id, "Not setting progress for a file that has been already uploaded");
            return;
        }

        self.patch_file(file_id, |file| {
            file.progress = apply_progress_report(&file.progress, report);
        });
        self.inner.progress_throttle.call();
    }

    fn handle_upload_success(&self, file_id: &str, response: &UploadResponse) {
        let needs_postprocess = self.processor_count(Phase::Post) > 0;
        let response = response.clone();

        let updated = self.patch_file(file_id, |file| {
            let bytes_total = file.progress.bytes_total;
            file.progress.postprocess = needs_postprocess.then(PhaseProgress::indeterminate);
            file.progress.upload_complete = true;
            file.progress.percentage = Some(100);
            file.progress.bytes_uploaded = bytes_total.or(response.bytes_uploaded);
            if file.size.is_none() {
                file.size = response.bytes_uploaded.or(bytes_total);
            }
            file.upload_url = response.upload_url.clone();
            file.response = Some(response);
            file.is_paused = false;
        });

        if !updated {
            debug!(file_id = %file_id, "Not setting success for a file that has been removed");
            return;
        }
        self.inner.progress_throttle.call();
    }

    /// Recompute `total_progress` and emit `progress`
    pub fn update_total_progress(&self) {
        let percent = self.calculate_total_progress().unwrap_or(0);
        self.emit(UploadEvent::Progress { percent });
        self.set_state(StatePatch::new().total_progress(percent));
    }

    /// `None` while the total is unknowable
    pub fn calculate_total_progress(&self) -> Option<u8> {
        total_progress_percent(&self.get_state().files)
    }

    pub(crate) fn flush_progress(&self) {
        self.inner.progress_throttle.flush();
    }
}
