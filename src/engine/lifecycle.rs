//! Batches and the upload lifecycle: create, run, retry, pause, cancel, restore.

use super::{lock, ReportedError, Uploader};
use crate::config::UploadDecision;
use crate::error::{RestrictionError, RestrictionKind, UploadError};
use crate::events::UploadEvent;
use crate::plugins::{Phase, PhaseContext};
use crate::restrictions::Restricter;
use crate::state::{
    FileMap, FileProgress, GlobalState, Meta, RecoveredState, StatePatch, UploadBatch,
    UploadResult,
};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Debounce between adding files and an automatic upload
pub const AUTO_PROCEED_DELAY: Duration = Duration::from_millis(4);

impl Uploader {
    pub(super) fn start_if_auto_proceed(&self) {
        if !self.read_options().auto_proceed {
            return;
        }
        if self.inner.auto_proceed_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.inner.auto_proceed_scheduled.store(false, Ordering::SeqCst);
            debug!("No async runtime available, skipping automatic upload");
            return;
        };

        let uploader = self.clone();
        handle.spawn(async move {
            tokio::time::sleep(AUTO_PROCEED_DELAY).await;
            uploader
                .inner
                .auto_proceed_scheduled
                .store(false, Ordering::SeqCst);
            if let Err(e) = uploader.upload().await {
                if !e.is_restriction() {
                    warn!(error = %e, "Automatic upload failed");
                }
            }
        });
    }

    /// Token for a live batch, created on first use (restored batches have none yet)
    fn batch_token(&self, upload_id: &str) -> CancellationToken {
        lock(&self.inner.abort_tokens)
            .entry(upload_id.to_string())
            .or_default()
            .clone()
    }

    fn remove_batch(&self, upload_id: &str) {
        self.store().update(|state| {
            let mut uploads = state.current_uploads.clone();
            uploads.shift_remove(upload_id);
            StatePatch::new().current_uploads(uploads)
        });
        self.cancel_batch_token(upload_id);
    }

    /// Register a new batch at step 0.
    ///
    /// Refused while new uploads are disallowed, unless forced (retries).
    pub fn create_batch(
        &self,
        file_ids: Vec<String>,
        force_allow_new_upload: bool,
    ) -> Result<String, UploadError> {
        self.create_batch_with(|_| file_ids, force_allow_new_upload)
    }

    /// Like `create_batch`, with the members picked from the same snapshot
    /// the batch is inserted into, so concurrent callers never claim a file
    /// twice.
    fn create_batch_with<F>(
        &self,
        select: F,
        force_allow_new_upload: bool,
    ) -> Result<String, UploadError>
    where
        F: FnOnce(&GlobalState) -> Vec<String>,
    {
        let upload_id = Uuid::new_v4().to_string();
        let allow_multiple = self.read_options().allow_multiple_upload_batches;
        let mut file_ids: Vec<String> = Vec::new();

        self.store().try_update(|state| {
            if !state.allow_new_upload && !force_allow_new_upload {
                return Err(UploadError::Policy(
                    "Cannot create a new upload: already uploading.".to_string(),
                ));
            }
            file_ids = select(state);
            let mut uploads = state.current_uploads.clone();
            uploads.insert(
                upload_id.clone(),
                UploadBatch {
                    file_ids: file_ids.clone(),
                    step: 0,
                    result: UploadResult::empty(Some(upload_id.clone())),
                },
            );
            Ok(StatePatch::new()
                .current_uploads(uploads)
                .allow_new_upload(allow_multiple))
        })?;

        lock(&self.inner.abort_tokens).insert(upload_id.clone(), CancellationToken::new());
        info!(upload_id = %upload_id, files = file_ids.len(), "Created upload batch");
        self.emit(UploadEvent::Upload {
            upload_id: upload_id.clone(),
            file_ids,
        });
        Ok(upload_id)
    }

    /// Run a batch from its persisted step to the end of the pipeline.
    ///
    /// A failing processor tears the batch down and its error is returned.
    /// A batch removed while running yields an empty result.
    pub async fn run_batch(&self, upload_id: &str) -> Result<UploadResult, UploadError> {
        let steps = self.inner.processors.pipeline();
        let token = self.batch_token(upload_id);
        let start = self
            .get_state()
            .batch(upload_id)
            .map(|b| b.step)
            .unwrap_or(steps.len());

        for (step, (phase, processor)) in steps.iter().enumerate().skip(start) {
            let persisted: Result<(), ()> = self.store().try_update(|state| {
                let mut uploads = state.current_uploads.clone();
                let batch = uploads.get_mut(upload_id).ok_or(())?;
                batch.step = step;
                Ok(StatePatch::new().current_uploads(uploads))
            });
            if persisted.is_err() {
                break;
            }

            // Files may have been removed while the previous step ran
            let file_ids = self
                .get_state()
                .batch(upload_id)
                .map(|b| b.file_ids.clone())
                .unwrap_or_default();
            debug!(upload_id = %upload_id, step, phase = %phase, files = file_ids.len(), "Running upload step");

            let ctx = PhaseContext {
                upload_id: upload_id.to_string(),
                file_ids,
                phase: *phase,
                uploader: self.clone(),
                cancel: token.clone(),
            };
            if let Err(e) = processor.process(ctx).await {
                error!(upload_id = %upload_id, step, phase = %phase, error = %e, "Upload step failed");
                self.remove_batch(upload_id);
                return Err(match e {
                    UploadError::Phase(_) => e,
                    other => UploadError::phase(other.to_string()),
                });
            }
        }

        let Some(batch) = self.get_state().batch(upload_id).cloned() else {
            debug!(upload_id = %upload_id, "Not setting result for an upload that has been removed");
            self.flush_progress();
            return Ok(UploadResult::empty(Some(upload_id.to_string())));
        };

        for file in self.get_files_by_ids(&batch.file_ids) {
            if file.progress.postprocess.is_some() {
                self.emit(UploadEvent::PostprocessComplete { file_id: file.id });
            }
        }

        let (failed, successful): (Vec<_>, Vec<_>) = self
            .get_files_by_ids(&batch.file_ids)
            .into_iter()
            .partition(|f| f.error.is_some());
        let total_steps = steps.len();
        let committed: Result<(), ()> = self.store().try_update(|state| {
            let mut uploads = state.current_uploads.clone();
            let batch = uploads.get_mut(upload_id).ok_or(())?;
            batch.step = total_steps;
            batch.result.upload_id = Some(upload_id.to_string());
            batch.result.successful = successful;
            batch.result.failed = failed;
            Ok(StatePatch::new().current_uploads(uploads))
        });

        let result = committed
            .ok()
            .and_then(|_| self.get_state().batch(upload_id).map(|b| b.result.clone()))
            .unwrap_or_else(|| UploadResult::empty(Some(upload_id.to_string())));
        self.remove_batch(upload_id);
        self.flush_progress();

        info!(
            upload_id = %upload_id,
            successful = result.successful.len(),
            failed = result.failed.len(),
            "Upload batch finished"
        );
        Ok(result)
    }

    /// Start uploading every file not yet started and not claimed by a batch.
    ///
    /// Files that failed earlier are retried first; when nothing new is left
    /// the retry result is returned.
    pub async fn upload(&self) -> Result<UploadResult, UploadError> {
        match self.run_upload().await {
            Ok(result) => Ok(result),
            Err(e @ UploadError::Cancelled(_)) => {
                info!("{}", e);
                Err(e)
            }
            Err(e) => {
                error!(error = %e, "Upload failed");
                self.emit(UploadEvent::Error {
                    message: e.to_string(),
                    details: None,
                    file_id: None,
                    response: None,
                });
                Err(e)
            }
        }
    }

    async fn run_upload(&self) -> Result<UploadResult, UploadError> {
        if self.processor_count(Phase::Transfer) == 0 {
            warn!("No uploader type plugins are used");
        }

        let mut files = self.get_state().files.clone();

        if files.values().any(|f| f.error.is_some()) {
            let retry_result = self.do_retry_all().await?;
            let has_new_files = self
                .get_state()
                .files
                .values()
                .any(|f| f.progress.upload_started.is_none());
            if !has_new_files {
                self.emit(UploadEvent::Complete {
                    result: retry_result.clone(),
                });
                return Ok(retry_result);
            }
            files = self.get_state().files.clone();
        }

        if let Some(hook) = self.hooks().on_before_upload {
            match hook(&files) {
                UploadDecision::Proceed => {}
                UploadDecision::Cancel => {
                    return Err(UploadError::Cancelled(
                        "Not starting the upload because onBeforeUpload returned false".to_string(),
                    ));
                }
                UploadDecision::Replace(replacement) => {
                    files = replacement;
                    self.set_state(StatePatch::new().files(files.clone()));
                }
            }
        }

        let restricter = self.restricter();
        if let Err(e) = restricter.validate_min_number_of_files(&files) {
            self.inform_and_emit(vec![ReportedError::Restriction(e.clone())]);
            return Err(e.into());
        }
        self.check_required_meta_fields(&files, &restricter)?;

        let upload_id = self.create_batch_with(
            |state| {
                let batched: HashSet<&str> = state.batched_file_ids().into_iter().collect();
                files
                    .keys()
                    .filter(|id| {
                        state.files.get(id.as_str()).is_some_and(|f| {
                            f.progress.upload_started.is_none() && !f.is_ghost
                        }) && !batched.contains(id.as_str())
                    })
                    .cloned()
                    .collect()
            },
            false,
        )?;
        let result = self.run_batch(&upload_id).await?;
        self.emit(UploadEvent::Complete {
            result: result.clone(),
        });
        Ok(result)
    }

    fn check_required_meta_fields(
        &self,
        files: &FileMap,
        restricter: &Restricter,
    ) -> Result<(), UploadError> {
        let mut missing_all: Vec<String> = Vec::new();

        for file in files.values() {
            let missing = restricter.get_missing_required_meta_fields(file);
            if missing.missing_fields.is_empty() {
                if !file.missing_required_meta_fields.is_empty() {
                    self.patch_file(&file.id, |f| f.missing_required_meta_fields.clear());
                }
                continue;
            }

            let fields = missing.missing_fields.clone();
            self.patch_file(&file.id, |f| f.missing_required_meta_fields = fields);
            info!(file_id = %file.id, "{}", missing.error.message);
            self.emit(UploadEvent::RestrictionFailed {
                file_id: Some(file.id.clone()),
                error: missing.error,
            });
            for field in missing.missing_fields {
                if !missing_all.contains(&field) {
                    missing_all.push(field);
                }
            }
        }

        if missing_all.is_empty() {
            return Ok(());
        }
        Err(RestrictionError::new(
            RestrictionKind::MissingRequiredMeta {
                fields: missing_all,
            },
            "Missing required meta fields",
        )
        .into())
    }

    async fn do_retry_all(&self) -> Result<UploadResult, UploadError> {
        let mut to_retry: Vec<String> = Vec::new();
        self.store().update(|state| {
            let mut files = state.files.clone();
            for file in files.values_mut().filter(|f| f.error.is_some()) {
                file.error = None;
                file.is_paused = false;
                to_retry.push(file.id.clone());
            }
            StatePatch::new().files(files).error(None)
        });

        self.emit(UploadEvent::RetryAll {
            file_ids: to_retry.clone(),
        });
        if to_retry.is_empty() {
            return Ok(UploadResult::empty(None));
        }

        let upload_id = self.create_batch(to_retry, true)?;
        self.run_batch(&upload_id).await
    }

    /// Retry every errored file in one forced batch
    pub async fn retry_all(&self) -> Result<UploadResult, UploadError> {
        let result = self.do_retry_all().await?;
        self.emit(UploadEvent::Complete {
            result: result.clone(),
        });
        Ok(result)
    }

    pub async fn retry_upload(&self, file_id: &str) -> Result<UploadResult, UploadError> {
        self.set_file_state(file_id, |file| {
            file.error = None;
            file.is_paused = false;
        })?;
        self.emit(UploadEvent::UploadRetry {
            file_id: file_id.to_string(),
        });

        let upload_id = self.create_batch(vec![file_id.to_string()], true)?;
        self.run_batch(&upload_id).await
    }

    /// Remove every file, which tears down every batch, and reset session state
    pub fn cancel_all(&self) {
        self.emit(UploadEvent::CancelAll);

        let file_ids: Vec<String> = self.get_state().files.keys().cloned().collect();
        if !file_ids.is_empty() {
            if let Err(e) = self.remove_files(&file_ids) {
                warn!(error = %e, "Failed to remove files while cancelling");
            }
        }

        let leftover: Vec<String> = self.get_state().current_uploads.keys().cloned().collect();
        for upload_id in leftover {
            self.remove_batch(&upload_id);
        }
        self.set_state(StatePatch::default_upload_state());
    }

    /// Toggle pause; `None` when the transfer plugin is not resumable or the
    /// file is missing or done
    pub fn pause_resume(&self, file_id: &str) -> Option<bool> {
        let state = self.get_state();
        let file = state.files.get(file_id)?;
        if !state.capabilities.resumable_uploads || file.progress.upload_complete {
            return None;
        }

        let is_paused = !file.is_paused;
        self.patch_file(file_id, |f| f.is_paused = is_paused);
        self.emit(UploadEvent::UploadPause {
            file_id: file_id.to_string(),
            is_paused,
        });
        Some(is_paused)
    }

    pub fn pause_all(&self) {
        self.store().update(|state| {
            let mut files = state.files.clone();
            for file in files.values_mut() {
                if file.progress.upload_started.is_some() && !file.progress.upload_complete {
                    file.is_paused = true;
                }
            }
            StatePatch::new().files(files)
        });
        self.emit(UploadEvent::PauseAll);
    }

    pub fn resume_all(&self) {
        self.store().update(|state| {
            let mut files = state.files.clone();
            for file in files.values_mut() {
                if file.progress.upload_started.is_some() && !file.progress.upload_complete {
                    file.is_paused = false;
                    file.error = None;
                }
            }
            StatePatch::new().files(files)
        });
        self.emit(UploadEvent::ResumeAll);
    }

    /// Resume a live batch (usually a restored one) from its persisted step
    pub async fn restore(&self, upload_id: &str) -> Result<UploadResult, UploadError> {
        info!(upload_id = %upload_id, "Attempting to restore upload");
        if self.get_state().batch(upload_id).is_none() {
            self.remove_batch(upload_id);
            return Err(UploadError::UnknownUpload(upload_id.to_string()));
        }
        self.run_batch(upload_id).await
    }

    /// Merge a previously captured snapshot. Local files without a payload
    /// become ghosts until the user selects them again.
    pub fn restore_state(&self, snapshot: RecoveredState, plugin_data: serde_json::Value) {
        let mut ghosts = 0usize;
        let recovered = snapshot.clone();

        self.store().update(|state| {
            let mut files = state.files.clone();
            for (id, mut file) in snapshot.files {
                file.is_ghost = file.data.is_none() && !file.is_remote;
                if file.is_ghost {
                    ghosts += 1;
                }
                files.insert(id, file);
            }
            let mut uploads = state.current_uploads.clone();
            uploads.extend(snapshot.current_uploads);

            StatePatch::new()
                .files(files)
                .current_uploads(uploads)
                .recovered_state(Some(recovered))
        });

        info!(
            files = self.get_state().files.len(),
            ghosts, "Restored upload state"
        );
        self.emit(UploadEvent::Restored { plugin_data });
    }

    /// Merge extra keys into a live batch's result
    pub fn add_result_data(&self, upload_id: &str, data: Meta) {
        let merged: Result<(), ()> = self.store().try_update(|state| {
            let mut uploads = state.current_uploads.clone();
            let batch = uploads.get_mut(upload_id).ok_or(())?;
            batch.result.data.extend(data);
            Ok(StatePatch::new().current_uploads(uploads))
        });
        if merged.is_err() {
            debug!(upload_id = %upload_id, "Not setting result for an upload that has been removed");
        }
    }

    pub fn reset_progress(&self) {
        self.store().update(|state| {
            let mut files = state.files.clone();
            for file in files.values_mut() {
                file.progress = FileProgress::not_started(file.progress.bytes_total);
            }
            StatePatch {
                files: Some(files),
                ..StatePatch::default_upload_state()
            }
        });
        self.emit(UploadEvent::ResetProgress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Hooks, UploaderOptions};
    use crate::files::FileDescriptor;
    use crate::plugins::ProcessorRef;
    use crate::state::Capabilities;
    use std::sync::Arc;

    #[test]
    fn test_create_batch_respects_policy() {
        let uploader = Uploader::new(UploaderOptions {
            allow_multiple_upload_batches: false,
            ..Default::default()
        });

        let first = uploader.create_batch(Vec::new(), false).unwrap();
        assert!(!uploader.get_state().allow_new_upload);

        let err = uploader.create_batch(Vec::new(), false).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Policy error: Cannot create a new upload: already uploading."
        );

        let forced = uploader.create_batch(Vec::new(), true).unwrap();
        assert_ne!(first, forced);
        assert_eq!(uploader.get_state().current_uploads.len(), 2);
    }

    #[tokio::test]
    async fn test_phase_error_tears_batch_down() {
        let uploader = Uploader::default();
        uploader
            .add_file(FileDescriptor::from_bytes("a.txt", "x"))
            .unwrap();
        let failing: ProcessorRef = Arc::new(|_ctx: PhaseContext| async {
            Err::<(), UploadError>(UploadError::Other("signing endpoint unreachable".into()))
        });
        uploader.register_processor(Phase::Pre, failing);

        let err = uploader.upload().await.unwrap_err();
        assert!(matches!(err, UploadError::Phase(_)));

        let state = uploader.get_state();
        assert!(state.current_uploads.is_empty());
        assert!(state.error.is_some());
    }

    #[tokio::test]
    async fn test_before_upload_hook_cancels() {
        let uploader = Uploader::with_hooks(
            UploaderOptions::default(),
            Hooks {
                on_before_upload: Some(Arc::new(|_files: &FileMap| UploadDecision::Cancel)),
                ..Default::default()
            },
        );
        uploader
            .add_file(FileDescriptor::from_bytes("a.txt", "x"))
            .unwrap();

        let errors = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let e = Arc::clone(&errors);
        uploader.on(crate::events::EventKind::Error, move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });

        let err = uploader.upload().await.unwrap_err();
        assert!(matches!(err, UploadError::Cancelled(_)));
        assert!(err.to_string().contains("onBeforeUpload returned false"));
        let state = uploader.get_state();
        assert!(state.current_uploads.is_empty());
        assert!(state.error.is_none());
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_required_meta_blocks_upload() {
        let mut options = UploaderOptions::default();
        options.restrictions.required_meta_fields = Some(vec!["caption".into()]);
        let uploader = Uploader::new(options);
        let id = uploader
            .add_file(FileDescriptor::from_bytes("a.txt", "x"))
            .unwrap();

        let err = uploader.upload().await.unwrap_err();
        assert_eq!(err.to_string(), "Missing required meta fields");
        assert_eq!(
            uploader.get_file(&id).unwrap().missing_required_meta_fields,
            vec!["caption".to_string()]
        );

        let mut meta = Meta::new();
        meta.insert("caption".into(), serde_json::json!("a cat"));
        uploader.set_file_meta(&id, meta);
        uploader.upload().await.unwrap();
        assert!(uploader
            .get_file(&id)
            .unwrap()
            .missing_required_meta_fields
            .is_empty());
    }

    #[tokio::test]
    async fn test_restore_unknown_upload() {
        let uploader = Uploader::default();
        let err = uploader.restore("nope").await.unwrap_err();
        assert_eq!(err.to_string(), "Nonexistent upload: nope");
    }

    #[test]
    fn test_restore_state_marks_ghosts() {
        let uploader = Uploader::default();
        let id = uploader
            .add_file(FileDescriptor::from_bytes("a.txt", "x"))
            .unwrap();
        let mut snapshot = RecoveredState::default();
        let mut file = uploader.get_file(&id).unwrap();
        file.data = None;
        snapshot.files.insert(id.clone(), file);
        uploader.cancel_all();

        uploader.restore_state(snapshot, serde_json::Value::Null);

        let state = uploader.get_state();
        assert!(state.files[&id].is_ghost);
        assert!(state.recovered_state.is_some());
        assert!(state.files_by_state().is_some_ghost);
    }

    #[test]
    fn test_pause_resume_requires_resumable() {
        let uploader = Uploader::default();
        let id = uploader
            .add_file(FileDescriptor::from_bytes("a.txt", "x"))
            .unwrap();
        assert_eq!(uploader.pause_resume(&id), None);

        uploader.set_capabilities(Capabilities {
            resumable_uploads: true,
            ..Default::default()
        });
        assert_eq!(uploader.pause_resume(&id), Some(true));
        assert_eq!(uploader.pause_resume(&id), Some(false));
        assert_eq!(uploader.pause_resume("missing"), None);
    }

    #[test]
    fn test_add_result_data_and_reset_progress() {
        let uploader = Uploader::default();
        let id = uploader
            .add_file(FileDescriptor::from_bytes("a.txt", "x"))
            .unwrap();
        let upload_id = uploader.create_batch(vec![id.clone()], false).unwrap();

        let mut data = Meta::new();
        data.insert("assembly".into(), serde_json::json!("abc"));
        uploader.add_result_data(&upload_id, data.clone());
        uploader.add_result_data("gone", data);
        assert_eq!(
            uploader.get_state().current_uploads[&upload_id].result.data["assembly"],
            "abc"
        );

        uploader.emit(UploadEvent::UploadStart {
            file_ids: vec![id.clone()],
        });
        uploader.reset_progress();
        let file = uploader.get_file(&id).unwrap();
        assert!(file.progress.upload_started.is_none());
        assert_eq!(file.progress.bytes_total, Some(1));
        assert_eq!(uploader.get_state().total_progress, 0);
    }
}
