use super::{lock, ReportedError, Uploader};
use crate::error::{RestrictionError, RestrictionKind, UploadError};
use crate::events::UploadEvent;
use crate::files::{admit, AdmitContext, FileDescriptor};
use crate::state::{FileMap, FileRecord, FilesByState, Meta, StatePatch};
use tracing::{debug, info};

const NO_INDIVIDUAL_CANCELLATION: &str =
    "The installed uploader plugin does not allow removing files during an upload.";

impl Uploader {
    fn assert_new_upload_allowed(&self) -> Result<(), UploadError> {
        if self.get_state().allow_new_upload {
            return Ok(());
        }
        let error = RestrictionError::new(RestrictionKind::NoMoreFilesAllowed, "Cannot add more files");
        self.inform_and_emit(vec![ReportedError::Restriction(error.clone())]);
        Err(error.into())
    }

    /// Admit inputs against the current snapshot and commit the accepted ones
    fn check_and_add(&self, inputs: Vec<FileDescriptor>) -> (Vec<FileRecord>, Vec<RestrictionError>) {
        let options = self.options();
        let hooks = self.hooks();
        let restricter = self.restricter();
        let state = self.get_state();

        let admission = admit(
            &state.files,
            inputs,
            &AdmitContext {
                instance_id: &options.id,
                global_meta: &state.meta,
                restricter: &restricter,
                before_file_added: hooks.on_before_file_added.as_ref(),
            },
        );

        if !admission.accepted.is_empty() {
            let accepted = admission.accepted.clone();
            self.store().update(move |state| {
                let mut files = state.files.clone();
                for file in accepted {
                    files.insert(file.id.clone(), file);
                }
                StatePatch::new().files(files)
            });
        }

        (admission.accepted, admission.rejected)
    }

    fn announce_added(&self, added: &[FileRecord]) {
        for file in added {
            debug!(file_id = %file.id, name = %file.name, "Added file");
            self.emit(UploadEvent::FileAdded { file: file.clone() });
        }
        if !added.is_empty() {
            self.emit(UploadEvent::FilesAdded {
                files: added.to_vec(),
            });
            self.start_if_auto_proceed();
        }
    }

    /// Add one file; any rejection is returned as the error
    pub fn add_file(&self, input: FileDescriptor) -> Result<String, UploadError> {
        self.assert_new_upload_allowed()?;

        let (accepted, rejected) = self.check_and_add(vec![input]);
        if let Some(first) = rejected.first().cloned() {
            self.inform_and_emit(rejected.into_iter().map(ReportedError::Restriction).collect());
            return Err(first.into());
        }

        self.announce_added(&accepted);
        accepted
            .first()
            .map(|f| f.id.clone())
            .ok_or_else(|| UploadError::Other("File was not added".to_string()))
    }

    /// Add many files. Rejections are reported through events and info
    /// messages; the ids of the admitted files are returned.
    pub fn add_files(&self, inputs: Vec<FileDescriptor>) -> Result<Vec<String>, UploadError> {
        self.assert_new_upload_allowed()?;

        let (accepted, rejected) = self.check_and_add(inputs);
        if !rejected.is_empty() {
            self.inform_and_emit(rejected.into_iter().map(ReportedError::Restriction).collect());
        }

        self.announce_added(&accepted);
        if accepted.len() > 1 {
            info!(count = accepted.len(), "Added batch of files");
        }
        Ok(accepted.into_iter().map(|f| f.id).collect())
    }

    pub fn remove_file(&self, file_id: &str) -> Result<(), UploadError> {
        self.remove_files(&[file_id.to_string()])
    }

    /// Remove files and shrink every batch that references them.
    ///
    /// A batch left empty is deleted. Shrinking a batch partially requires
    /// the `individual_cancellation` capability; without it nothing changes.
    pub fn remove_files(&self, file_ids: &[String]) -> Result<(), UploadError> {
        let mut removed: Vec<FileRecord> = Vec::new();
        let mut emptied: Vec<String> = Vec::new();

        self.store().try_update(|state| {
            let mut files = state.files.clone();
            for id in file_ids {
                if let Some(file) = files.shift_remove(id) {
                    removed.push(file);
                }
            }
            let is_removed = |id: &String| removed.iter().any(|f| &f.id == id);

            let mut uploads = state.current_uploads.clone();
            for (upload_id, batch) in state.current_uploads.iter() {
                let remaining: Vec<String> =
                    batch.file_ids.iter().filter(|id| !is_removed(id)).cloned().collect();

                if remaining.is_empty() {
                    uploads.shift_remove(upload_id);
                    emptied.push(upload_id.clone());
                    continue;
                }
                if remaining.len() != batch.file_ids.len() {
                    if !state.capabilities.individual_cancellation {
                        return Err(UploadError::Policy(NO_INDIVIDUAL_CANCELLATION.to_string()));
                    }
                    if let Some(entry) = uploads.get_mut(upload_id) {
                        entry.file_ids = remaining;
                    }
                }
            }

            let mut patch = StatePatch::new().files(files.clone()).current_uploads(uploads);
            if files.is_empty() {
                patch = patch
                    .allow_new_upload(true)
                    .error(None)
                    .recovered_state(None);
            }
            Ok(patch)
        })?;

        for upload_id in &emptied {
            self.cancel_batch_token(upload_id);
        }

        self.inner.progress_throttle.call();
        for file in removed {
            debug!(file_id = %file.id, "Removed file");
            self.emit(UploadEvent::FileRemoved { file });
        }
        Ok(())
    }

    /// Remove every file and batch and reset session state.
    pub fn clear(&self) -> Result<(), UploadError> {
        let mut cleared: Vec<String> = Vec::new();
        self.store().try_update(|state| {
            if !state.current_uploads.is_empty() && !state.capabilities.individual_cancellation {
                return Err(UploadError::Policy(NO_INDIVIDUAL_CANCELLATION.to_string()));
            }
            cleared = state.current_uploads.keys().cloned().collect();
            Ok(StatePatch {
                files: Some(FileMap::new()),
                current_uploads: Some(Default::default()),
                ..StatePatch::default_upload_state()
            })
        })?;

        for upload_id in &cleared {
            self.cancel_batch_token(upload_id);
        }
        Ok(())
    }

    pub fn get_file(&self, file_id: &str) -> Option<FileRecord> {
        self.get_state().files.get(file_id).cloned()
    }

    pub fn get_files(&self) -> Vec<FileRecord> {
        self.get_state().files.values().cloned().collect()
    }

    /// Missing ids are skipped
    pub fn get_files_by_ids(&self, file_ids: &[String]) -> Vec<FileRecord> {
        let state = self.get_state();
        file_ids
            .iter()
            .filter_map(|id| state.files.get(id).cloned())
            .collect()
    }

    pub fn files_by_state(&self) -> FilesByState {
        self.get_state().files_by_state()
    }

    /// Mutate one file in place; fails when it has been removed
    pub fn set_file_state<F>(&self, file_id: &str, f: F) -> Result<(), UploadError>
    where
        F: FnOnce(&mut FileRecord),
    {
        self.store().try_update(|state| {
            let mut files = state.files.clone();
            let file = files
                .get_mut(file_id)
                .ok_or_else(|| UploadError::FileNotFound(file_id.to_string()))?;
            f(file);
            Ok(StatePatch::new().files(files))
        })
    }

    /// Like `set_file_state`, silently skipping removed files
    pub(crate) fn patch_file<F>(&self, file_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut FileRecord),
    {
        self.set_file_state(file_id, f).is_ok()
    }

    /// Merge into the global meta and into every file's meta
    pub fn set_meta(&self, data: Meta) {
        self.store().update(|state| {
            let mut meta = state.meta.clone();
            meta.extend(data.clone());

            let mut files = state.files.clone();
            for file in files.values_mut() {
                file.meta.extend(data.clone());
            }
            StatePatch::new().meta(meta).files(files)
        });
    }

    pub fn set_file_meta(&self, file_id: &str, data: Meta) {
        if !self.patch_file(file_id, |file| file.meta.extend(data)) {
            debug!(file_id = %file_id, "Was trying to set metadata for a file that has been removed");
        }
    }

    pub(super) fn cancel_batch_token(&self, upload_id: &str) {
        if let Some(token) = lock(&self.inner.abort_tokens).remove(upload_id) {
            token.cancel();
        }
    }
}
