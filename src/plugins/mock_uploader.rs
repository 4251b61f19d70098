//! In-process transfer plugin that simulates uploads with timed progress.

use super::{Phase, PhaseContext, Plugin, PluginKind, Processor, ProcessorRef};
use crate::engine::Uploader;
use crate::error::UploadError;
use crate::events::{ProgressReport, UploadEvent};
use crate::state::{StatePatch, UploadResponse};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const PROGRESS_STEPS: u64 = 5;

#[derive(Debug, Clone)]
pub struct MockUploaderOptions {
    pub id: String,
    pub should_succeed: bool,
    /// Time between progress reports
    pub step_delay: Duration,
    /// Advertise pause/resume support
    pub resumable: bool,
    /// Files with these names always fail
    pub fail_names: Vec<String>,
}

impl Default for MockUploaderOptions {
    fn default() -> Self {
        Self {
            id: "MockUploader".to_string(),
            should_succeed: true,
            step_delay: Duration::from_millis(50),
            resumable: false,
            fail_names: Vec::new(),
        }
    }
}

struct MockTransfer {
    should_succeed: AtomicBool,
    step_delay: Duration,
    fail_names: Vec<String>,
}

impl MockTransfer {
    /// Blocks while the file is paused. `false` once the file is gone or the
    /// batch was cancelled.
    async fn wait_while_paused(&self, ctx: &PhaseContext, file_id: &str) -> bool {
        loop {
            if ctx.cancel.is_cancelled() {
                return false;
            }
            match ctx.uploader.get_file(file_id) {
                None => return false,
                Some(file) if file.is_paused => {
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => return false,
                        _ = tokio::time::sleep(self.step_delay) => {}
                    }
                }
                Some(_) => return true,
            }
        }
    }

    async fn upload_one(&self, ctx: &PhaseContext, file_id: &str) {
        let Some(file) = ctx.uploader.get_file(file_id) else {
            return;
        };
        let total = file.size.unwrap_or(0);

        for step in 1..=PROGRESS_STEPS {
            if !self.wait_while_paused(ctx, file_id).await {
                debug!(file_id = %file_id, "Transfer abandoned");
                return;
            }
            tokio::select! {
                _ = ctx.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.step_delay) => {}
            }
            ctx.uploader.emit(UploadEvent::UploadProgress {
                file_id: file_id.to_string(),
                progress: ProgressReport {
                    bytes_uploaded: total * step / PROGRESS_STEPS,
                    bytes_total: Some(total),
                },
            });
        }

        if !self.wait_while_paused(ctx, file_id).await {
            return;
        }

        let fails = !self.should_succeed.load(Ordering::SeqCst)
            || self.fail_names.iter().any(|name| name == &file.name);
        if fails {
            ctx.uploader.emit(UploadEvent::UploadError {
                file_id: file_id.to_string(),
                error: "Upload failed".to_string(),
                response: Some(UploadResponse {
                    status: Some(500),
                    ..Default::default()
                }),
            });
        } else {
            ctx.uploader.emit(UploadEvent::UploadSuccess {
                file_id: file_id.to_string(),
                response: UploadResponse {
                    status: Some(200),
                    body: None,
                    upload_url: Some(format!("https://example.com/upload/{}", file.name)),
                    bytes_uploaded: Some(total),
                },
            });
        }
    }
}

#[async_trait]
impl Processor for MockTransfer {
    async fn process(&self, ctx: PhaseContext) -> Result<(), UploadError> {
        if ctx.file_ids.is_empty() {
            return Ok(());
        }

        ctx.uploader.emit(UploadEvent::UploadStart {
            file_ids: ctx.file_ids.clone(),
        });
        join_all(ctx.file_ids.iter().map(|id| self.upload_one(&ctx, id))).await;
        Ok(())
    }
}

/// Uploader-kind plugin backed by [`MockTransfer`]
pub struct MockUploader {
    options: MockUploaderOptions,
    transfer: Arc<MockTransfer>,
    processor: ProcessorRef,
}

impl std::fmt::Debug for MockUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockUploader")
            .field("options", &self.options)
            .finish()
    }
}

impl MockUploader {
    pub fn new(options: MockUploaderOptions) -> Self {
        let transfer = Arc::new(MockTransfer {
            should_succeed: AtomicBool::new(options.should_succeed),
            step_delay: options.step_delay,
            fail_names: options.fail_names.clone(),
        });
        let processor: ProcessorRef = transfer.clone();
        Self {
            options,
            transfer,
            processor,
        }
    }

    /// Flip the outcome of transfers that have not finished yet
    pub fn set_should_succeed(&self, succeed: bool) {
        self.transfer.should_succeed.store(succeed, Ordering::SeqCst);
    }
}

impl Default for MockUploader {
    fn default() -> Self {
        Self::new(MockUploaderOptions::default())
    }
}

impl Plugin for MockUploader {
    fn id(&self) -> &str {
        &self.options.id
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Uploader
    }

    fn install(&self, uploader: &Uploader) -> Result<(), UploadError> {
        uploader.register_processor(Phase::Transfer, Arc::clone(&self.processor));
        if self.options.resumable {
            let mut capabilities = uploader.get_state().capabilities.clone();
            capabilities.resumable_uploads = true;
            uploader.set_state(StatePatch::new().capabilities(capabilities));
        }
        Ok(())
    }

    fn uninstall(&self, uploader: &Uploader) -> Result<(), UploadError> {
        uploader.unregister_processor(Phase::Transfer, &self.processor);
        Ok(())
    }
}
