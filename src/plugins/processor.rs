use crate::engine::Uploader;
use crate::error::UploadError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Pipeline stage a processor runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Pre,
    Transfer,
    Post,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Pre => "preprocessor",
            Phase::Transfer => "uploader",
            Phase::Post => "postprocessor",
        };
        f.write_str(name)
    }
}

/// What a processor is handed for one batch step
#[derive(Clone)]
pub struct PhaseContext {
    pub upload_id: String,
    pub file_ids: Vec<String>,
    pub phase: Phase,
    pub uploader: Uploader,
    /// Cancelled when the batch leaves the live mapping
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for PhaseContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseContext")
            .field("upload_id", &self.upload_id)
            .field("file_ids", &self.file_ids)
            .field("phase", &self.phase)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// One pre-processing, transfer or post-processing step.
///
/// Returning `Err` tears the whole batch down. Per-file failures should be
/// reported through `upload-error` events instead.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, ctx: PhaseContext) -> Result<(), UploadError>;
}

#[async_trait]
impl<F, Fut> Processor for F
where
    F: Fn(PhaseContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), UploadError>> + Send + 'static,
{
    async fn process(&self, ctx: PhaseContext) -> Result<(), UploadError> {
        (self)(ctx).await
    }
}

pub type ProcessorRef = Arc<dyn Processor>;

#[derive(Default)]
struct Pipelines {
    pre: Vec<ProcessorRef>,
    transfer: Vec<ProcessorRef>,
    post: Vec<ProcessorRef>,
}

impl Pipelines {
    fn list_mut(&mut self, phase: Phase) -> &mut Vec<ProcessorRef> {
        match phase {
            Phase::Pre => &mut self.pre,
            Phase::Transfer => &mut self.transfer,
            Phase::Post => &mut self.post,
        }
    }

    fn list(&self, phase: Phase) -> &Vec<ProcessorRef> {
        match phase {
            Phase::Pre => &self.pre,
            Phase::Transfer => &self.transfer,
            Phase::Post => &self.post,
        }
    }
}

/// The three ordered processor lists
#[derive(Default)]
pub struct ProcessorRegistry {
    pipelines: Mutex<Pipelines>,
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("pre", &self.count(Phase::Pre))
            .field("transfer", &self.count(Phase::Transfer))
            .field("post", &self.count(Phase::Post))
            .finish()
    }
}

impl ProcessorRegistry {
    fn guard(&self) -> MutexGuard<'_, Pipelines> {
        self.pipelines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registering the same processor twice in one phase is a no-op
    pub fn register(&self, phase: Phase, processor: ProcessorRef) {
        let mut pipelines = self.guard();
        let list = pipelines.list_mut(phase);
        if !list.iter().any(|p| Arc::ptr_eq(p, &processor)) {
            list.push(processor);
        }
    }

    pub fn unregister(&self, phase: Phase, processor: &ProcessorRef) -> bool {
        let mut pipelines = self.guard();
        let list = pipelines.list_mut(phase);
        let before = list.len();
        list.retain(|p| !Arc::ptr_eq(p, processor));
        list.len() != before
    }

    pub fn count(&self, phase: Phase) -> usize {
        self.guard().list(phase).len()
    }

    /// Every step of a batch in execution order
    pub fn pipeline(&self) -> Vec<(Phase, ProcessorRef)> {
        let pipelines = self.guard();
        [Phase::Pre, Phase::Transfer, Phase::Post]
            .into_iter()
            .flat_map(|phase| {
                pipelines
                    .list(phase)
                    .iter()
                    .map(move |p| (phase, Arc::clone(p)))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> ProcessorRef {
        Arc::new(|_ctx: PhaseContext| async { Ok::<(), UploadError>(()) })
    }

    #[test]
    fn test_pipeline_order_and_dedup() {
        let registry = ProcessorRegistry::default();
        let pre = noop();
        let transfer = noop();
        let post = noop();

        registry.register(Phase::Post, Arc::clone(&post));
        registry.register(Phase::Transfer, Arc::clone(&transfer));
        registry.register(Phase::Pre, Arc::clone(&pre));
        registry.register(Phase::Pre, Arc::clone(&pre));

        let phases: Vec<Phase> = registry.pipeline().into_iter().map(|(p, _)| p).collect();
        assert_eq!(phases, vec![Phase::Pre, Phase::Transfer, Phase::Post]);

        assert!(registry.unregister(Phase::Pre, &pre));
        assert!(!registry.unregister(Phase::Pre, &pre));
        assert_eq!(registry.count(Phase::Pre), 0);
        assert_eq!(registry.pipeline().len(), 2);
    }
}
