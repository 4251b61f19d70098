use super::{EventBus, EventEnvelope, UploadEvent};
use crate::shutdown::ShutdownCoordinator;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handler that writes every event to the tracing log
pub struct EventLogger {
    event_bus: EventBus,
    shutdown: ShutdownCoordinator,
}

impl EventLogger {
    pub fn new(event_bus: EventBus, shutdown: ShutdownCoordinator) -> Self {
        Self {
            event_bus,
            shutdown,
        }
    }

    pub fn start(self) -> JoinHandle<()> {
        // Subscribe before spawning so nothing published after `start` is missed
        let mut rx = self.event_bus.subscribe();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = rx.recv() => {
                        match result {
                            Ok(envelope) => log_envelope(&envelope),
                            Err(broadcast::error::RecvError::Closed) => {
                                info!("Event logger stopped (event bus closed)");
                                break;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "Event logger lagged behind");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Event logger gracefully shutting down");
                        break;
                    }
                }
            }
        })
    }
}

fn log_envelope(envelope: &EventEnvelope) {
    let name = envelope.event.kind().name();
    let seq = envelope.sequence;

    match &envelope.event {
        // Too chatty for info level
        UploadEvent::StateUpdate { .. }
        | UploadEvent::UploadProgress { .. }
        | UploadEvent::Progress { .. }
        | UploadEvent::PreprocessProgress { .. }
        | UploadEvent::PostprocessProgress { .. } => {
            debug!(seq, event = name, file_id = envelope.event.file_id(), "Upload event");
        }
        UploadEvent::UploadError { file_id, error, .. } => {
            warn!(seq, event = name, file_id = %file_id, error = %error, "Upload event");
        }
        UploadEvent::Error { message, .. } => {
            warn!(seq, event = name, file_id = envelope.event.file_id(), error = %message, "Upload event");
        }
        UploadEvent::RestrictionFailed { error, .. } => {
            warn!(seq, event = name, file_id = envelope.event.file_id(), error = %error, "Upload event");
        }
        UploadEvent::Complete { result } => {
            info!(
                seq,
                event = name,
                upload_id = result.upload_id.as_deref(),
                successful = result.successful.len(),
                failed = result.failed.len(),
                "Upload event"
            );
        }
        _ => {
            info!(seq, event = name, file_id = envelope.event.file_id(), "Upload event");
        }
    }
}
