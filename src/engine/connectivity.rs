use super::{Uploader, WeakUploader, DEFAULT_INFO_DURATION};
use crate::events::UploadEvent;
use crate::shutdown::ShutdownCoordinator;
use crate::state::InfoKind;
use async_trait::async_trait;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Delay before the first connectivity probe
pub const CONNECTIVITY_INITIAL_DELAY: Duration = Duration::from_secs(3);

/// Source of online/offline readings
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}

impl Uploader {
    /// Record a connectivity reading. Going offline posts a sticky error
    /// message; coming back posts a short success message.
    pub fn update_online_status(&self, online: bool) {
        if !online {
            self.emit(UploadEvent::IsOffline);
            self.info(
                InfoKind::Error,
                "No Internet connection",
                None,
                Duration::ZERO,
            );
            self.inner.was_offline.store(true, Ordering::SeqCst);
            return;
        }

        self.emit(UploadEvent::IsOnline);
        if self.inner.was_offline.swap(false, Ordering::SeqCst) {
            self.emit(UploadEvent::BackOnline);
            self.info(
                InfoKind::Success,
                "Connected to the Internet",
                None,
                DEFAULT_INFO_DURATION,
            );
        }
    }
}

/// Polls a [`NetworkProbe`] and feeds changes into the engine
pub struct ConnectivityMonitor {
    uploader: WeakUploader,
    probe: Arc<dyn NetworkProbe>,
    interval: Duration,
    shutdown: ShutdownCoordinator,
}

impl ConnectivityMonitor {
    pub fn new(
        uploader: &Uploader,
        probe: Arc<dyn NetworkProbe>,
        interval: Duration,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            uploader: uploader.downgrade(),
            probe,
            interval,
            shutdown,
        }
    }

    pub fn start(self) -> JoinHandle<()> {
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(CONNECTIVITY_INITIAL_DELAY) => {}
                _ = shutdown_rx.recv() => {
                    debug!("Connectivity monitor stopped before first probe");
                    return;
                }
            }

            let mut ticker = tokio::time::interval(self.interval);
            let mut last: Option<bool> = None;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let online = self.probe.is_online().await;
                        if last == Some(online) {
                            continue;
                        }
                        last = Some(online);

                        let Some(uploader) = self.uploader.upgrade() else {
                            debug!("Uploader dropped, stopping connectivity monitor");
                            break;
                        };
                        info!(online, "Connectivity changed");
                        uploader.update_online_status(online);
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Connectivity monitor shutting down");
                        break;
                    }
                }
            }
        })
    }
}
