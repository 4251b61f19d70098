//! Aggregate progress math and the update throttle.

use crate::events::ProgressReport;
use crate::state::{FileMap, FileProgress};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Minimum spacing between total-progress recomputations
pub const PROGRESS_THROTTLE: Duration = Duration::from_millis(500);

fn is_sized(progress: &FileProgress) -> bool {
    progress.bytes_total.is_some_and(|total| total > 0)
}

/// Fraction in `0.0..=1.0`, or `None` when it cannot be known.
///
/// Only files that started uploading or sit in a processing phase count.
/// `None` is returned when every sized file is complete while some unsized
/// file is still running.
pub fn compute_total_progress(files: &FileMap) -> Option<f64> {
    let in_progress: Vec<&FileProgress> = files
        .values()
        .map(|f| &f.progress)
        .filter(|p| p.is_in_progress())
        .collect();

    if in_progress.is_empty() {
        return Some(0.0);
    }
    if in_progress.iter().all(|p| p.upload_complete) {
        return Some(1.0);
    }

    let (sized, unsized_files): (Vec<&FileProgress>, Vec<&FileProgress>) =
        in_progress.into_iter().partition(|p| is_sized(p));

    if sized.iter().all(|p| p.upload_complete)
        && !unsized_files.is_empty()
        && !unsized_files.iter().all(|p| p.upload_complete)
    {
        return None;
    }

    let total: u64 = sized.iter().filter_map(|p| p.bytes_total).sum();
    if total == 0 {
        return Some(0.0);
    }
    let uploaded: u64 = sized.iter().filter_map(|p| p.bytes_uploaded).sum();
    Some((uploaded as f64 / total as f64).clamp(0.0, 1.0))
}

/// Whole-number percentage; `None` stays `None`
pub fn total_progress_percent(files: &FileMap) -> Option<u8> {
    compute_total_progress(files).map(|fraction| (fraction * 100.0).round().clamp(0.0, 100.0) as u8)
}

/// Apply one transfer report to a file's progress.
///
/// `bytes_uploaded` is only taken once `upload_started` is set, so a report
/// racing ahead of the start notification cannot mark bytes as sent.
pub fn apply_progress_report(progress: &FileProgress, report: &ProgressReport) -> FileProgress {
    let percentage = report
        .bytes_total
        .filter(|total| *total > 0)
        .map(|total| ((report.bytes_uploaded as f64 / total as f64) * 100.0).round().min(100.0) as u8);

    let mut next = FileProgress {
        bytes_total: report.bytes_total,
        percentage,
        ..progress.clone()
    };
    if progress.upload_started.is_some() {
        next.bytes_uploaded = Some(report.bytes_uploaded);
    }
    next
}

type Action = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct ThrottleState {
    last_run: Option<Instant>,
    pending: bool,
    timer: Option<JoinHandle<()>>,
}

struct ThrottleShared {
    interval: Duration,
    state: Mutex<ThrottleState>,
    action: Action,
}

impl ThrottleShared {
    fn guard(&self) -> MutexGuard<'_, ThrottleState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Leading and trailing edge throttle.
///
/// The first call in a quiet period runs at once; calls inside the interval
/// collapse into one trailing run. Without a tokio runtime every call runs
/// immediately.
#[derive(Clone)]
pub struct Throttle {
    shared: Arc<ThrottleShared>,
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("interval", &self.shared.interval)
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl Throttle {
    pub fn new<F>(interval: Duration, action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(ThrottleShared {
                interval,
                state: Mutex::new(ThrottleState::default()),
                action: Arc::new(action),
            }),
        }
    }

    pub fn call(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            (self.shared.action)();
            return;
        };

        let now = Instant::now();
        let run_now = {
            let mut state = self.shared.guard();
            let quiet = state
                .last_run
                .is_none_or(|last| now.duration_since(last) >= self.shared.interval);

            if quiet && state.timer.is_none() {
                state.last_run = Some(now);
                true
            } else {
                state.pending = true;
                if state.timer.is_none() {
                    let deadline = state.last_run.unwrap_or(now) + self.shared.interval;
                    let shared = Arc::clone(&self.shared);
                    state.timer = Some(handle.spawn(async move {
                        tokio::time::sleep_until(deadline).await;
                        let fire = {
                            let mut state = shared.guard();
                            state.timer = None;
                            let fire = state.pending;
                            state.pending = false;
                            if fire {
                                state.last_run = Some(Instant::now());
                            }
                            fire
                        };
                        if fire {
                            (shared.action)();
                        }
                    }));
                }
                false
            }
        };

        if run_now {
            (self.shared.action)();
        }
    }

    /// Run a pending trailing call right away
    pub fn flush(&self) {
        let fire = {
            let mut state = self.shared.guard();
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            let fire = state.pending;
            state.pending = false;
            if fire {
                state.last_run = Some(Instant::now());
            }
            fire
        };
        if fire {
            (self.shared.action)();
        }
    }

    /// Drop a pending trailing call
    pub fn cancel(&self) {
        let mut state = self.shared.guard();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.pending = false;
    }

    pub fn is_pending(&self) -> bool {
        self.shared.guard().pending
    }
}
