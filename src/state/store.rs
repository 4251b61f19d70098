use super::{GlobalState, StatePatch};
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub type SubscriptionId = u64;

/// Called with `(prev, next, patch)` after every applied patch
pub type StateListener =
    Arc<dyn Fn(&Arc<GlobalState>, &Arc<GlobalState>, &Arc<StatePatch>) + Send + Sync>;

/// Single source of truth for [`GlobalState`].
///
/// Each patch produces a fresh snapshot under the lock; subscribers are
/// notified afterwards, in registration order, without the lock held, so a
/// listener may read or write the store again.
pub struct Store {
    state: Mutex<Arc<GlobalState>>,
    listeners: Mutex<Vec<(SubscriptionId, StateListener)>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("state", &"<state snapshot>")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new(GlobalState::default())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Store {
    pub fn new(initial: GlobalState) -> Self {
        Self {
            state: Mutex::new(Arc::new(initial)),
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Current snapshot
    pub fn get_state(&self) -> Arc<GlobalState> {
        Arc::clone(&lock(&self.state))
    }

    pub fn set_state(&self, patch: StatePatch) {
        let _ = self.try_update(|_| Ok::<_, Infallible>(patch));
    }

    /// Read-modify-write against the latest snapshot, atomically
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&GlobalState) -> StatePatch,
    {
        let _ = self.try_update(|state| Ok::<_, Infallible>(f(state)));
    }

    /// Like [`Store::update`], but the closure may refuse; nothing is applied then
    pub fn try_update<F, E>(&self, f: F) -> Result<(), E>
    where
        F: FnOnce(&GlobalState) -> Result<StatePatch, E>,
    {
        let (prev, next, patch) = {
            let mut guard = lock(&self.state);
            let patch = f(&guard)?;
            let next = Arc::new(guard.apply(&patch));
            let prev = std::mem::replace(&mut *guard, Arc::clone(&next));
            (prev, next, Arc::new(patch))
        };

        self.publish(&prev, &next, &patch);
        Ok(())
    }

    pub fn subscribe(&self, listener: StateListener) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.listeners).push((id, listener));
        id
    }

    /// Returns false when the id was not subscribed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    fn publish(&self, prev: &Arc<GlobalState>, next: &Arc<GlobalState>, patch: &Arc<StatePatch>) {
        let listeners: Vec<StateListener> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener(prev, next, patch);
        }
    }
}
