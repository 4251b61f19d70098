use super::types::{EventEnvelope, EventKind, EventSequence, UploadEvent};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

pub type EventReceiver = broadcast::Receiver<EventEnvelope>;
pub type EventSender = broadcast::Sender<EventEnvelope>;

pub type ListenerId = u64;
pub type EventListener = Arc<dyn Fn(&UploadEvent) + Send + Sync>;

struct ListenerEntry {
    id: ListenerId,
    filter: Option<EventKind>,
    once: bool,
    callback: EventListener,
}

/// Event bus for distributing upload events.
///
/// Synchronous listeners run in registration order inside `publish`. Every
/// event is also sent, sequenced and timestamped, to broadcast subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: EventSender,
    sequence: Arc<AtomicU64>,
    listeners: Arc<Mutex<Vec<ListenerEntry>>>,
    next_listener: Arc<AtomicU64>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("sequence", &self.current_sequence())
            .field("listeners", &self.listener_count())
            .field("receivers", &self.receiver_count())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(1)),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener: Arc::new(AtomicU64::new(1)),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<ListenerEntry>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, filter: Option<EventKind>, once: bool, callback: EventListener) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        self.entries().push(ListenerEntry {
            id,
            filter,
            once,
            callback,
        });
        id
    }

    /// Listen for one kind of event
    pub fn on<F>(&self, kind: EventKind, f: F) -> ListenerId
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), false, Arc::new(f))
    }

    /// Listen for the next event of one kind, then detach
    pub fn once<F>(&self, kind: EventKind, f: F) -> ListenerId
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), true, Arc::new(f))
    }

    /// Listen for every event
    pub fn on_any<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.register(None, false, Arc::new(f))
    }

    pub fn off(&self, id: ListenerId) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    pub fn clear_listeners(&self) {
        self.entries().clear();
    }

    /// Publish an event (returns sequence number)
    pub fn publish(&self, event: UploadEvent) -> EventSequence {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let kind = event.kind();

        let matching: Vec<EventListener> = {
            let mut entries = self.entries();
            let matching = entries
                .iter()
                .filter(|entry| entry.filter.is_none_or(|k| k == kind))
                .map(|entry| Arc::clone(&entry.callback))
                .collect();
            entries.retain(|entry| !(entry.once && entry.filter == Some(kind)));
            matching
        };

        for listener in matching {
            listener(&event);
        }

        // No receivers is normal when nothing subscribed
        let _ = self.sender.send(EventEnvelope {
            sequence,
            timestamp: Utc::now(),
            event,
        });

        sequence
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Get current sequence number
    pub fn current_sequence(&self) -> EventSequence {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Get number of active receivers
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn listener_count(&self) -> usize {
        self.entries().len()
    }
}
