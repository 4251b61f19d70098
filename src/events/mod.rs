mod bus;
mod handlers;
mod types;

pub use bus::{EventBus, EventListener, EventReceiver, ListenerId};
pub use handlers::EventLogger;
pub use types::{EventEnvelope, EventKind, EventSequence, ProgressReport, UploadEvent};
