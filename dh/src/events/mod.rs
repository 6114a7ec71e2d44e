//! Event bus, event types, and best-effort persistence

mod bus;
mod logger;
mod types;

pub use bus::{
    DEFAULT_CHANNEL_CAPACITY, EventBus, EventEmitter, EventSubscriber, PROGRESS_INTERVAL, create_event_bus,
};
pub use logger::{read_execution_events, spawn_event_logger};
pub use types::{EventLogEntry, HubEvent};
