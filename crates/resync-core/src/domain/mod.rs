//! Domain model (IDs, actions, events, states, errors, local timeline).

pub mod action;
pub mod category;
pub mod errors;
pub mod events;
pub mod ids;
pub mod state;
pub mod timeline;

pub use action::{PendingAction, Submission, WriteAck, WriteRequest};
pub use category::{Category, TaskKey};
pub use errors::{
    ConfigError, DeliveryError, ErrorKind, StorageError, SyncError, TaskError, ValidationError,
};
pub use events::{BackendEvent, DropReason, SyncEvent};
pub use ids::{ActionId, EventId};
pub use state::{ConnectionState, TaskState};
pub use timeline::{EntryStatus, Timeline, TimelineChange, TimelineEntry};
