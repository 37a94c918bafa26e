pub mod connection;
pub mod entity_snapshot;
pub mod lifecycle_event;

pub use connection::{Connection, ConnectionKind};
pub use entity_snapshot::{normalize_base_name, EntitySnapshot, Snapshot};
pub use lifecycle_event::{EventBuffer, LifecycleEvent, LifecycleEventKind};
