pub mod event_source;
pub mod inclusion;
pub mod polling_source;
pub mod process_table;
pub mod process_utils;
pub mod source;
pub mod types;

pub use event_source::EventSource;
pub use polling_source::PollingSource;
pub use source::{Availability, ProcessSource, SourceBackend};
