pub mod binding;
pub mod trigger;

// Re-export the main API
pub use binding::{start_processing_events, AttachError, Subscription};
pub use trigger::{ExitReason, ProcessEndTrigger, ProcessExecTrigger, ProcessStartTrigger, Trigger};
