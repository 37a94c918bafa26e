mod communication;
mod family;
mod grouping;

pub use communication::CommunicationHistory;
pub use family::FamilyIndex;
pub use grouping::{assign_groups, Group, GroupAssignment, GroupId, GroupKind};
