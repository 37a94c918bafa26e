mod config_loader;

pub use config_loader::{AquariumConfig, ConfigLoader, SortField, SortOrder, SourcePreference};
