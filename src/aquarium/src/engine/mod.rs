pub mod feed;
mod pipeline;

pub use feed::{BackgroundFeed, FeedCommand, FeedUpdate, SourceFeed};
pub use pipeline::{Engine, EngineOptions, ProcessStatistics, TickOutput};
