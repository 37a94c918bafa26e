pub mod config;
pub mod constants;
pub mod engine;
pub mod extracts;
pub mod logging;
pub mod quality;
pub mod relationships;
pub mod simulation;

pub use engine::{Engine, EngineOptions, TickOutput};
