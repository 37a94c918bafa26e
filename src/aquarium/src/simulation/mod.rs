pub mod entity;
pub mod forces;
pub mod simulator;
pub mod spatial_grid;
pub mod vector;

pub use entity::{MotionState, Phase, SimEntity};
pub use simulator::{SimulationSettings, Simulator};
pub use vector::Vec2;
