mod controller;

pub use controller::{QualityController, QualitySettings, QualityTier};
