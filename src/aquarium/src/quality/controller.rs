use crate::simulation::SimulationSettings;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::info;

const WINDOW_CAPACITY: usize = 100;
const MIN_SAMPLES: usize = 15;
const ADJUST_INTERVAL_SECS: f64 = 5.0;
const REDUCED_RATIO: f64 = 0.75;
const MINIMAL_RATIO: f64 = 0.5;
/// Populations up to this size get every entity updated every tick
const AFFORDABLE_POPULATION: f64 = 100.0;
const MAX_UPDATE_STRIDE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Full,
    Reduced,
    Minimal,
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QualityTier::Full => write!(f, "full"),
            QualityTier::Reduced => write!(f, "reduced"),
            QualityTier::Minimal => write!(f, "minimal"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualitySettings {
    pub tier: QualityTier,
    pub neighbor_search: bool,
    pub update_stride: u32,
    /// Upper bound on decorative particles the renderer may draw
    pub particle_budget: u32,
    /// Glow, pulsation and other purely visual effects
    pub visual_effects: bool,
    pub poll_interval_multiplier: u32,
}

impl QualitySettings {
    pub fn simulation(&self) -> SimulationSettings {
        SimulationSettings {
            neighbor_search: self.neighbor_search,
            update_stride: self.update_stride,
        }
    }
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self {
            tier: QualityTier::Full,
            neighbor_search: true,
            update_stride: 1,
            particle_budget: 100,
            visual_effects: true,
            poll_interval_multiplier: 1,
        }
    }
}

/// Feedback loop from observed frame rate to simulation fidelity.
#[derive(Debug, Clone)]
pub struct QualityController {
    target_fps: f64,
    recovery_margin: f64,
    fps_window: VecDeque<f64>,
    count_window: VecDeque<usize>,
    tier: QualityTier,
    settings: QualitySettings,
    since_adjust: f64,
}

impl QualityController {
    pub fn new(target_fps: f64, recovery_margin: f64) -> Self {
        Self {
            target_fps,
            recovery_margin: recovery_margin.max(0.0),
            fps_window: VecDeque::with_capacity(WINDOW_CAPACITY),
            count_window: VecDeque::with_capacity(WINDOW_CAPACITY),
            tier: QualityTier::Full,
            settings: QualitySettings::default(),
            since_adjust: 0.0,
        }
    }

    pub fn reduced_threshold(&self) -> f64 {
        self.target_fps * REDUCED_RATIO
    }

    pub fn minimal_threshold(&self) -> f64 {
        self.target_fps * MINIMAL_RATIO
    }

    pub fn tier(&self) -> QualityTier {
        self.tier
    }

    pub fn settings(&self) -> QualitySettings {
        self.settings
    }

    pub fn average_fps(&self) -> Option<f64> {
        if self.fps_window.is_empty() {
            return None;
        }
        Some(self.fps_window.iter().sum::<f64>() / self.fps_window.len() as f64)
    }

    fn average_count(&self) -> f64 {
        if self.count_window.is_empty() {
            return 0.0;
        }
        self.count_window.iter().sum::<usize>() as f64 / self.count_window.len() as f64
    }

    fn push<T>(window: &mut VecDeque<T>, value: T) {
        if window.len() == WINDOW_CAPACITY {
            window.pop_front();
        }
        window.push_back(value);
    }

    fn next_tier(&self, avg: f64) -> QualityTier {
        let reduced = self.reduced_threshold();
        let minimal = self.minimal_threshold();
        match self.tier {
            QualityTier::Full if avg < minimal => QualityTier::Minimal,
            QualityTier::Full if avg < reduced => QualityTier::Reduced,
            QualityTier::Reduced if avg < minimal => QualityTier::Minimal,
            QualityTier::Reduced if avg > reduced + self.recovery_margin => QualityTier::Full,
            QualityTier::Minimal if avg > minimal + self.recovery_margin => QualityTier::Reduced,
            tier => tier,
        }
    }

    fn derive_settings(&self) -> QualitySettings {
        let population = self.average_count();
        let mut stride = if population <= AFFORDABLE_POPULATION {
            1
        } else {
            ((population / AFFORDABLE_POPULATION).ceil() as u32).clamp(2, MAX_UPDATE_STRIDE)
        };

        match self.tier {
            QualityTier::Full => QualitySettings {
                update_stride: stride,
                ..QualitySettings::default()
            },
            QualityTier::Reduced => {
                if population > AFFORDABLE_POPULATION {
                    stride = stride.max(2);
                }
                QualitySettings {
                    tier: QualityTier::Reduced,
                    neighbor_search: true,
                    update_stride: stride,
                    particle_budget: 50,
                    visual_effects: false,
                    poll_interval_multiplier: 1,
                }
            }
            QualityTier::Minimal => QualitySettings {
                tier: QualityTier::Minimal,
                neighbor_search: false,
                update_stride: MAX_UPDATE_STRIDE,
                particle_budget: 20,
                visual_effects: false,
                poll_interval_multiplier: 2,
            },
        }
    }

    /// Records one frame-rate sample and the live population, `dt` seconds after the previous
    /// call. Returns the settings in force after this observation.
    pub fn observe(&mut self, fps: f64, entity_count: usize, dt: f64) -> QualitySettings {
        if fps.is_finite() && fps >= 0.0 {
            Self::push(&mut self.fps_window, fps);
        }
        Self::push(&mut self.count_window, entity_count);
        if dt.is_finite() && dt > 0.0 {
            self.since_adjust += dt;
        }

        let mut changed = false;
        if self.fps_window.len() >= MIN_SAMPLES {
            if let Some(avg) = self.average_fps() {
                let next = self.next_tier(avg);
                if next != self.tier {
                    info!(
                        "quality {} -> {} (avg {:.1} fps, target {:.1})",
                        self.tier, next, avg, self.target_fps
                    );
                    self.tier = next;
                    changed = true;
                }
            }
        }

        if changed || self.since_adjust >= ADJUST_INTERVAL_SECS {
            self.since_adjust = 0.0;
            self.settings = self.derive_settings();
        }
        self.settings
    }
}
