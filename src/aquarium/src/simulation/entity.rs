use crate::relationships::GroupId;
use crate::simulation::vector::Vec2;
use serde::Serialize;

pub const BASE_SIZE: f64 = 10.0;
const MAX_SIZE_FACTOR: f64 = 60.0;
const GIANT_MEMORY_PERCENT: f32 = 5.0;
const GIANT_SIZE_FACTOR: f64 = 5.0;

/// Nominal ticks for the spawn ramp and for the death decay
const RAMP_TICKS: f64 = 50.0;
pub const EVENT_EFFECT_TICKS: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Spawning,
    Alive,
    Dying,
}

fn cpu_fraction(cpu_percent: f32) -> f64 {
    (cpu_percent as f64 / 100.0).clamp(0.0, 1.0)
}

/// Exponential memory-to-size factor, capped.
pub fn size_factor(memory_percent: f32) -> f64 {
    if memory_percent <= 0.0 {
        return 1.0;
    }
    (8.0 * memory_percent as f64 / 100.0).exp().min(MAX_SIZE_FACTOR)
}

pub fn is_memory_giant(memory_percent: f32) -> bool {
    memory_percent >= GIANT_MEMORY_PERCENT || size_factor(memory_percent) >= GIANT_SIZE_FACTOR
}

/// 0..1, rising steeply as CPU approaches a full core.
pub fn glow_intensity(cpu_percent: f32) -> f64 {
    let c = cpu_fraction(cpu_percent);
    ((3.0 * c).exp() - 1.0) / (3.0_f64.exp() - 1.0)
}

/// Speed cap per tick for an entity with this CPU share.
pub fn speed_limit(cpu_percent: f32) -> f64 {
    let c = cpu_fraction(cpu_percent);
    let factor = 1.0 + ((4.0 * c).exp() - 1.0) / (4.0_f64.exp() - 1.0) * 6.0;
    2.0 * factor.min(8.0)
}

/// Kinetic energy with mass from memory and velocity from CPU.
pub fn kinetic_energy(memory_percent: f32, cpu_percent: f32) -> f64 {
    let mass = 1.0 + memory_percent.max(0.0) as f64;
    let v = speed_limit(cpu_percent);
    0.5 * mass * v * v
}

/// Per-tick view of one simulated entity, handed to the renderer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MotionState {
    pub position: Vec2,
    pub velocity: Vec2,
    pub phase: Phase,
    /// Ramp position within the current phase, 0..1
    pub progress: f64,
    pub scale: f64,
    pub opacity: f64,
    pub size: f64,
    pub is_memory_giant: bool,
    pub glow_intensity: f64,
    pub fork_glow: f64,
    pub exec_transition: f64,
    pub group: Option<GroupId>,
}

#[derive(Debug, Clone)]
pub struct SimEntity {
    pub pid: u32,
    pub position: Vec2,
    pub velocity: Vec2,
    pub target: Vec2,
    pub retarget_in: f64,
    pub phase: Phase,
    pub progress: f64,
    ramp_ticks: f64,
    pub memory_percent: f32,
    pub cpu_percent: f32,
    pub fork_glow_ticks: u32,
    pub exec_ticks: u32,
}

impl SimEntity {
    pub fn new(pid: u32, position: Vec2, velocity: Vec2, retarget_in: f64) -> Self {
        Self {
            pid,
            position,
            velocity,
            target: position,
            retarget_in,
            phase: Phase::Spawning,
            progress: 0.0,
            ramp_ticks: 0.0,
            memory_percent: 0.0,
            cpu_percent: 0.0,
            fork_glow_ticks: 0,
            exec_ticks: 0,
        }
    }

    pub fn update_vitals(&mut self, memory_percent: f32, cpu_percent: f32) {
        self.memory_percent = memory_percent.max(0.0);
        self.cpu_percent = cpu_percent.max(0.0);
    }

    pub fn energy(&self) -> f64 {
        kinetic_energy(self.memory_percent, self.cpu_percent)
    }

    pub fn is_dying(&self) -> bool {
        self.phase == Phase::Dying
    }

    /// Enters the dying phase. Only the first call has any effect.
    pub fn start_dying(&mut self) {
        if self.phase != Phase::Dying {
            self.phase = Phase::Dying;
            self.progress = 0.0;
            self.ramp_ticks = 0.0;
        }
    }

    pub fn mark_forked(&mut self) {
        self.fork_glow_ticks = EVENT_EFFECT_TICKS;
    }

    pub fn mark_exec(&mut self) {
        self.exec_ticks = EVENT_EFFECT_TICKS;
    }

    /// Moves the lifecycle ramp forward by `steps` nominal ticks. Returns `true` once the decay
    /// has completed and the entity should be removed.
    pub fn advance_phase(&mut self, steps: f64) -> bool {
        let elapsed = steps.max(0.0).round() as u32;
        self.fork_glow_ticks = self.fork_glow_ticks.saturating_sub(elapsed.max(1));
        self.exec_ticks = self.exec_ticks.saturating_sub(elapsed.max(1));

        if self.phase == Phase::Alive {
            return false;
        }
        self.ramp_ticks += steps.max(0.0);
        self.progress = (self.ramp_ticks / RAMP_TICKS).min(1.0);

        match self.phase {
            Phase::Spawning if self.progress >= 1.0 => {
                self.phase = Phase::Alive;
                self.ramp_ticks = 0.0;
                false
            }
            Phase::Dying => self.progress >= 1.0,
            _ => false,
        }
    }

    pub fn scale(&self) -> f64 {
        match self.phase {
            Phase::Spawning => 0.1 + 0.9 * self.progress,
            Phase::Alive => 1.0,
            Phase::Dying => 1.0 - self.progress,
        }
    }

    pub fn opacity(&self) -> f64 {
        match self.phase {
            Phase::Spawning => self.progress,
            Phase::Alive => 1.0,
            Phase::Dying => 1.0 - self.progress,
        }
    }

    pub fn motion_state(&self, group: Option<GroupId>) -> MotionState {
        MotionState {
            position: self.position,
            velocity: self.velocity,
            phase: self.phase,
            progress: self.progress,
            scale: self.scale(),
            opacity: self.opacity(),
            size: BASE_SIZE * size_factor(self.memory_percent),
            is_memory_giant: is_memory_giant(self.memory_percent),
            glow_intensity: glow_intensity(self.cpu_percent),
            fork_glow: self.fork_glow_ticks as f64 / EVENT_EFFECT_TICKS as f64,
            exec_transition: self.exec_ticks as f64 / EVENT_EFFECT_TICKS as f64,
            group,
        }
    }
}
