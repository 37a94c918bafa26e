use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::constants::{
    ACTIVE_TICK_HZ, COMMUNICATION_MIN_OBSERVATIONS, CONNECTION_REFRESH_MS,
    DEFAULT_COMMUNICATION_WINDOW_SECS,
    DEFAULT_GROUP_HOP_LIMIT, DEFAULT_INCLUSION_PROBABILITY, DEFAULT_MAX_ENTITIES,
    EXCLUDED_PATTERNS, HEADLESS_TICK_HZ, IMPORTANT_NAMES, MAX_CONNECTIONS,
    PROCESS_POLLING_INTERVAL_MS, RECOVERY_MARGIN_FPS, TARGET_FPS, WORLD_HEIGHT, WORLD_WIDTH,
};
use config::{Config as RConfig, ConfigBuilder, File};

/// Which backend the engine should try first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourcePreference {
    /// Kernel notifications when available, polling otherwise.
    #[default]
    Auto,
    Polling,
    Event,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortField {
    #[default]
    Cpu,
    Memory,
    Name,
    Pid,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AquariumConfig {
    pub max_entities: usize,
    pub inclusion_probability: f64,
    pub group_hop_limit: usize,
    pub communication_window_secs: u64,

    pub poll_interval_ms: u64,
    /// Tick rate the per-tick motion constants are tuned for
    pub active_tick_hz: u32,
    pub headless_tick_hz: u32,
    /// Minimum wall time between connection refreshes, whatever the tick rate
    pub connection_refresh_ms: u64,
    pub connection_limit: usize,

    pub source: SourcePreference,
    pub sort_by: SortField,
    pub sort_order: SortOrder,

    pub world_width: f64,
    pub world_height: f64,

    pub target_fps: f64,
    pub recovery_margin_fps: f64,

    pub important_names: Vec<String>,
    pub excluded_patterns: Vec<String>,

    #[serde(default)]
    pub seed: Option<u64>,
}

impl AquariumConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn communication_window(&self) -> Duration {
        Duration::from_secs(self.communication_window_secs)
    }

    pub fn connection_refresh(&self) -> Duration {
        Duration::from_millis(self.connection_refresh_ms)
    }

    fn validate(self) -> Result<Self> {
        ensure!(
            (0.0..=1.0).contains(&self.inclusion_probability),
            "inclusion_probability must be within [0, 1], got {}",
            self.inclusion_probability
        );
        ensure!(self.max_entities > 0, "max_entities must be positive");
        ensure!(
            self.connection_limit <= MAX_CONNECTIONS,
            "connection_limit must not exceed {}",
            MAX_CONNECTIONS
        );
        ensure!(
            self.world_width > 0.0 && self.world_height > 0.0,
            "world dimensions must be positive"
        );
        ensure!(self.target_fps > 0.0, "target_fps must be positive");
        ensure!(self.active_tick_hz > 0, "active_tick_hz must be positive");
        ensure!(
            self.connection_refresh() * COMMUNICATION_MIN_OBSERVATIONS as u32
                <= self.communication_window(),
            "connection_refresh_ms of {} allows fewer than {} refreshes per {}s window",
            self.connection_refresh_ms,
            COMMUNICATION_MIN_OBSERVATIONS,
            self.communication_window_secs
        );
        Ok(self)
    }
}

impl Default for AquariumConfig {
    fn default() -> Self {
        Self {
            max_entities: DEFAULT_MAX_ENTITIES,
            inclusion_probability: DEFAULT_INCLUSION_PROBABILITY,
            group_hop_limit: DEFAULT_GROUP_HOP_LIMIT,
            communication_window_secs: DEFAULT_COMMUNICATION_WINDOW_SECS,
            poll_interval_ms: PROCESS_POLLING_INTERVAL_MS,
            active_tick_hz: ACTIVE_TICK_HZ,
            headless_tick_hz: HEADLESS_TICK_HZ,
            connection_refresh_ms: CONNECTION_REFRESH_MS,
            connection_limit: MAX_CONNECTIONS,
            source: SourcePreference::default(),
            sort_by: SortField::default(),
            sort_order: SortOrder::default(),
            world_width: WORLD_WIDTH,
            world_height: WORLD_HEIGHT,
            target_fps: TARGET_FPS,
            recovery_margin_fps: RECOVERY_MARGIN_FPS,
            important_names: IMPORTANT_NAMES.iter().map(|s| s.to_string()).collect(),
            excluded_patterns: EXCLUDED_PATTERNS.iter().map(|s| s.to_string()).collect(),
            seed: None,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    fn builder_with_defaults() -> Result<ConfigBuilder<config::builder::DefaultState>> {
        let builder = RConfig::builder()
            .set_default("max_entities", DEFAULT_MAX_ENTITIES as u64)?
            .set_default("inclusion_probability", DEFAULT_INCLUSION_PROBABILITY)?
            .set_default("group_hop_limit", DEFAULT_GROUP_HOP_LIMIT as u64)?
            .set_default(
                "communication_window_secs",
                DEFAULT_COMMUNICATION_WINDOW_SECS,
            )?
            .set_default("poll_interval_ms", PROCESS_POLLING_INTERVAL_MS)?
            .set_default("active_tick_hz", ACTIVE_TICK_HZ as u64)?
            .set_default("headless_tick_hz", HEADLESS_TICK_HZ as u64)?
            .set_default("connection_refresh_ms", CONNECTION_REFRESH_MS)?
            .set_default("connection_limit", MAX_CONNECTIONS as u64)?
            .set_default("source", "auto")?
            .set_default("sort_by", "cpu")?
            .set_default("sort_order", "desc")?
            .set_default("world_width", WORLD_WIDTH)?
            .set_default("world_height", WORLD_HEIGHT)?
            .set_default("target_fps", TARGET_FPS)?
            .set_default("recovery_margin_fps", RECOVERY_MARGIN_FPS)?
            .set_default::<&str, Vec<&str>>("important_names", IMPORTANT_NAMES.to_vec())?
            .set_default::<&str, Vec<&str>>("excluded_patterns", EXCLUDED_PATTERNS.to_vec())?;

        Ok(builder)
    }

    pub fn load_default_config() -> Result<AquariumConfig> {
        let config: AquariumConfig = Self::builder_with_defaults()?
            .build()?
            .try_deserialize()
            .context("failed to build default config")?;

        config.validate()
    }

    /// Layers a TOML file over the defaults. Keys missing from the file keep their defaults.
    pub fn load_from_file(path: &Path) -> Result<AquariumConfig> {
        let config: AquariumConfig = Self::builder_with_defaults()?
            .add_source(File::from(path))
            .build()
            .with_context(|| format!("failed to read config file {}", path.display()))?
            .try_deserialize()
            .context("failed to parse config file")?;

        config.validate()
    }
}
