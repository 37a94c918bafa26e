use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// The full set of known entities at one sampling instant, keyed by pid.
pub type Snapshot = HashMap<u32, EntitySnapshot>;

/// One process at one sampling instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntitySnapshot {
    pub pid: u32,
    pub ppid: u32,
    pub name: String,
    pub exe: String,
    /// Share of total system memory, 0-100
    pub memory_percent: f32,
    /// Share of one core; may exceed 100 on multi-core attribution
    pub cpu_percent: f32,
    pub num_threads: u32,
    pub status: String,
    pub cmdline: Vec<String>,
    /// When this pid was first seen by the source
    pub birth_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    /// True only on the sample where the pid first appeared
    pub is_new: bool,
    /// Set once, on the sample where the pid disappeared; never cleared
    pub is_dying: bool,
}

impl EntitySnapshot {
    pub fn is_live(&self) -> bool {
        !self.is_dying
    }

    pub fn base_name(&self) -> String {
        normalize_base_name(&self.name)
    }

    /// The final record for a pid that vanished from a fresh sample.
    pub fn into_dying(mut self, now: DateTime<Utc>) -> Self {
        self.is_new = false;
        self.is_dying = true;
        self.last_update = now;
        self
    }
}

/// Reduces a display name to the key used for name clustering: the first whitespace token,
/// lowercased, without trailing punctuation (`postgres:`) or one trailing numeric instance
/// suffix (`worker-2`, `python3`, `pool_01`).
pub fn normalize_base_name(name: &str) -> String {
    let token = name.split_whitespace().next().unwrap_or("unknown");
    let lower = token.to_lowercase();
    let is_separator = |c: char| !c.is_alphanumeric();

    let word = lower.trim_end_matches(is_separator);
    if word.is_empty() {
        return lower;
    }
    let stem = word
        .trim_end_matches(|c: char| c.is_ascii_digit())
        .trim_end_matches(is_separator);

    if stem.is_empty() {
        word.to_string()
    } else {
        stem.to_string()
    }
}
