use crate::config::{AquariumConfig, SortField, SortOrder};
use crate::constants::{CPU_INCLUSION_THRESHOLD, MEMORY_INCLUSION_THRESHOLD};
use crate::extracts::process::process_table::RawProcess;
use rand::{Rng, RngCore};
use std::cmp::Ordering;
use std::collections::HashSet;

/// Why a process was let into (or kept out of) the visible population.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Excluded,
    Important,
    Busy,
    /// Admitted on an earlier sample and kept without a new draw
    Retained,
    Sampled,
    Rejected,
}

impl Admission {
    pub fn is_admitted(self) -> bool {
        !matches!(self, Admission::Excluded | Admission::Rejected)
    }
}

/// Admission control for the process table. Name patterns are matched as case-insensitive
/// substrings; exclusion always wins over every other rule.
#[derive(Debug, Clone)]
pub struct InclusionPolicy {
    important: Vec<String>,
    excluded: Vec<String>,
    probability: f64,
}

impl InclusionPolicy {
    pub fn new(important: &[String], excluded: &[String], probability: f64) -> Self {
        let lower = |patterns: &[String]| {
            patterns
                .iter()
                .map(|p| p.to_lowercase())
                .filter(|p| !p.is_empty())
                .collect()
        };
        Self {
            important: lower(important),
            excluded: lower(excluded),
            probability: probability.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &AquariumConfig) -> Self {
        Self::new(
            &config.important_names,
            &config.excluded_patterns,
            config.inclusion_probability,
        )
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }

    pub fn set_probability(&mut self, probability: f64) {
        self.probability = probability.clamp(0.0, 1.0);
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.excluded.iter().any(|p| lower.contains(p.as_str()))
    }

    pub fn is_important(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.important.iter().any(|p| lower.contains(p.as_str()))
    }

    /// Decides admission for one process. `previously_admitted` skips the random draw so a
    /// quiet process does not flicker in and out between samples.
    pub fn admit(
        &self,
        name: &str,
        memory_percent: f32,
        cpu_percent: f32,
        previously_admitted: bool,
        rng: &mut dyn RngCore,
    ) -> Admission {
        if self.is_excluded(name) {
            return Admission::Excluded;
        }
        if self.is_important(name) {
            return Admission::Important;
        }
        if memory_percent > MEMORY_INCLUSION_THRESHOLD || cpu_percent > CPU_INCLUSION_THRESHOLD {
            return Admission::Busy;
        }
        if previously_admitted {
            return Admission::Retained;
        }
        if rng.random::<f64>() < self.probability {
            Admission::Sampled
        } else {
            Admission::Rejected
        }
    }
}

/// Upper bound on the admitted population, and the order used to decide who stays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PopulationLimit {
    pub max_entities: usize,
    pub sort_by: SortField,
    pub sort_order: SortOrder,
}

impl PopulationLimit {
    pub fn from_config(config: &AquariumConfig) -> Self {
        Self {
            max_entities: config.max_entities,
            sort_by: config.sort_by,
            sort_order: config.sort_order,
        }
    }

    fn compare(&self, a: &RawProcess, b: &RawProcess) -> Ordering {
        let primary = match self.sort_by {
            SortField::Cpu => a
                .cpu_percent
                .unwrap_or(0.0)
                .total_cmp(&b.cpu_percent.unwrap_or(0.0)),
            SortField::Memory => a
                .memory_percent
                .unwrap_or(0.0)
                .total_cmp(&b.memory_percent.unwrap_or(0.0)),
            SortField::Name => a
                .name_or_unknown()
                .to_lowercase()
                .cmp(&b.name_or_unknown().to_lowercase()),
            SortField::Pid => a.pid.cmp(&b.pid),
        };
        let primary = match self.sort_order {
            SortOrder::Asc => primary,
            SortOrder::Desc => primary.reverse(),
        };
        primary.then(a.pid.cmp(&b.pid))
    }
}

/// Runs admission over one enumeration of the process table, then orders the survivors and
/// cuts them at the population limit.
pub fn select_population(
    processes: Vec<RawProcess>,
    policy: &InclusionPolicy,
    limit: &PopulationLimit,
    previously_admitted: &HashSet<u32>,
    rng: &mut dyn RngCore,
) -> Vec<RawProcess> {
    let mut admitted: Vec<RawProcess> = processes
        .into_iter()
        .filter(|raw| {
            policy
                .admit(
                    raw.name_or_unknown(),
                    raw.memory_percent.unwrap_or(0.0),
                    raw.cpu_percent.unwrap_or(0.0),
                    previously_admitted.contains(&raw.pid),
                    rng,
                )
                .is_admitted()
        })
        .collect();

    admitted.sort_by(|a, b| limit.compare(a, b));
    admitted.truncate(limit.max_entities);
    admitted
}
