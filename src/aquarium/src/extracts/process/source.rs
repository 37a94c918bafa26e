use crate::config::{AquariumConfig, SourcePreference};
use crate::extracts::process::event_source::EventSource;
use crate::extracts::process::polling_source::PollingSource;
use crate::extracts::process::process_table::RawProcess;
use crate::extracts::process::types::{Connection, EntitySnapshot, LifecycleEvent, Snapshot};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Available,
    Unavailable { reason: String },
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available)
    }
}

/// The capability every process data backend offers to the engine.
pub trait ProcessSource: Send {
    /// Does at most one unit of sampling or draining work. Returns `false` when the call was
    /// skipped by the rate limiter or the backend is unavailable.
    fn advance(&mut self) -> bool;

    /// An owned copy of the most recent complete view.
    fn snapshot(&self) -> Snapshot;

    /// Hands over every event buffered since the previous call.
    fn drain_events(&mut self) -> Vec<LifecycleEvent>;

    fn connections(&self, limit: usize) -> Vec<Connection>;

    fn availability(&self) -> Availability {
        Availability::Available
    }

    fn set_poll_interval(&mut self, _interval: Duration) {}

    fn set_admission(&mut self, max_entities: usize, inclusion_probability: f64);

    /// Stops any listening work owned by the backend.
    fn shutdown(&mut self) {}

    fn name(&self) -> &'static str;
}

/// Minimum spacing between two units of work.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    interval: Duration,
    last: Option<Instant>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Returns `true` and starts a new period if the previous one has elapsed.
    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }
}

/// Random source used for admission sampling. Seeded when the config carries a seed.
pub fn admission_rng(config: &AquariumConfig) -> Box<dyn RngCore + Send> {
    match config.seed {
        Some(seed) => Box::new(StdRng::seed_from_u64(seed)),
        None => Box::new(StdRng::from_os_rng()),
    }
}

/// Builds a snapshot record from a raw table row, substituting defaults for missing fields.
pub(crate) fn entity_from_raw(
    raw: RawProcess,
    birth_time: DateTime<Utc>,
    now: DateTime<Utc>,
    is_new: bool,
) -> EntitySnapshot {
    let name = raw.name_or_unknown().to_string();
    EntitySnapshot {
        pid: raw.pid,
        ppid: raw.ppid.unwrap_or(0),
        name,
        exe: raw.exe.unwrap_or_default(),
        memory_percent: raw.memory_percent.filter(|m| m.is_finite()).unwrap_or(0.0).max(0.0),
        cpu_percent: raw.cpu_percent.filter(|c| c.is_finite()).unwrap_or(0.0).max(0.0),
        num_threads: raw.num_threads.unwrap_or(1).max(1),
        status: raw.status.unwrap_or_else(|| "unknown".to_string()),
        cmdline: raw.cmdline,
        birth_time,
        last_update: now,
        is_new,
        is_dying: false,
    }
}

/// The closed set of backends. Chosen once, at construction.
pub enum SourceBackend {
    Polling(PollingSource),
    EventDriven(EventSource),
}

impl SourceBackend {
    /// Picks the backend named by the config preference. An event-driven backend that fails to
    /// attach is replaced by polling; the returned string says why.
    pub fn select(config: &AquariumConfig) -> (Self, Option<String>) {
        if config.source == SourcePreference::Polling {
            info!("using polling process source");
            return (SourceBackend::Polling(PollingSource::new(config)), None);
        }

        let mut backend = SourceBackend::EventDriven(EventSource::attach(config));
        let diagnostic = backend.fall_back(&mut Some(PollingSource::new(config)));
        if diagnostic.is_none() {
            info!("using event-driven process source");
        }
        (backend, diagnostic)
    }

    pub fn is_event_driven(&self) -> bool {
        matches!(self, SourceBackend::EventDriven(_))
    }

    /// Swaps an unavailable event-driven backend for `standby`, which continues from the last
    /// known view. Returns the diagnostic when the swap happens; does nothing otherwise.
    pub fn fall_back(&mut self, standby: &mut Option<PollingSource>) -> Option<String> {
        let reason = match self {
            SourceBackend::EventDriven(events) => match events.availability() {
                Availability::Unavailable { reason } => reason,
                Availability::Available => return None,
            },
            SourceBackend::Polling(_) => return None,
        };
        let mut polling = standby.take()?;
        polling.adopt(self.snapshot());
        self.shutdown();

        let diagnostic = format!("event-driven source unavailable: {reason}");
        warn!("{diagnostic}, falling back to polling");
        *self = SourceBackend::Polling(polling);
        Some(diagnostic)
    }

    fn inner(&self) -> &dyn ProcessSource {
        match self {
            SourceBackend::Polling(source) => source,
            SourceBackend::EventDriven(source) => source,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn ProcessSource {
        match self {
            SourceBackend::Polling(source) => source,
            SourceBackend::EventDriven(source) => source,
        }
    }
}

impl ProcessSource for SourceBackend {
    fn advance(&mut self) -> bool {
        self.inner_mut().advance()
    }

    fn snapshot(&self) -> Snapshot {
        self.inner().snapshot()
    }

    fn drain_events(&mut self) -> Vec<LifecycleEvent> {
        self.inner_mut().drain_events()
    }

    fn connections(&self, limit: usize) -> Vec<Connection> {
        self.inner().connections(limit)
    }

    fn availability(&self) -> Availability {
        self.inner().availability()
    }

    fn set_poll_interval(&mut self, interval: Duration) {
        self.inner_mut().set_poll_interval(interval)
    }

    fn set_admission(&mut self, max_entities: usize, inclusion_probability: f64) {
        self.inner_mut()
            .set_admission(max_entities, inclusion_probability)
    }

    fn shutdown(&mut self) {
        self.inner_mut().shutdown()
    }

    fn name(&self) -> &'static str {
        self.inner().name()
    }
}
