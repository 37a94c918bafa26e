use crate::config::AquariumConfig;
use crate::extracts::network::{collect_connections, ConnectionProbe, ProcNetProbe};
use crate::extracts::process::inclusion::{select_population, InclusionPolicy, PopulationLimit};
use crate::extracts::process::process_table::{ProcessTable, SysinfoProcessTable};
use crate::extracts::process::source::{
    admission_rng, entity_from_raw, ProcessSource, RateLimiter,
};
use crate::extracts::process::types::{
    Connection, EventBuffer, LifecycleEvent, Snapshot,
};
use chrono::Utc;
use rand::RngCore;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::debug;

/// Samples the whole process table at a bounded rate and synthesizes lifecycle events by
/// diffing consecutive samples.
pub struct PollingSource {
    table: Box<dyn ProcessTable>,
    probe: Box<dyn ConnectionProbe>,
    rng: Box<dyn RngCore + Send>,
    policy: InclusionPolicy,
    limit: PopulationLimit,
    limiter: RateLimiter,

    snapshot: Snapshot,
    previous_pids: HashSet<u32>,
    previous_exe: HashMap<u32, String>,
    events: EventBuffer,
}

impl PollingSource {
    pub fn new(config: &AquariumConfig) -> Self {
        Self::with_parts(
            config,
            Box::new(SysinfoProcessTable::new()),
            Box::new(ProcNetProbe::default()),
            admission_rng(config),
        )
    }

    pub fn with_parts(
        config: &AquariumConfig,
        table: Box<dyn ProcessTable>,
        probe: Box<dyn ConnectionProbe>,
        rng: Box<dyn RngCore + Send>,
    ) -> Self {
        Self {
            table,
            probe,
            rng,
            policy: InclusionPolicy::from_config(config),
            limit: PopulationLimit::from_config(config),
            limiter: RateLimiter::new(config.poll_interval()),
            snapshot: Snapshot::new(),
            previous_pids: HashSet::new(),
            previous_exe: HashMap::new(),
            events: EventBuffer::default(),
        }
    }

    /// Continues from a view built elsewhere: its live records count as the previous sample,
    /// so the next sample only reports what changed since.
    pub fn adopt(&mut self, snapshot: Snapshot) {
        let live: Snapshot = snapshot
            .into_iter()
            .filter(|(_, entity)| entity.is_live())
            .map(|(pid, mut entity)| {
                entity.is_new = false;
                (pid, entity)
            })
            .collect();
        self.previous_pids = live.keys().copied().collect();
        self.previous_exe = live
            .iter()
            .map(|(pid, entity)| (*pid, entity.exe.clone()))
            .collect();
        self.snapshot = live;
    }

    #[tracing::instrument(skip(self))]
    fn sample(&mut self) {
        let now = Utc::now();
        let admitted = select_population(
            self.table.enumerate(),
            &self.policy,
            &self.limit,
            &self.previous_pids,
            &mut *self.rng,
        );

        let mut next = Snapshot::with_capacity(admitted.len());
        let mut current_exe = HashMap::with_capacity(admitted.len());

        for raw in admitted {
            let pid = raw.pid;
            let is_new = !self.previous_pids.contains(&pid);
            let birth_time = match self.snapshot.get(&pid) {
                Some(previous) if !is_new => previous.birth_time,
                _ => now,
            };
            let entity = entity_from_raw(raw, birth_time, now, is_new);

            if is_new {
                self.events.push(LifecycleEvent::spawn(pid, entity.ppid, now));
            } else if let Some(old_exe) = self.previous_exe.get(&pid) {
                if !old_exe.is_empty() && !entity.exe.is_empty() && *old_exe != entity.exe {
                    self.events.push(LifecycleEvent::exec(
                        pid,
                        Some(entity.ppid),
                        old_exe,
                        &entity.exe,
                        now,
                    ));
                }
            }

            current_exe.insert(pid, entity.exe.clone());
            next.insert(pid, entity);
        }

        let mut departed: Vec<u32> = self
            .previous_pids
            .iter()
            .copied()
            .filter(|pid| !next.contains_key(pid))
            .collect();
        departed.sort_unstable();

        for pid in departed {
            let Some(last) = self.snapshot.remove(&pid) else {
                continue;
            };
            self.events
                .push(LifecycleEvent::exit(pid, Some(last.ppid), now));
            next.insert(pid, last.into_dying(now));
        }

        debug!(
            "sampled {} live entities, {} events pending",
            current_exe.len(),
            self.events.len()
        );

        self.previous_pids = current_exe.keys().copied().collect();
        self.previous_exe = current_exe;
        self.snapshot = next;
    }
}

impl ProcessSource for PollingSource {
    fn advance(&mut self) -> bool {
        if !self.limiter.ready() {
            return false;
        }
        self.sample();
        true
    }

    fn snapshot(&self) -> Snapshot {
        self.snapshot.clone()
    }

    fn drain_events(&mut self) -> Vec<LifecycleEvent> {
        self.events.drain()
    }

    fn connections(&self, limit: usize) -> Vec<Connection> {
        collect_connections(self.probe.as_ref(), &self.snapshot, limit)
    }

    fn set_poll_interval(&mut self, interval: Duration) {
        self.limiter.set_interval(interval);
    }

    fn set_admission(&mut self, max_entities: usize, inclusion_probability: f64) {
        self.limit.max_entities = max_entities;
        self.policy.set_probability(inclusion_probability);
    }

    fn name(&self) -> &'static str {
        "polling"
    }
}
