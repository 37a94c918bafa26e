use crate::config::AquariumConfig;
use crate::constants::{COMMUNICATION_MIN_OBSERVATIONS, MAX_CONNECTIONS};
use crate::engine::feed::{BackgroundFeed, FeedUpdate, SourceFeed};
use crate::extracts::process::types::{Connection, LifecycleEvent, Snapshot};
use crate::extracts::process::source::RateLimiter;
use crate::extracts::process::{PollingSource, SourceBackend};
use crate::quality::{QualityController, QualitySettings, QualityTier};
use crate::relationships::{assign_groups, CommunicationHistory, GroupAssignment, GroupId};
use crate::simulation::{MotionState, Simulator};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};
use typed_builder::TypedBuilder;

/// Runtime overrides for the population and grouping knobs. Unset fields keep their current
/// value.
#[derive(Debug, Clone, Default, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
pub struct EngineOptions {
    pub max_entities: Option<usize>,
    pub inclusion_probability: Option<f64>,
    pub group_hop_limit: Option<usize>,
    pub communication_window: Option<Duration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TickOutput {
    pub entities: BTreeMap<u32, MotionState>,
    pub groups: BTreeMap<u32, GroupId>,
    pub events: Vec<LifecycleEvent>,
    pub quality: QualitySettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessStatistics {
    pub total_entities: usize,
    pub total_memory_percent: f64,
    pub average_cpu_percent: f64,
    pub total_threads: u64,
    pub new_entities: usize,
    pub dying_entities: usize,
    pub groups_by_kind: BTreeMap<String, usize>,
    pub quality_tier: Option<QualityTier>,
    pub source: String,
}

/// Owns one simulation timeline: the source feed, the relationship state, the flocking world
/// and the quality loop. Everything happens inside [`Engine::tick`].
pub struct Engine {
    config: AquariumConfig,
    feed: SourceFeed,
    snapshot: Snapshot,
    connections: Vec<Connection>,
    connection_refresh: RateLimiter,
    history: CommunicationHistory,
    assignment: GroupAssignment,
    simulator: Simulator,
    quality: QualityController,
    diagnostics: Vec<String>,
    tick_count: u64,
    base_poll_interval: Duration,
    poll_multiplier: u32,
}

impl Engine {
    /// Builds an engine whose source is sampled on the tick thread.
    pub fn new(config: AquariumConfig) -> Self {
        let (backend, diagnostic) = SourceBackend::select(&config);
        let mut engine = Self::with_source(config, backend);
        engine.diagnostics.extend(diagnostic);
        engine
    }

    /// An event-driven backend gets a polling standby for when its listener goes away.
    pub fn with_source(config: AquariumConfig, backend: SourceBackend) -> Self {
        let standby = standby_for(&config, &backend);
        Self::with_standby(config, backend, standby)
    }

    pub fn with_standby(
        config: AquariumConfig,
        backend: SourceBackend,
        standby: Option<PollingSource>,
    ) -> Self {
        Self::with_feed(config, SourceFeed::inline(backend, standby))
    }

    /// Builds an engine whose source is sampled on a tokio task. Must be called from within a
    /// tokio runtime.
    pub fn spawn_background(config: AquariumConfig) -> Self {
        let (backend, diagnostic) = SourceBackend::select(&config);
        let standby = standby_for(&config, &backend);
        let feed = BackgroundFeed::spawn(
            backend,
            standby,
            config.poll_interval(),
            config.connection_limit,
        );
        let mut engine = Self::with_feed(config, SourceFeed::Background(feed));
        engine.diagnostics.extend(diagnostic);
        engine
    }

    fn with_feed(config: AquariumConfig, feed: SourceFeed) -> Self {
        let rng: Box<dyn RngCore + Send> = match config.seed {
            // distinct stream from the admission sampler
            Some(seed) => Box::new(StdRng::seed_from_u64(seed.wrapping_add(1))),
            None => Box::new(StdRng::from_os_rng()),
        };
        info!(
            "engine ready: {} source, world {}x{}, max {} entities",
            feed.name(),
            config.world_width,
            config.world_height,
            config.max_entities
        );

        Self {
            history: CommunicationHistory::new(config.communication_window()),
            simulator: Simulator::new(config.world_width, config.world_height, rng)
                .with_tick_rate(config.active_tick_hz),
            connection_refresh: RateLimiter::new(config.connection_refresh()),
            quality: QualityController::new(config.target_fps, config.recovery_margin_fps),
            base_poll_interval: config.poll_interval(),
            poll_multiplier: 1,
            feed,
            snapshot: Snapshot::new(),
            connections: Vec::new(),
            assignment: GroupAssignment::default(),
            diagnostics: Vec::new(),
            tick_count: 0,
            config,
        }
    }

    pub fn configure(&mut self, options: EngineOptions) {
        let admission_changed =
            options.max_entities.is_some() || options.inclusion_probability.is_some();

        if let Some(max_entities) = options.max_entities {
            self.config.max_entities = max_entities.max(1);
        }
        if let Some(probability) = options.inclusion_probability {
            self.config.inclusion_probability = probability.clamp(0.0, 1.0);
        }
        if let Some(hop_limit) = options.group_hop_limit {
            self.config.group_hop_limit = hop_limit;
        }
        if let Some(window) = options.communication_window {
            self.config.communication_window_secs = window.as_secs();
            self.history.set_window(window);
        }

        if admission_changed {
            self.feed
                .set_admission(self.config.max_entities, self.config.inclusion_probability);
        }
        debug!("engine reconfigured: {options:?}");
    }

    /// Advances the world by `dt` seconds. `observed_fps` is the throughput the caller actually
    /// achieved and feeds the quality loop.
    pub fn tick(&mut self, dt: f64, observed_fps: f64) -> TickOutput {
        let FeedUpdate {
            snapshot,
            events,
            diagnostics,
        } = self.feed.pull();
        if let Some(snapshot) = snapshot {
            self.snapshot = snapshot;
        }
        self.diagnostics.extend(diagnostics);

        let now = Utc::now();
        // paced by wall time so the observation count per window does not depend on tick rate
        if self.connection_refresh.ready() {
            self.connections = self.feed.connections(self.config.connection_limit);
            self.history.record(&self.connections, now);
            self.simulator.set_links(&self.connections);
        }
        self.tick_count += 1;

        let frequent = self
            .history
            .frequent_pairs(now, COMMUNICATION_MIN_OBSERVATIONS);
        self.assignment = assign_groups(&self.snapshot, self.config.group_hop_limit, &frequent);

        self.simulator.sync(&self.snapshot);
        self.simulator.apply_events(&events);

        let quality = self
            .quality
            .observe(observed_fps, self.simulator.len(), dt);
        self.simulator.set_settings(quality.simulation());
        if quality.poll_interval_multiplier != self.poll_multiplier {
            self.poll_multiplier = quality.poll_interval_multiplier.max(1);
            self.feed
                .set_poll_interval(self.base_poll_interval * self.poll_multiplier);
        }

        self.simulator.step(dt, &self.assignment);

        TickOutput {
            entities: self.simulator.motion_states(&self.assignment),
            groups: self
                .assignment
                .membership
                .iter()
                .map(|(&pid, &id)| (pid, id))
                .collect(),
            events,
            quality,
        }
    }

    pub fn connections(&self, limit: usize) -> Vec<Connection> {
        self.feed.connections(limit.min(MAX_CONNECTIONS))
    }

    pub fn statistics(&self) -> ProcessStatistics {
        let total_entities = self.snapshot.len();
        let total_cpu: f64 = self
            .snapshot
            .values()
            .map(|e| f64::from(e.cpu_percent))
            .sum();

        ProcessStatistics {
            total_entities,
            total_memory_percent: self
                .snapshot
                .values()
                .map(|e| f64::from(e.memory_percent))
                .sum(),
            average_cpu_percent: if total_entities == 0 {
                0.0
            } else {
                total_cpu / total_entities as f64
            },
            total_threads: self
                .snapshot
                .values()
                .map(|e| u64::from(e.num_threads))
                .sum(),
            new_entities: self.snapshot.values().filter(|e| e.is_new).count(),
            dying_entities: self.snapshot.values().filter(|e| e.is_dying).count(),
            groups_by_kind: self
                .assignment
                .count_by_kind()
                .into_iter()
                .map(|(kind, count)| (kind.to_string(), count))
                .collect(),
            quality_tier: Some(self.quality.tier()),
            source: self.feed.name().to_string(),
        }
    }

    /// Human-readable notes about degraded operation, such as a source fallback.
    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    pub fn groups(&self) -> &GroupAssignment {
        &self.assignment
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn simulator(&self) -> &Simulator {
        &self.simulator
    }

    pub fn source_name(&self) -> &'static str {
        self.feed.name()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Stops the source's sampling and listening work.
    pub async fn stop(&mut self) {
        self.feed.stop().await;
        info!("engine stopped after {} ticks", self.tick_count);
    }
}

fn standby_for(config: &AquariumConfig, backend: &SourceBackend) -> Option<PollingSource> {
    backend
        .is_event_driven()
        .then(|| PollingSource::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourcePreference;
    use crate::extracts::network::NullProbe;
    use crate::extracts::process::process_table::{MockProcessTable, RawProcess};
    use crate::extracts::process::types::LifecycleEventKind;
    use crate::extracts::network::{ConnectionProbe, ProbeResult};
    use crate::extracts::process::types::ConnectionKind;
    use crate::extracts::process::EventSource;
    use crate::relationships::GroupKind;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    const DT: f64 = 1.0 / 30.0;

    fn raw(pid: u32, ppid: u32, name: &str, cpu: f32) -> RawProcess {
        RawProcess {
            pid,
            ppid: Some(ppid),
            name: Some(name.to_string()),
            exe: Some(format!("/usr/bin/{name}")),
            memory_percent: Some(0.5),
            cpu_percent: Some(cpu),
            num_threads: Some(2),
            ..Default::default()
        }
    }

    fn test_config() -> AquariumConfig {
        AquariumConfig {
            poll_interval_ms: 0,
            source: SourcePreference::Polling,
            seed: Some(7),
            ..AquariumConfig::default()
        }
    }

    /// Counts how often connections were read.
    struct CountingProbe(Arc<Mutex<usize>>);

    impl ConnectionProbe for CountingProbe {
        fn probe(&self, live: &HashSet<u32>) -> ProbeResult {
            *self.0.lock().unwrap() += 1;
            ProbeResult {
                connections: Connection::between(1, 2, ConnectionKind::SharedPort)
                    .filter(|c| live.contains(&c.id_a) && live.contains(&c.id_b))
                    .into_iter()
                    .collect(),
                restricted: false,
            }
        }
    }

    fn scripted_table(script: Arc<Mutex<Vec<RawProcess>>>) -> MockProcessTable {
        let mut table = MockProcessTable::new();
        table
            .expect_enumerate()
            .returning(move || script.lock().unwrap().clone());
        table
    }

    fn scripted_engine_with(
        config: AquariumConfig,
        script: Arc<Mutex<Vec<RawProcess>>>,
        probe: Box<dyn ConnectionProbe>,
    ) -> Engine {
        let source = PollingSource::with_parts(
            &config,
            Box::new(scripted_table(script)),
            probe,
            Box::new(StdRng::seed_from_u64(1)),
        );
        Engine::with_source(config, SourceBackend::Polling(source))
    }

    fn scripted_engine(script: Arc<Mutex<Vec<RawProcess>>>) -> Engine {
        scripted_engine_with(test_config(), script, Box::new(NullProbe))
    }

    #[test]
    fn test_first_tick_spawns_everything() {
        let script = Arc::new(Mutex::new(vec![
            raw(1, 0, "launchd", 1.0),
            raw(2, 1, "node", 2.0),
        ]));
        let mut engine = scripted_engine(script);

        let out = engine.tick(DT, 30.0);
        assert_eq!(out.entities.len(), 2);
        assert_eq!(
            out.events
                .iter()
                .filter(|e| e.kind == LifecycleEventKind::Spawn)
                .count(),
            2
        );
        assert_eq!(out.groups.len(), 2);
        assert_eq!(out.groups[&2].kind, GroupKind::Family);
    }

    #[test]
    fn test_statistics_reflect_snapshot() {
        let script = Arc::new(Mutex::new(vec![
            raw(1, 0, "launchd", 1.0),
            raw(2, 1, "node", 3.0),
        ]));
        let mut engine = scripted_engine(script);
        engine.tick(DT, 30.0);

        let stats = engine.statistics();
        assert_eq!(stats.total_entities, 2);
        assert_eq!(stats.total_threads, 4);
        assert_eq!(stats.new_entities, 2);
        assert!((stats.average_cpu_percent - 2.0).abs() < 1e-6);
        assert!((stats.total_memory_percent - 1.0).abs() < 1e-6);
        assert_eq!(stats.groups_by_kind.get("family"), Some(&1));
        assert_eq!(stats.source, "polling");
    }

    #[test]
    fn test_configure_keeps_unset_fields() {
        let mut engine = scripted_engine(Arc::new(Mutex::new(Vec::new())));
        engine.configure(EngineOptions::builder().group_hop_limit(5).build());
        assert_eq!(engine.config.group_hop_limit, 5);
        assert_eq!(engine.config.max_entities, test_config().max_entities);

        engine.configure(
            EngineOptions::builder()
                .inclusion_probability(3.0)
                .communication_window(Duration::from_secs(10))
                .build(),
        );
        assert_eq!(engine.config.inclusion_probability, 1.0);
        assert_eq!(engine.history.window(), Duration::from_secs(10));
        assert_eq!(engine.config.group_hop_limit, 5);
    }

    #[test]
    fn test_configure_cap_applies_to_next_sample() {
        let script = Arc::new(Mutex::new(
            (10..20).map(|pid| raw(pid, 1, "chrome", pid as f32)).collect(),
        ));
        let mut engine = scripted_engine(script);
        engine.configure(EngineOptions::builder().max_entities(3).build());

        engine.tick(DT, 30.0);
        let mut pids: Vec<u32> = engine.snapshot().keys().copied().collect();
        pids.sort_unstable();
        assert_eq!(pids, vec![17, 18, 19]);
    }

    #[test]
    fn test_low_fps_degrades_quality() {
        let mut engine = scripted_engine(Arc::new(Mutex::new(vec![raw(1, 0, "node", 1.0)])));
        let mut last = None;
        for _ in 0..20 {
            last = Some(engine.tick(DT, 5.0));
        }
        let quality = last.map(|out| out.quality).unwrap();
        assert_eq!(quality.tier, QualityTier::Minimal);
        assert!(!engine.simulator().settings().neighbor_search);
        assert_eq!(engine.poll_multiplier, 2);
    }

    #[test]
    fn test_polling_preference_has_no_diagnostic() {
        let engine = scripted_engine(Arc::new(Mutex::new(Vec::new())));
        assert!(engine.diagnostics().is_empty());
        assert_eq!(engine.source_name(), "polling");
    }

    #[test]
    fn test_connection_refresh_is_paced_by_wall_time() {
        let probes = Arc::new(Mutex::new(0));
        let script = Arc::new(Mutex::new(vec![
            raw(1, 0, "redis", 1.0),
            raw(2, 0, "nginx", 1.0),
        ]));
        let mut engine = scripted_engine_with(
            test_config(),
            script,
            Box::new(CountingProbe(Arc::clone(&probes))),
        );

        // a burst of ticks well inside the two-second refresh period
        for _ in 0..120 {
            engine.tick(DT, 30.0);
        }
        assert_eq!(*probes.lock().unwrap(), 1);
        assert_eq!(engine.history.len(), 1);
        assert_eq!(engine.connections.len(), 1);
    }

    #[test]
    fn test_zero_refresh_reads_connections_every_tick() {
        let probes = Arc::new(Mutex::new(0));
        let config = AquariumConfig {
            connection_refresh_ms: 0,
            ..test_config()
        };
        let script = Arc::new(Mutex::new(vec![raw(1, 0, "redis", 1.0)]));
        let mut engine =
            scripted_engine_with(config, script, Box::new(CountingProbe(Arc::clone(&probes))));
        for _ in 0..5 {
            engine.tick(DT, 30.0);
        }
        assert_eq!(*probes.lock().unwrap(), 5);
    }

    #[test]
    fn test_engine_uses_configured_tick_rate() {
        let config = AquariumConfig {
            active_tick_hz: 60,
            ..test_config()
        };
        let engine =
            scripted_engine_with(config, Arc::new(Mutex::new(Vec::new())), Box::new(NullProbe));
        assert_eq!(engine.simulator().tick_rate(), 60.0);
    }

    #[test]
    fn test_detached_event_source_runs_on_standby() {
        let config = AquariumConfig {
            source: SourcePreference::Event,
            ..test_config()
        };
        let script = Arc::new(Mutex::new(vec![
            raw(1, 0, "launchd", 1.0),
            raw(2, 1, "node", 1.0),
        ]));
        let standby = PollingSource::with_parts(
            &config,
            Box::new(scripted_table(script)),
            Box::new(NullProbe),
            Box::new(StdRng::seed_from_u64(1)),
        );
        let backend =
            SourceBackend::EventDriven(EventSource::detached(&config, "permission denied"));
        let mut engine = Engine::with_standby(config, backend, Some(standby));
        assert_eq!(engine.source_name(), "event-driven");

        engine.tick(DT, 30.0);
        assert_eq!(engine.source_name(), "polling");
        assert_eq!(
            engine.diagnostics(),
            ["event-driven source unavailable: permission denied".to_string()]
        );

        let out = engine.tick(DT, 30.0);
        assert_eq!(out.entities.len(), 2);
        assert_eq!(engine.statistics().source, "polling");
        assert_eq!(engine.diagnostics().len(), 1);
    }

    #[tokio::test]
    async fn test_inline_stop_is_clean() {
        let mut engine = scripted_engine(Arc::new(Mutex::new(vec![raw(1, 0, "node", 1.0)])));
        engine.tick(DT, 30.0);
        engine.stop().await;
        assert_eq!(engine.tick_count(), 1);
    }
}
