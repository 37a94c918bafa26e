use aquarium::config::{AquariumConfig, SourcePreference};
use aquarium::constants::COMMUNICATION_MIN_OBSERVATIONS;
use aquarium::extracts::network::{ConnectionProbe, NullProbe, ProbeResult};
use aquarium::extracts::process::process_table::{ProcessTable, RawProcess};
use aquarium::extracts::process::types::{Connection, ConnectionKind, LifecycleEventKind};
use aquarium::extracts::process::{EventSource, PollingSource, SourceBackend};
use aquarium::quality::{QualityController, QualityTier};
use aquarium::relationships::GroupKind;
use aquarium::simulation::Phase;
use aquarium::{Engine, TickOutput};
use aquarium_proc_events::{ProcessStartTrigger, Trigger};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const DT: f64 = 1.0 / 30.0;

/// Process table that returns whatever the test last put in it.
#[derive(Clone, Default)]
struct ScriptedTable {
    rows: Arc<Mutex<Vec<RawProcess>>>,
}

impl ScriptedTable {
    fn set(&self, rows: Vec<RawProcess>) {
        *self.rows.lock().unwrap() = rows;
    }
}

impl ProcessTable for ScriptedTable {
    fn enumerate(&mut self) -> Vec<RawProcess> {
        self.rows.lock().unwrap().clone()
    }

    fn lookup(&mut self, pid: u32) -> Option<RawProcess> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .find(|row| row.pid == pid)
            .cloned()
    }
}

/// Reports the same loopback pairs on every probe.
struct FixedProbe(Vec<(u32, u32)>);

impl ConnectionProbe for FixedProbe {
    fn probe(&self, live: &HashSet<u32>) -> ProbeResult {
        ProbeResult {
            connections: self
                .0
                .iter()
                .filter(|(a, b)| live.contains(a) && live.contains(b))
                .filter_map(|&(a, b)| Connection::between(a, b, ConnectionKind::SharedPort))
                .collect(),
            restricted: false,
        }
    }
}

fn row(pid: u32, ppid: u32, name: &str) -> RawProcess {
    RawProcess {
        pid,
        ppid: Some(ppid),
        name: Some(name.to_string()),
        exe: Some(format!("/usr/bin/{name}")),
        memory_percent: Some(0.5),
        cpu_percent: Some(1.0),
        num_threads: Some(1),
        ..Default::default()
    }
}

fn config() -> AquariumConfig {
    AquariumConfig {
        poll_interval_ms: 0,
        source: SourcePreference::Polling,
        seed: Some(42),
        ..AquariumConfig::default()
    }
}

fn engine_with(config: AquariumConfig, table: &ScriptedTable, probe: Box<dyn ConnectionProbe>) -> Engine {
    let source = PollingSource::with_parts(
        &config,
        Box::new(table.clone()),
        probe,
        Box::new(StdRng::seed_from_u64(3)),
    );
    Engine::with_source(config, SourceBackend::Polling(source))
}

fn polling_over(config: &AquariumConfig, table: &ScriptedTable, seed: u64) -> PollingSource {
    PollingSource::with_parts(
        config,
        Box::new(table.clone()),
        Box::new(NullProbe),
        Box::new(StdRng::seed_from_u64(seed)),
    )
}

fn engine(table: &ScriptedTable) -> Engine {
    engine_with(config(), table, Box::new(NullProbe))
}

fn assert_partition(engine: &Engine, out: &TickOutput) {
    let live: HashSet<u32> = engine
        .snapshot()
        .values()
        .filter(|e| e.is_live())
        .map(|e| e.pid)
        .collect();

    let mut seen = HashSet::new();
    for group in engine.groups().groups.values() {
        for pid in &group.members {
            assert!(seen.insert(*pid), "pid {pid} is in more than one group");
            assert_eq!(out.groups.get(pid), Some(&group.id));
        }
    }
    assert_eq!(seen, live);
}

#[test]
fn family_of_three_led_by_root() {
    let table = ScriptedTable::default();
    table.set(vec![
        row(1, 0, "launchd"),
        row(2, 1, "node"),
        row(3, 1, "python3"),
    ]);
    let mut engine = engine(&table);

    let out = engine.tick(DT, 30.0);
    let id = out.groups[&1];
    assert_eq!(id.kind, GroupKind::Family);
    assert_eq!(out.groups[&2], id);
    assert_eq!(out.groups[&3], id);

    let group = engine.groups().group_of(1).unwrap();
    assert_eq!(group.members, vec![1, 2, 3]);
    assert_eq!(group.leader, 1);
    assert!(!group.is_isolated);
}

#[test]
fn numbered_workers_share_a_name_cluster() {
    let table = ScriptedTable::default();
    table.set(vec![row(10, 0, "worker"), row(11, 0, "worker-2"), row(12, 0, "redis")]);
    let mut engine = engine(&table);

    let out = engine.tick(DT, 30.0);
    assert_eq!(out.groups[&10].kind, GroupKind::NameCluster);
    assert_eq!(out.groups[&10], out.groups[&11]);
    assert_eq!(out.groups[&12].kind, GroupKind::Isolated);
    assert!(engine.groups().group_of(12).unwrap().is_isolated);
}

#[test]
fn exited_entity_is_removed_only_after_decay() {
    let table = ScriptedTable::default();
    table.set(vec![row(1, 0, "launchd"), row(7, 1, "node")]);
    let mut engine = engine(&table);
    engine.tick(DT, 30.0);
    engine.tick(DT, 30.0);

    table.set(vec![row(1, 0, "launchd")]);
    let out = engine.tick(DT, 30.0);
    let exits: Vec<_> = out
        .events
        .iter()
        .filter(|e| e.kind == LifecycleEventKind::Exit)
        .collect();
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].pid, 7);
    assert_eq!(exits[0].ppid, Some(1));
    assert!(engine.snapshot()[&7].is_dying);
    assert_eq!(out.entities[&7].phase, Phase::Dying);
    assert!(!out.groups.contains_key(&7));

    let mut opacity = out.entities[&7].opacity;
    for _ in 0..40 {
        let out = engine.tick(DT, 30.0);
        assert!(out.events.is_empty());
        let state = &out.entities[&7];
        assert_eq!(state.phase, Phase::Dying);
        assert!(state.opacity <= opacity);
        opacity = state.opacity;
    }
    assert!(!engine.snapshot().contains_key(&7));

    for _ in 0..15 {
        engine.tick(DT, 30.0);
    }
    assert!(!engine.simulator().contains(7));
    assert!(engine.simulator().contains(1));
}

#[test]
fn every_appearance_and_departure_is_reported_once() {
    let table = ScriptedTable::default();
    let mut engine = engine(&table);

    let script: Vec<Vec<RawProcess>> = vec![
        vec![row(1, 0, "launchd"), row(2, 1, "node")],
        vec![row(1, 0, "launchd"), row(2, 1, "node"), row(3, 2, "python")],
        vec![row(1, 0, "launchd"), row(3, 2, "python")],
        vec![row(1, 0, "launchd"), row(4, 1, "java"), row(5, 4, "java")],
        vec![row(1, 0, "launchd")],
    ];

    let mut spawns: HashMap<u32, usize> = HashMap::new();
    let mut exits: HashMap<u32, usize> = HashMap::new();
    let mut sequences = HashSet::new();
    for rows in script {
        table.set(rows);
        let out = engine.tick(DT, 30.0);
        for event in &out.events {
            assert!(sequences.insert(event.sequence));
            match event.kind {
                LifecycleEventKind::Spawn => *spawns.entry(event.pid).or_default() += 1,
                LifecycleEventKind::Exit => *exits.entry(event.pid).or_default() += 1,
                LifecycleEventKind::Exec => {}
            }
        }
        assert_partition(&engine, &out);
    }

    for pid in 1..=5 {
        assert_eq!(spawns.get(&pid), Some(&1), "spawn count for {pid}");
    }
    for pid in 2..=5 {
        assert_eq!(exits.get(&pid), Some(&1), "exit count for {pid}");
    }
    assert!(!exits.contains_key(&1));
}

#[test]
fn exec_is_reported_with_both_paths() {
    let table = ScriptedTable::default();
    table.set(vec![row(1, 0, "launchd"), row(9, 1, "bash")]);
    let mut engine = engine(&table);
    engine.tick(DT, 30.0);

    let mut replaced = row(9, 1, "python3");
    replaced.exe = Some("/usr/bin/python3".to_string());
    table.set(vec![row(1, 0, "launchd"), replaced]);
    let out = engine.tick(DT, 30.0);

    let exec = out
        .events
        .iter()
        .find(|e| e.kind == LifecycleEventKind::Exec)
        .unwrap();
    assert_eq!(exec.pid, 9);
    assert_eq!(exec.details["old_exe"], "/usr/bin/bash");
    assert_eq!(exec.details["new_exe"], "/usr/bin/python3");
    assert!(out.entities[&9].exec_transition > 0.0);
}

#[test]
fn frequent_talkers_leave_isolation_but_not_family() {
    let table = ScriptedTable::default();
    table.set(vec![
        row(1, 0, "launchd"),
        row(2, 1, "node"),
        row(20, 0, "alpha"),
        row(21, 0, "beta"),
        row(22, 0, "gamma"),
    ]);
    let config = AquariumConfig {
        connection_refresh_ms: 0,
        ..config()
    };
    let probe = FixedProbe(vec![(20, 21), (2, 22)]);
    let mut engine = engine_with(config, &table, Box::new(probe));

    let first = engine.tick(DT, 30.0);
    assert_eq!(first.groups[&20].kind, GroupKind::Isolated);

    let mut out = first;
    for _ in 0..3 {
        out = engine.tick(DT, 30.0);
    }
    assert_eq!(out.groups[&20].kind, GroupKind::CommunicationCluster);
    assert_eq!(out.groups[&20], out.groups[&21]);
    assert_eq!(out.groups[&2].kind, GroupKind::Family);
    assert_eq!(out.groups[&22].kind, GroupKind::Isolated);
    assert_partition(&engine, &out);

    let kinds: Vec<ConnectionKind> = engine.connections(20).iter().map(|c| c.kind).collect();
    assert!(kinds.contains(&ConnectionKind::SharedPort));
    assert!(kinds.contains(&ConnectionKind::ParentChild));
}

#[test]
fn talkers_cluster_at_the_default_refresh_cadence() {
    let table = ScriptedTable::default();
    table.set(vec![row(30, 0, "alpha"), row(31, 0, "beta")]);
    let defaults = AquariumConfig::default();
    let config = AquariumConfig {
        headless_tick_hz: 1,
        ..config()
    };
    assert_eq!(config.connection_refresh_ms, defaults.connection_refresh_ms);
    assert_eq!(config.communication_window_secs, defaults.communication_window_secs);
    let mut engine = engine_with(config, &table, Box::new(FixedProbe(vec![(30, 31)])));

    // a 1 Hz headless loop: only every other tick lands past the refresh period
    let period = Duration::from_millis(1050);
    let mut out = engine.tick(1.0, 30.0);
    assert_eq!(out.groups[&30].kind, GroupKind::Isolated);
    for _ in 0..2 * (COMMUNICATION_MIN_OBSERVATIONS - 1) {
        std::thread::sleep(period);
        out = engine.tick(period.as_secs_f64(), 30.0);
    }
    assert_eq!(out.groups[&30].kind, GroupKind::CommunicationCluster);
    assert_eq!(out.groups[&30], out.groups[&31]);
}

#[test]
fn detached_event_source_runs_on_polling_with_diagnostic() {
    let table = ScriptedTable::default();
    table.set(vec![row(1, 0, "launchd"), row(2, 1, "node")]);
    let config = AquariumConfig {
        source: SourcePreference::Event,
        ..config()
    };
    let backend = SourceBackend::EventDriven(EventSource::detached(&config, "unsupported"));
    let standby = polling_over(&config, &table, 3);
    let mut engine = Engine::with_standby(config, backend, Some(standby));

    engine.tick(DT, 30.0);
    let out = engine.tick(DT, 30.0);
    assert_eq!(engine.source_name(), "polling");
    assert_eq!(
        engine.diagnostics(),
        ["event-driven source unavailable: unsupported".to_string()]
    );
    assert_eq!(out.entities.len(), 2);
    assert_eq!(out.groups[&2].kind, GroupKind::Family);
}

#[test]
fn lost_event_listener_hands_over_to_polling_mid_run() {
    let table = ScriptedTable::default();
    table.set(vec![row(1, 0, "launchd"), row(2, 1, "node"), row(3, 1, "python")]);
    let config = AquariumConfig {
        source: SourcePreference::Event,
        ..config()
    };
    let (tx, rx) = mpsc::unbounded_channel();
    let events = EventSource::from_channel(
        &config,
        rx,
        Box::new(table.clone()),
        Box::new(NullProbe),
        Box::new(StdRng::seed_from_u64(3)),
    );
    let standby = polling_over(&config, &table, 4);
    let mut engine =
        Engine::with_standby(config, SourceBackend::EventDriven(events), Some(standby));

    let mut spawns: HashMap<u32, usize> = HashMap::new();
    let mut exits: HashMap<u32, usize> = HashMap::new();
    let mut record = |out: &TickOutput| {
        for event in &out.events {
            match event.kind {
                LifecycleEventKind::Spawn => *spawns.entry(event.pid).or_default() += 1,
                LifecycleEventKind::Exit => *exits.entry(event.pid).or_default() += 1,
                LifecycleEventKind::Exec => {}
            }
        }
    };

    record(&engine.tick(DT, 30.0));
    assert_eq!(engine.source_name(), "event-driven");

    table.set(vec![
        row(1, 0, "launchd"),
        row(2, 1, "node"),
        row(3, 1, "python"),
        row(4, 2, "node"),
    ]);
    tx.send(Trigger::ProcessStart(ProcessStartTrigger {
        pid: 4,
        ppid: 2,
        started_at: Utc::now(),
    }))
    .unwrap();
    record(&engine.tick(DT, 30.0));

    // the listener goes away, and pid 3 exits without anyone noticing
    drop(tx);
    table.set(vec![row(1, 0, "launchd"), row(2, 1, "node"), row(4, 2, "node")]);
    record(&engine.tick(DT, 30.0));
    assert_eq!(engine.source_name(), "polling");
    assert_eq!(engine.diagnostics().len(), 1);
    assert!(engine.diagnostics()[0].contains("process event listener stopped"));

    let out = engine.tick(DT, 30.0);
    record(&out);
    for _ in 0..3 {
        record(&engine.tick(DT, 30.0));
    }

    for pid in 1..=4 {
        assert_eq!(spawns.get(&pid), Some(&1), "spawn count for {pid}");
    }
    assert_eq!(exits.get(&3), Some(&1));
    assert_eq!(exits.len(), 1);
    assert!(engine.snapshot().contains_key(&4));
    assert_eq!(out.groups[&4], out.groups[&1]);
}

#[test]
fn population_stays_partitioned_under_churn() {
    let table = ScriptedTable::default();
    let mut engine = engine(&table);

    for round in 0..12u32 {
        let mut rows = vec![row(1, 0, "launchd")];
        for pid in 100..100 + (round % 5) * 4 {
            let parent = if pid % 3 == 0 { pid - 1 } else { 1 };
            let name = if pid % 2 == 0 { "worker" } else { "chrome" };
            rows.push(row(pid, parent, name));
        }
        table.set(rows);
        let out = engine.tick(DT, 30.0);
        assert_partition(&engine, &out);
    }
}

#[test]
fn fps_just_below_threshold_holds_reduced_until_margin_cleared() {
    let mut controller = QualityController::new(30.0, 3.0);
    let reduced = controller.reduced_threshold();

    for _ in 0..100 {
        controller.observe(reduced - 1.0, 50, DT);
    }
    assert_eq!(controller.tier(), QualityTier::Reduced);

    // above the threshold but inside the recovery margin
    for _ in 0..100 {
        controller.observe(reduced + 1.0, 50, DT);
    }
    assert_eq!(controller.tier(), QualityTier::Reduced);

    for _ in 0..100 {
        controller.observe(reduced + 4.0, 50, DT);
    }
    assert_eq!(controller.tier(), QualityTier::Full);
}

#[test]
fn minimal_tier_disables_flocking_in_the_engine() {
    let table = ScriptedTable::default();
    table.set(vec![row(1, 0, "launchd"), row(2, 1, "node"), row(3, 1, "node")]);
    let mut engine = engine(&table);

    let mut last = None;
    for _ in 0..30 {
        last = Some(engine.tick(DT, 5.0));
    }
    let quality = last.unwrap().quality;
    assert_eq!(quality.tier, QualityTier::Minimal);
    assert!(!quality.neighbor_search);
    assert!(!engine.simulator().settings().neighbor_search);
}
