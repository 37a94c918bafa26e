use crate::config::AquariumConfig;
use crate::extracts::network::{collect_connections, ConnectionProbe, ProcNetProbe};
use crate::extracts::process::inclusion::{select_population, InclusionPolicy, PopulationLimit};
use crate::extracts::process::process_table::{ProcessTable, SysinfoProcessTable};
use crate::extracts::process::source::{admission_rng, entity_from_raw, Availability, ProcessSource};
use crate::extracts::process::types::{Connection, EventBuffer, LifecycleEvent, Snapshot};
use aquarium_proc_events::{
    start_processing_events, ProcessEndTrigger, ProcessExecTrigger, ProcessStartTrigger,
    Subscription, Trigger,
};
use chrono::Utc;
use rand::RngCore;
use std::collections::HashSet;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, info, warn};

/// Follows kernel fork/exec/exit notifications. One bulk scan seeds the view; after that the
/// process table is only consulted for detail lookups on notified pids.
pub struct EventSource {
    table: Box<dyn ProcessTable>,
    probe: Box<dyn ConnectionProbe>,
    rng: Box<dyn RngCore + Send>,
    policy: InclusionPolicy,
    limit: PopulationLimit,

    receiver: Option<UnboundedReceiver<Trigger>>,
    subscription: Option<Subscription>,
    availability: Availability,

    scanned: bool,
    snapshot: Snapshot,
    events: EventBuffer,
}

impl EventSource {
    /// Attaches to the kernel process-event connector. Never fails: an attach error leaves the
    /// source unavailable with the reason recorded.
    pub fn attach(config: &AquariumConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        match start_processing_events(tx) {
            Ok(subscription) => {
                info!("attached to kernel process events");
                let mut source = Self::with_parts(
                    config,
                    Some(rx),
                    Box::new(SysinfoProcessTable::new()),
                    Box::new(ProcNetProbe::default()),
                    admission_rng(config),
                );
                source.subscription = Some(subscription);
                source
            }
            Err(e) => {
                warn!("event-driven process source disabled: {e}");
                Self::detached(config, e.to_string())
            }
        }
    }

    /// A source that never attached. It stays unavailable and reports `reason`.
    pub fn detached(config: &AquariumConfig, reason: impl Into<String>) -> Self {
        let mut source = Self::with_parts(
            config,
            None,
            Box::new(SysinfoProcessTable::new()),
            Box::new(ProcNetProbe::default()),
            admission_rng(config),
        );
        source.availability = Availability::Unavailable {
            reason: reason.into(),
        };
        source
    }

    /// Builds a source fed from an existing trigger channel.
    pub fn from_channel(
        config: &AquariumConfig,
        receiver: UnboundedReceiver<Trigger>,
        table: Box<dyn ProcessTable>,
        probe: Box<dyn ConnectionProbe>,
        rng: Box<dyn RngCore + Send>,
    ) -> Self {
        Self::with_parts(config, Some(receiver), table, probe, rng)
    }

    fn with_parts(
        config: &AquariumConfig,
        receiver: Option<UnboundedReceiver<Trigger>>,
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
            receiver,
            subscription: None,
            availability: Availability::Available,
            scanned: false,
            snapshot: Snapshot::new(),
            events: EventBuffer::default(),
        }
    }

    fn live_count(&self) -> usize {
        self.snapshot.values().filter(|e| e.is_live()).count()
    }

    fn is_tracked(&self, pid: u32) -> bool {
        self.snapshot.get(&pid).is_some_and(|e| e.is_live())
    }

    #[tracing::instrument(skip(self))]
    fn initial_scan(&mut self) {
        let now = Utc::now();
        let admitted = select_population(
            self.table.enumerate(),
            &self.policy,
            &self.limit,
            &HashSet::new(),
            &mut *self.rng,
        );
        for raw in admitted {
            let entity = entity_from_raw(raw, now, now, true);
            self.events
                .push(LifecycleEvent::spawn(entity.pid, entity.ppid, now));
            self.snapshot.insert(entity.pid, entity);
        }
        info!("initial scan admitted {} processes", self.snapshot.len());
    }

    /// Retires records that were reported dying on the previous advance and clears the
    /// new-arrival flags.
    fn settle(&mut self) {
        self.snapshot.retain(|_, entity| entity.is_live());
        for entity in self.snapshot.values_mut() {
            entity.is_new = false;
        }
    }

    fn on_start(&mut self, trigger: ProcessStartTrigger) {
        if self.is_tracked(trigger.pid) {
            return;
        }
        if self.live_count() >= self.limit.max_entities {
            debug!(pid = trigger.pid, "population full, ignoring fork");
            return;
        }
        // lost the race with the process exiting
        let Some(raw) = self.table.lookup(trigger.pid) else {
            return;
        };
        if self.policy.is_excluded(raw.name_or_unknown()) {
            return;
        }

        let mut entity = entity_from_raw(raw, trigger.started_at, trigger.started_at, true);
        if trigger.ppid != 0 {
            entity.ppid = trigger.ppid;
        }
        self.events.push(LifecycleEvent::spawn(
            entity.pid,
            entity.ppid,
            trigger.started_at,
        ));
        self.snapshot.insert(entity.pid, entity);
    }

    fn on_exec(&mut self, trigger: ProcessExecTrigger) {
        if !self.is_tracked(trigger.pid) {
            return;
        }
        let refreshed = self.table.lookup(trigger.pid);
        let Some(entity) = self.snapshot.get_mut(&trigger.pid) else {
            return;
        };
        let old_exe = entity.exe.clone();

        if let Some(raw) = refreshed {
            let mut updated = entity_from_raw(raw, entity.birth_time, trigger.executed_at, false);
            if updated.ppid == 0 {
                updated.ppid = entity.ppid;
            }
            *entity = updated;
        } else {
            entity.last_update = trigger.executed_at;
        }

        self.events.push(LifecycleEvent::exec(
            entity.pid,
            Some(entity.ppid),
            &old_exe,
            &entity.exe,
            trigger.executed_at,
        ));
    }

    fn on_end(&mut self, trigger: ProcessEndTrigger) {
        if !self.is_tracked(trigger.pid) {
            return;
        }
        let Some(last) = self.snapshot.remove(&trigger.pid) else {
            return;
        };
        let mut event = LifecycleEvent::exit(trigger.pid, Some(last.ppid), trigger.finished_at);
        if let Some(reason) = &trigger.exit_reason {
            event = event.with_detail("exit_reason", reason.to_string());
        }
        self.events.push(event);
        self.snapshot
            .insert(trigger.pid, last.into_dying(trigger.finished_at));
    }

    fn drain_triggers(&mut self) -> usize {
        let mut drained = 0;
        loop {
            let next = match self.receiver.as_mut() {
                Some(receiver) => receiver.try_recv(),
                None => return drained,
            };
            match next {
                Ok(trigger) => {
                    drained += 1;
                    match trigger {
                        Trigger::ProcessStart(t) => self.on_start(t),
                        Trigger::ProcessExec(t) => self.on_exec(t),
                        Trigger::ProcessEnd(t) => self.on_end(t),
                    }
                }
                Err(TryRecvError::Empty) => return drained,
                Err(TryRecvError::Disconnected) => {
                    warn!("process event listener disconnected");
                    self.receiver = None;
                    self.availability = Availability::Unavailable {
                        reason: "process event listener stopped".to_string(),
                    };
                    return drained;
                }
            }
        }
    }
}

impl ProcessSource for EventSource {
    fn advance(&mut self) -> bool {
        if !self.availability.is_available() {
            return false;
        }
        self.settle();
        if !self.scanned {
            self.initial_scan();
            self.scanned = true;
        }
        let drained = self.drain_triggers();
        if drained > 0 {
            debug!("applied {drained} process notifications");
        }
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

    fn availability(&self) -> Availability {
        self.availability.clone()
    }

    fn set_admission(&mut self, max_entities: usize, inclusion_probability: f64) {
        self.limit.max_entities = max_entities;
        self.policy.set_probability(inclusion_probability);
    }

    fn shutdown(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.stop();
        }
        self.receiver = None;
        self.availability = Availability::Unavailable {
            reason: "source stopped".to_string(),
        };
    }

    fn name(&self) -> &'static str {
        "event-driven"
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.stop();
        }
    }
}
