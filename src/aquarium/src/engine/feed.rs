use crate::extracts::process::types::{Connection, LifecycleEvent, Snapshot};
use crate::extracts::process::{PollingSource, ProcessSource, SourceBackend};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Kernel notifications are drained at least this often, whatever the poll interval.
const EVENT_DRAIN_INTERVAL: Duration = Duration::from_millis(200);

/// What the source produced since the previous pull.
#[derive(Debug, Default)]
pub struct FeedUpdate {
    /// `None` when no new sample was completed
    pub snapshot: Option<Snapshot>,
    pub events: Vec<LifecycleEvent>,
    /// Notes about degraded operation raised since the previous pull
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedCommand {
    SetPollInterval(Duration),
    SetAdmission {
        max_entities: usize,
        inclusion_probability: f64,
    },
}

/// How the engine reaches its source: called on the tick thread, or sampled on a tokio task.
/// An event-driven source carries a polling standby that takes over if it stops working.
pub enum SourceFeed {
    Inline {
        source: SourceBackend,
        standby: Option<PollingSource>,
    },
    Background(BackgroundFeed),
}

impl SourceFeed {
    pub fn inline(source: SourceBackend, standby: Option<PollingSource>) -> Self {
        SourceFeed::Inline { source, standby }
    }

    pub fn pull(&mut self) -> FeedUpdate {
        match self {
            SourceFeed::Inline { source, standby } => {
                let snapshot = source.advance().then(|| source.snapshot());
                let events = source.drain_events();
                FeedUpdate {
                    snapshot,
                    events,
                    diagnostics: source.fall_back(standby).into_iter().collect(),
                }
            }
            SourceFeed::Background(feed) => feed.pull(),
        }
    }

    pub fn connections(&self, limit: usize) -> Vec<Connection> {
        match self {
            SourceFeed::Inline { source, .. } => source.connections(limit),
            SourceFeed::Background(feed) => feed.connections(limit),
        }
    }

    pub fn set_poll_interval(&mut self, interval: Duration) {
        match self {
            SourceFeed::Inline { source, standby } => {
                source.set_poll_interval(interval);
                if let Some(standby) = standby.as_mut() {
                    standby.set_poll_interval(interval);
                }
            }
            SourceFeed::Background(feed) => feed.set_poll_interval(interval),
        }
    }

    pub fn set_admission(&mut self, max_entities: usize, inclusion_probability: f64) {
        match self {
            SourceFeed::Inline { source, standby } => {
                source.set_admission(max_entities, inclusion_probability);
                if let Some(standby) = standby.as_mut() {
                    standby.set_admission(max_entities, inclusion_probability);
                }
            }
            SourceFeed::Background(feed) => feed.send(FeedCommand::SetAdmission {
                max_entities,
                inclusion_probability,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SourceFeed::Inline { source, .. } => source.name(),
            SourceFeed::Background(feed) => feed.name(),
        }
    }

    pub async fn stop(&mut self) {
        match self {
            SourceFeed::Inline { source, .. } => source.shutdown(),
            SourceFeed::Background(feed) => feed.stop().await,
        }
    }
}

/// A source sampled on its own task. Snapshots and connections are handed over through `watch`
/// channels, so the tick only ever sees the latest complete value and never waits; events go
/// through an unbounded channel so none are dropped.
pub struct BackgroundFeed {
    snapshot_rx: watch::Receiver<Snapshot>,
    connections_rx: watch::Receiver<Vec<Connection>>,
    events_rx: UnboundedReceiver<LifecycleEvent>,
    diagnostics_rx: UnboundedReceiver<String>,
    name_rx: watch::Receiver<&'static str>,
    commands_tx: UnboundedSender<FeedCommand>,
    cancellation_token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct FeedChannels {
    snapshot_tx: watch::Sender<Snapshot>,
    connections_tx: watch::Sender<Vec<Connection>>,
    events_tx: UnboundedSender<LifecycleEvent>,
    diagnostics_tx: UnboundedSender<String>,
    name_tx: watch::Sender<&'static str>,
    commands_rx: UnboundedReceiver<FeedCommand>,
}

/// Sampling state owned by the task.
struct FeedState {
    source: Arc<Mutex<SourceBackend>>,
    standby: Option<PollingSource>,
    poll_interval: Duration,
    connection_limit: usize,
}

impl BackgroundFeed {
    /// Spawns the sampling task on the current tokio runtime.
    pub fn spawn(
        mut source: SourceBackend,
        mut standby: Option<PollingSource>,
        poll_interval: Duration,
        connection_limit: usize,
    ) -> Self {
        let name = source.name();
        let cadence = sampling_cadence(source.is_event_driven(), poll_interval);
        // the task's ticker paces sampling from here on
        source.set_poll_interval(Duration::ZERO);
        if let Some(standby) = standby.as_mut() {
            standby.set_poll_interval(Duration::ZERO);
        }

        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::new());
        let (connections_tx, connections_rx) = watch::channel(Vec::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (diagnostics_tx, diagnostics_rx) = mpsc::unbounded_channel();
        let (name_tx, name_rx) = watch::channel(name);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let cancellation_token = CancellationToken::new();

        let channels = FeedChannels {
            snapshot_tx,
            connections_tx,
            events_tx,
            diagnostics_tx,
            name_tx,
            commands_rx,
        };
        let state = FeedState {
            source: Arc::new(Mutex::new(source)),
            standby,
            poll_interval,
            connection_limit,
        };
        let task = tokio::spawn(run_feed(state, channels, cancellation_token.clone()));
        info!("{name} source sampling in the background every {cadence:?}");

        Self {
            snapshot_rx,
            connections_rx,
            events_rx,
            diagnostics_rx,
            name_rx,
            commands_tx,
            cancellation_token,
            task: Some(task),
        }
    }

    pub fn set_poll_interval(&self, interval: Duration) {
        self.send(FeedCommand::SetPollInterval(interval));
    }

    /// Name of the backend currently sampling; changes if the task falls back to polling.
    pub fn name(&self) -> &'static str {
        *self.name_rx.borrow()
    }

    pub fn pull(&mut self) -> FeedUpdate {
        let snapshot = match self.snapshot_rx.has_changed() {
            Ok(true) => Some(self.snapshot_rx.borrow_and_update().clone()),
            _ => None,
        };
        let mut events = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            events.push(event);
        }
        let mut diagnostics = Vec::new();
        while let Ok(note) = self.diagnostics_rx.try_recv() {
            diagnostics.push(note);
        }
        FeedUpdate {
            snapshot,
            events,
            diagnostics,
        }
    }

    pub fn connections(&self, limit: usize) -> Vec<Connection> {
        self.connections_rx
            .borrow()
            .iter()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn send(&self, command: FeedCommand) {
        if self.commands_tx.send(command).is_err() {
            debug!("background feed already stopped, dropping command");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Cancels the sampling task and waits for it to wind down the source.
    pub async fn stop(&mut self) {
        self.cancellation_token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("background feed ended abnormally: {e}");
            }
        }
    }
}

impl Drop for BackgroundFeed {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

fn sampling_cadence(event_driven: bool, poll_interval: Duration) -> Duration {
    if event_driven {
        poll_interval.min(EVENT_DRAIN_INTERVAL)
    } else {
        poll_interval
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

impl FeedState {
    async fn cadence(&mut self) -> Duration {
        sampling_cadence(self.source.lock().await.is_event_driven(), self.poll_interval)
    }

    /// Returns `true` when the sampling cadence changed.
    async fn apply(&mut self, command: FeedCommand) -> bool {
        match command {
            FeedCommand::SetPollInterval(interval) => {
                self.poll_interval = interval;
                true
            }
            FeedCommand::SetAdmission {
                max_entities,
                inclusion_probability,
            } => {
                self.source
                    .lock()
                    .await
                    .set_admission(max_entities, inclusion_probability);
                if let Some(standby) = self.standby.as_mut() {
                    standby.set_admission(max_entities, inclusion_probability);
                }
                false
            }
        }
    }

    async fn sample(&mut self, channels: &FeedChannels) {
        let sampling = Arc::clone(&self.source);
        let connection_limit = self.connection_limit;
        let sampled = tokio::task::spawn_blocking(move || {
            let mut guard = sampling.blocking_lock();
            if !guard.advance() {
                return None;
            }
            Some((
                guard.snapshot(),
                guard.drain_events(),
                guard.connections(connection_limit),
            ))
        })
        .await;

        match sampled {
            Ok(Some((snapshot, events, connections))) => {
                for event in events {
                    if channels.events_tx.send(event).is_err() {
                        break;
                    }
                }
                channels.snapshot_tx.send_replace(snapshot);
                channels.connections_tx.send_replace(connections);
            }
            Ok(None) => {}
            Err(e) => error!("sampling task failed: {e}"),
        }
    }

    /// Swaps in the standby if the source stopped working. Returns `true` on a swap.
    async fn recover(&mut self, channels: &FeedChannels) -> bool {
        let mut guard = self.source.lock().await;
        let Some(note) = guard.fall_back(&mut self.standby) else {
            return false;
        };
        channels.name_tx.send_replace(guard.name());
        if channels.diagnostics_tx.send(note).is_err() {
            debug!("feed reader gone, dropping diagnostic");
        }
        true
    }
}

async fn run_feed(
    mut state: FeedState,
    mut channels: FeedChannels,
    cancellation_token: CancellationToken,
) {
    let mut interval = ticker(state.cadence().await);

    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => {
                debug!("background feed cancelled");
                break;
            }

            Some(command) = channels.commands_rx.recv() => {
                if state.apply(command).await {
                    interval = ticker(state.cadence().await);
                }
            }

            _ = interval.tick() => {
                state.sample(&channels).await;
                if state.recover(&channels).await {
                    interval = ticker(state.cadence().await);
                }
            }
        }
    }

    state.source.lock().await.shutdown();
    info!("background feed stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AquariumConfig;
    use crate::extracts::network::NullProbe;
    use crate::extracts::process::process_table::{MockProcessTable, RawProcess};
    use crate::extracts::process::types::LifecycleEventKind;
    use crate::extracts::process::EventSource;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn node_table() -> MockProcessTable {
        let mut table = MockProcessTable::new();
        table.expect_enumerate().returning(|| {
            vec![RawProcess {
                pid: 42,
                ppid: Some(1),
                name: Some("node".to_string()),
                ..Default::default()
            }]
        });
        table
    }

    fn polling() -> PollingSource {
        PollingSource::with_parts(
            &AquariumConfig::default(),
            Box::new(node_table()),
            Box::new(NullProbe),
            Box::new(StdRng::seed_from_u64(9)),
        )
    }

    fn polling_backend() -> SourceBackend {
        SourceBackend::Polling(polling())
    }

    /// An event-driven backend whose listener is already gone.
    fn orphaned_event_backend() -> SourceBackend {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(tx);
        SourceBackend::EventDriven(EventSource::from_channel(
            &AquariumConfig::default(),
            rx,
            Box::new(node_table()),
            Box::new(NullProbe),
            Box::new(StdRng::seed_from_u64(9)),
        ))
    }

    #[tokio::test]
    async fn test_background_feed_delivers_and_stops() {
        let mut feed =
            BackgroundFeed::spawn(polling_backend(), None, Duration::from_millis(10), 20);

        let mut snapshot = None;
        let mut events = Vec::new();
        for _ in 0..200 {
            let update = feed.pull();
            events.extend(update.events);
            if let Some(s) = update.snapshot {
                snapshot = Some(s);
            }
            if snapshot.is_some() && !events.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let snapshot = snapshot.expect("a sample arrives");
        assert!(snapshot.contains_key(&42));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, LifecycleEventKind::Spawn);

        assert!(feed.is_running());
        feed.stop().await;
        assert!(!feed.is_running());
    }

    #[tokio::test]
    async fn test_pull_without_new_sample_is_empty() {
        let mut feed =
            BackgroundFeed::spawn(polling_backend(), None, Duration::from_secs(3600), 20);
        // the first tick fires immediately; let it land then drain it
        for _ in 0..200 {
            if feed.pull().snapshot.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let update = feed.pull();
        assert!(update.snapshot.is_none());
        assert!(update.events.is_empty());
        feed.stop().await;
    }

    #[test]
    fn test_event_cadence_is_capped() {
        assert_eq!(
            sampling_cadence(true, Duration::from_secs(2)),
            EVENT_DRAIN_INTERVAL
        );
        assert_eq!(
            sampling_cadence(false, Duration::from_secs(2)),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_inline_feed_passthrough() {
        let mut feed = SourceFeed::inline(polling_backend(), None);
        let update = feed.pull();
        assert!(update.snapshot.is_some());
        assert_eq!(update.events.len(), 1);
        assert!(update.diagnostics.is_empty());
        assert_eq!(feed.name(), "polling");
        assert!(feed.connections(20).is_empty());
    }

    #[test]
    fn test_inline_feed_switches_to_standby_when_listener_dies() {
        let mut feed = SourceFeed::inline(orphaned_event_backend(), Some(polling()));
        assert_eq!(feed.name(), "event-driven");

        // the bulk scan still lands before the disconnect is noticed
        let update = feed.pull();
        assert!(update.snapshot.unwrap().contains_key(&42));
        assert_eq!(update.events.len(), 1);
        assert_eq!(update.diagnostics.len(), 1);
        assert!(update.diagnostics[0].starts_with("event-driven source unavailable"));
        assert_eq!(feed.name(), "polling");

        // the standby continues from the inherited view without re-reporting pid 42
        let update = feed.pull();
        assert!(update.snapshot.unwrap().contains_key(&42));
        assert!(update.events.is_empty());
        assert!(update.diagnostics.is_empty());
    }

    #[tokio::test]
    async fn test_background_feed_switches_to_standby() {
        let mut feed = BackgroundFeed::spawn(
            orphaned_event_backend(),
            Some(polling()),
            Duration::from_millis(10),
            20,
        );

        let mut diagnostics = Vec::new();
        for _ in 0..200 {
            diagnostics.extend(feed.pull().diagnostics);
            if !diagnostics.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(feed.name(), "polling");
        assert!(feed.is_running());
        feed.stop().await;
    }
}
