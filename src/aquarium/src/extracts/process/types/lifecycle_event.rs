use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleEventKind {
    Spawn,
    Exec,
    Exit,
}

impl std::fmt::Display for LifecycleEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleEventKind::Spawn => write!(f, "spawn"),
            LifecycleEventKind::Exec => write!(f, "exec"),
            LifecycleEventKind::Exit => write!(f, "exit"),
        }
    }
}

/// A delta in the process population between two samples.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleEvent {
    /// Per-source sequence number, assigned when the event is buffered
    pub sequence: u64,
    pub kind: LifecycleEventKind,
    pub pid: u32,
    /// Always set for spawn events
    pub ppid: Option<u32>,
    pub timestamp: DateTime<Utc>,
    pub details: BTreeMap<String, String>,
}

impl LifecycleEvent {
    fn new(
        kind: LifecycleEventKind,
        pid: u32,
        ppid: Option<u32>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            sequence: 0,
            kind,
            pid,
            ppid,
            timestamp,
            details: BTreeMap::new(),
        }
    }

    pub fn spawn(pid: u32, ppid: u32, timestamp: DateTime<Utc>) -> Self {
        Self::new(LifecycleEventKind::Spawn, pid, Some(ppid), timestamp)
    }

    pub fn exec(
        pid: u32,
        ppid: Option<u32>,
        old_exe: &str,
        new_exe: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::new(LifecycleEventKind::Exec, pid, ppid, timestamp)
            .with_detail("old_exe", old_exe)
            .with_detail("new_exe", new_exe)
    }

    pub fn exit(pid: u32, ppid: Option<u32>, timestamp: DateTime<Utc>) -> Self {
        Self::new(LifecycleEventKind::Exit, pid, ppid, timestamp)
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<String>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// Accumulates events between drains. Every buffered event gets a fresh sequence number and
/// `drain` hands over ownership of everything buffered so far, so no event is returned twice
/// and none is lost between two drains.
#[derive(Debug, Default)]
pub struct EventBuffer {
    pending: Vec<LifecycleEvent>,
    next_sequence: u64,
}

impl EventBuffer {
    pub fn push(&mut self, mut event: LifecycleEvent) {
        self.next_sequence += 1;
        event.sequence = self.next_sequence;
        self.pending.push(event);
    }

    pub fn drain(&mut self) -> Vec<LifecycleEvent> {
        std::mem::take(&mut self.pending)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
