use crate::extracts::process::types::Connection;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

/// Trailing record of which pairs were seen communicating, and when.
#[derive(Debug, Clone)]
pub struct CommunicationHistory {
    window: Duration,
    observations: VecDeque<(DateTime<Utc>, (u32, u32))>,
}

impl CommunicationHistory {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            observations: VecDeque::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Records one observation per distinct pair in `connections`.
    pub fn record(&mut self, connections: &[Connection], now: DateTime<Utc>) {
        let mut pairs: Vec<(u32, u32)> = connections.iter().map(Connection::pair).collect();
        pairs.sort_unstable();
        pairs.dedup();
        self.observations
            .extend(pairs.into_iter().map(|pair| (now, pair)));
        self.prune(now);
    }

    fn within_window(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        // a negative age (clock stepped back) keeps the observation
        (now - at)
            .to_std()
            .map(|age| age <= self.window)
            .unwrap_or(true)
    }

    pub fn prune(&mut self, now: DateTime<Utc>) {
        while let Some(&(at, _)) = self.observations.front() {
            if self.within_window(at, now) {
                break;
            }
            self.observations.pop_front();
        }
    }

    /// Pairs observed at least `min_observations` times inside the window ending at `now`.
    pub fn frequent_pairs(&self, now: DateTime<Utc>, min_observations: usize) -> Vec<(u32, u32)> {
        let mut counts: BTreeMap<(u32, u32), usize> = BTreeMap::new();
        for &(at, pair) in &self.observations {
            if self.within_window(at, now) {
                *counts.entry(pair).or_default() += 1;
            }
        }
        counts
            .into_iter()
            .filter(|&(_, count)| count >= min_observations)
            .map(|(pair, _)| pair)
            .collect()
    }
}
