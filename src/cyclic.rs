//! Cyclic polling scheduler and last-known-value cache.
//!
//! Every command with a non-zero poll interval gets one schedule entry.
//! The scheduler itself is tick-driven and owns no thread or clock: the
//! daemon's poll loop feeds it millisecond timestamps, enqueues the due
//! commands at poll priority and reports completions back. Poll results
//! land in a shared [`CyclicCache`] that client sessions read without
//! ever touching the bus.

use crate::bridge::TransactionResult;
use crate::error::BusError;
use crate::registry::{CommandDefinition, ReplyValues};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Last known state of one polled command.
///
/// A failed poll never erases previously cached values; it only records
/// the error alongside them, so readers can tell fresh data from stale.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Decoded values of the most recent successful poll.
    pub values: Option<ReplyValues>,
    /// Timestamp of the most recent successful poll, in unix ms.
    pub updated_ms: Option<u64>,
    /// Error of the most recent poll, cleared on success.
    pub last_error: Option<BusError>,
}

impl CacheEntry {
    fn empty() -> Self {
        Self {
            values: None,
            updated_ms: None,
            last_error: None,
        }
    }
}

/// Shared read side of the poll results. Entries are swapped whole, so a
/// reader always sees one consistent poll outcome.
#[derive(Debug)]
pub struct CyclicCache {
    entries: RwLock<HashMap<String, Arc<CacheEntry>>>,
}

impl CyclicCache {
    fn new(defs: &[Arc<CommandDefinition>]) -> Arc<Self> {
        let entries = defs
            .iter()
            .map(|d| (d.name.clone(), Arc::new(CacheEntry::empty())))
            .collect();
        Arc::new(Self {
            entries: RwLock::new(entries),
        })
    }

    /// Cached state for one command; `None` if the command is not polled.
    pub fn get(&self, name: &str) -> Option<Arc<CacheEntry>> {
        self.entries.read().unwrap().get(name).cloned()
    }

    /// All cached entries, ordered by command name.
    pub fn snapshot(&self) -> Vec<(String, Arc<CacheEntry>)> {
        let entries = self.entries.read().unwrap();
        let mut all: Vec<_> = entries
            .iter()
            .map(|(name, entry)| (name.clone(), Arc::clone(entry)))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    fn store_success(&self, name: &str, values: ReplyValues, now_ms: u64) {
        let mut entries = self.entries.write().unwrap();
        entries.insert(
            name.to_string(),
            Arc::new(CacheEntry {
                values: Some(values),
                updated_ms: Some(now_ms),
                last_error: None,
            }),
        );
    }

    fn store_failure(&self, name: &str, err: BusError) {
        let mut entries = self.entries.write().unwrap();
        let prior = entries.get(name).cloned();
        let (values, updated_ms) = match prior.as_deref() {
            Some(entry) => (entry.values.clone(), entry.updated_ms),
            None => (None, None),
        };
        entries.insert(
            name.to_string(),
            Arc::new(CacheEntry {
                values,
                updated_ms,
                last_error: Some(err),
            }),
        );
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PollStats {
    pub polls_started: u64,
    pub polls_succeeded: u64,
    pub polls_failed: u64,
}

#[derive(Debug)]
enum PollPhase {
    Idle { next_due_ms: u64 },
    InFlight,
}

#[derive(Debug)]
struct PollEntry {
    def: Arc<CommandDefinition>,
    phase: PollPhase,
}

/// Tick-driven poll schedule. Single-owner: only the daemon's poll loop
/// calls `tick` and `complete`.
#[derive(Debug)]
pub struct PollScheduler {
    entries: Vec<PollEntry>,
    cache: Arc<CyclicCache>,
    stats: PollStats,
}

impl PollScheduler {
    /// Builds the schedule with every entry due immediately, so the cache
    /// warms up right after startup.
    pub fn new(defs: Vec<Arc<CommandDefinition>>, now_ms: u64) -> (Self, Arc<CyclicCache>) {
        let cache = CyclicCache::new(&defs);
        let entries = defs
            .into_iter()
            .map(|def| PollEntry {
                def,
                phase: PollPhase::Idle { next_due_ms: now_ms },
            })
            .collect();
        (
            Self {
                entries,
                cache: Arc::clone(&cache),
                stats: PollStats::default(),
            },
            cache,
        )
    }

    /// Commands due at `now_ms`. Each returned command is marked in
    /// flight and will not be returned again until completed.
    pub fn tick(&mut self, now_ms: u64) -> Vec<Arc<CommandDefinition>> {
        let mut due = Vec::new();
        for entry in &mut self.entries {
            if let PollPhase::Idle { next_due_ms } = entry.phase {
                if now_ms >= next_due_ms {
                    entry.phase = PollPhase::InFlight;
                    self.stats.polls_started += 1;
                    due.push(Arc::clone(&entry.def));
                }
            }
        }
        due
    }

    /// Records the outcome of an in-flight poll and schedules the next
    /// one a full interval after completion.
    pub fn complete(&mut self, name: &str, result: TransactionResult, now_ms: u64) {
        let Some(entry) = self.entries.iter_mut().find(|e| e.def.name == name) else {
            warn!(command = name, "completion for unknown poll entry");
            return;
        };
        let interval_ms = u64::from(entry.def.poll_interval_s) * 1000;
        entry.phase = PollPhase::Idle {
            next_due_ms: now_ms + interval_ms,
        };

        match result {
            Ok(values) => {
                self.stats.polls_succeeded += 1;
                debug!(command = name, "poll succeeded");
                self.cache.store_success(name, values, now_ms);
            }
            Err(err) => {
                self.stats.polls_failed += 1;
                warn!(command = name, error = %err, "poll failed, keeping stale value");
                self.cache.store_failure(name, err);
            }
        }
    }

    /// Earliest upcoming due time, for sizing the poll loop's sleep.
    /// `None` while everything is in flight or the schedule is empty.
    pub fn next_due_ms(&self) -> Option<u64> {
        self.entries
            .iter()
            .filter_map(|e| match e.phase {
                PollPhase::Idle { next_due_ms } => Some(next_due_ms),
                PollPhase::InFlight => None,
            })
            .min()
    }

    pub fn stats(&self) -> PollStats {
        self.stats
    }
}
