//! Per-process mutex table
//!
//! Mutexes are named, owned by a process and held by at most one of that
//! process's threads. Waiters are not stored here: a thread waiting for a
//! mutex sits in the blocked set tagged with the mutex name, and the oldest
//! such entry inherits the mutex on release.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::thread::Tid;

/// Holder of a mutex
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutexHolder {
    /// Nobody holds it
    Free,
    /// Held by a thread of the owning process
    Held(Tid),
}

/// Named mutexes of one process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutexTable {
    entries: BTreeMap<String, MutexHolder>,
}

impl MutexTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a free mutex; false if the name is taken
    pub fn create(&mut self, name: &str) -> bool {
        if self.entries.contains_key(name) {
            return false;
        }
        self.entries.insert(name.to_string(), MutexHolder::Free);
        true
    }

    /// Current holder, `None` if the mutex does not exist
    pub fn holder(&self, name: &str) -> Option<MutexHolder> {
        self.entries.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Hand the mutex to `tid`
    pub fn assign(&mut self, name: &str, tid: Tid) {
        if let Some(holder) = self.entries.get_mut(name) {
            *holder = MutexHolder::Held(tid);
        }
    }

    /// Mark the mutex free
    pub fn release(&mut self, name: &str) {
        if let Some(holder) = self.entries.get_mut(name) {
            *holder = MutexHolder::Free;
        }
    }

    /// Names of every mutex currently held by `tid`
    pub fn held_by(&self, tid: Tid) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, holder)| **holder == MutexHolder::Held(tid))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MutexHolder)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
