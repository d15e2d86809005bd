//! Scheduler queues
//!
//! - [`ReadyQueues`]: FIFO buckets keyed by priority, created lazily
//! - [`BlockedSet`]: suspended threads tagged with why they wait
//! - [`IoQueue`]: pending I/O requests, served one at a time
//! - [`Backlog`]: processes waiting for Memory to find room
//!
//! Queues hold [`ThreadKey`]s only; the TCBs stay in the process table.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::process::Pid;
use super::thread::{Priority, ThreadKey};

/// Ready threads, one FIFO per priority bucket
#[derive(Debug, Clone, Default)]
pub struct ReadyQueues {
    buckets: BTreeMap<Priority, VecDeque<ThreadKey>>,
}

impl ReadyQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the tail of `bucket`
    pub fn enqueue(&mut self, bucket: Priority, key: ThreadKey) {
        self.buckets.entry(bucket).or_default().push_back(key);
    }

    /// Pop the head of `bucket`
    pub fn dequeue(&mut self, bucket: Priority) -> Option<ThreadKey> {
        let queue = self.buckets.get_mut(&bucket)?;
        let key = queue.pop_front();
        if queue.is_empty() {
            self.buckets.remove(&bucket);
        }
        key
    }

    /// Head of the most urgent non-empty bucket
    pub fn peek_most_urgent(&self) -> Option<(Priority, ThreadKey)> {
        self.buckets
            .iter()
            .find_map(|(bucket, queue)| queue.front().map(|key| (*bucket, *key)))
    }

    /// Entries of one bucket in arrival order
    pub fn bucket(&self, bucket: Priority) -> impl Iterator<Item = &ThreadKey> {
        self.buckets.get(&bucket).into_iter().flatten()
    }

    /// Remove the entry at `index` of `bucket`
    pub fn remove_at(&mut self, bucket: Priority, index: usize) -> Option<ThreadKey> {
        let queue = self.buckets.get_mut(&bucket)?;
        let key = queue.remove(index);
        if queue.is_empty() {
            self.buckets.remove(&bucket);
        }
        key
    }

    /// Remove a thread wherever it is queued
    pub fn remove(&mut self, key: ThreadKey) -> bool {
        let before = self.len();
        self.retain(|k| *k != key);
        before != self.len()
    }

    /// Remove every thread of `pid`, returning them in bucket order
    pub fn remove_pid(&mut self, pid: Pid) -> Vec<ThreadKey> {
        let removed: Vec<ThreadKey> = self.iter().map(|(_, k)| k).filter(|k| k.pid == pid).collect();
        self.retain(|k| k.pid != pid);
        removed
    }

    fn retain(&mut self, mut keep: impl FnMut(&ThreadKey) -> bool) {
        for queue in self.buckets.values_mut() {
            queue.retain(|k| keep(k));
        }
        self.buckets.retain(|_, queue| !queue.is_empty());
    }

    pub fn contains(&self, key: ThreadKey) -> bool {
        self.buckets.values().any(|q| q.contains(&key))
    }

    /// All entries, most urgent bucket first, FIFO within a bucket
    pub fn iter(&self) -> impl Iterator<Item = (Priority, ThreadKey)> + '_ {
        self.buckets
            .iter()
            .flat_map(|(bucket, queue)| queue.iter().map(move |key| (*bucket, *key)))
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Why a thread is suspended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockReason {
    /// Waiting for another thread to exit
    Join,
    /// Waiting for a mutex
    Mutex,
    /// Waiting for an I/O request
    Io,
    /// Waiting for a memory dump
    Dump,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockReason::Join => "JOIN",
            BlockReason::Mutex => "MUTEX",
            BlockReason::Io => "IO",
            BlockReason::Dump => "DUMP",
        };
        f.write_str(name)
    }
}

/// One suspended thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedEntry {
    pub key: ThreadKey,
    pub reason: BlockReason,
    /// Awaited TID for JOIN, mutex name for MUTEX, empty otherwise
    pub target: String,
}

impl BlockedEntry {
    pub fn new(key: ThreadKey, reason: BlockReason, target: impl Into<String>) -> Self {
        Self {
            key,
            reason,
            target: target.into(),
        }
    }
}

/// Suspended threads in the order they blocked
#[derive(Debug, Clone, Default)]
pub struct BlockedSet {
    entries: VecDeque<BlockedEntry>,
}

impl BlockedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: BlockedEntry) {
        self.entries.push_back(entry);
    }

    /// Take the oldest entry blocked for `reason`
    pub fn take_by_reason(&mut self, reason: BlockReason) -> Option<BlockedEntry> {
        self.take_first(|e| e.reason == reason)
    }

    /// Take the oldest entry matching `pred`
    pub fn take_first(&mut self, pred: impl Fn(&BlockedEntry) -> bool) -> Option<BlockedEntry> {
        let index = self.entries.iter().position(pred)?;
        self.entries.remove(index)
    }

    /// Take every entry matching `pred`, oldest first
    pub fn take_all(&mut self, pred: impl Fn(&BlockedEntry) -> bool) -> Vec<BlockedEntry> {
        let (taken, kept): (VecDeque<_>, VecDeque<_>) =
            std::mem::take(&mut self.entries).into_iter().partition(|e| pred(e));
        self.entries = kept;
        taken.into()
    }

    /// Take the entry of `key` if it is blocked for `reason`
    pub fn take_key(&mut self, key: ThreadKey, reason: BlockReason) -> Option<BlockedEntry> {
        self.take_first(|e| e.key == key && e.reason == reason)
    }

    /// Drop the entry of `key` whatever it waits for
    pub fn remove_key(&mut self, key: ThreadKey) -> Option<BlockedEntry> {
        self.take_first(|e| e.key == key)
    }

    pub fn remove_pid(&mut self, pid: Pid) -> Vec<BlockedEntry> {
        self.take_all(|e| e.key.pid == pid)
    }

    pub fn contains(&self, key: ThreadKey) -> bool {
        self.entries.iter().any(|e| e.key == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockedEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Simulated I/O request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoRequest {
    pub key: ThreadKey,
    pub duration: Duration,
    pub enqueued_at: Instant,
}

impl IoRequest {
    pub fn new(key: ThreadKey, duration: Duration) -> Self {
        Self {
            key,
            duration,
            enqueued_at: Instant::now(),
        }
    }
}

/// FIFO of pending I/O requests
#[derive(Debug, Clone, Default)]
pub struct IoQueue {
    requests: VecDeque<IoRequest>,
}

impl IoQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request: IoRequest) {
        self.requests.push_back(request);
    }

    pub fn pop(&mut self) -> Option<IoRequest> {
        self.requests.pop_front()
    }

    /// Drop every request issued by `key`
    pub fn remove_key(&mut self, key: ThreadKey) {
        self.requests.retain(|r| r.key != key);
    }

    pub fn remove_pid(&mut self, pid: Pid) {
        self.requests.retain(|r| r.key.pid != pid);
    }

    pub fn iter(&self) -> impl Iterator<Item = &IoRequest> {
        self.requests.iter()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// Process waiting for a memory partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProcess {
    pub pid: Pid,
    pub path: String,
    pub size: u32,
    /// Priority of its main thread
    pub priority: Priority,
}

/// Processes admitted in creation order once Memory has room
#[derive(Debug, Clone, Default)]
pub struct Backlog {
    pending: VecDeque<NewProcess>,
}

impl Backlog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, process: NewProcess) {
        self.pending.push_back(process);
    }

    pub fn front(&self) -> Option<&NewProcess> {
        self.pending.front()
    }

    pub fn pop(&mut self) -> Option<NewProcess> {
        self.pending.pop_front()
    }

    pub fn remove_pid(&mut self, pid: Pid) {
        self.pending.retain(|p| p.pid != pid);
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.pending.iter().any(|p| p.pid == pid)
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.pending.iter().map(|p| p.pid).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(pid: Pid, tid: u32) -> ThreadKey {
        ThreadKey::new(pid, tid)
    }

    #[test]
    fn test_ready_fifo_within_bucket() {
        let mut ready = ReadyQueues::new();
        ready.enqueue(0, key(1, 0));
        ready.enqueue(0, key(2, 0));
        assert_eq!(ready.dequeue(0), Some(key(1, 0)));
        assert_eq!(ready.dequeue(0), Some(key(2, 0)));
        assert_eq!(ready.dequeue(0), None);
        assert!(ready.is_empty());
    }

    #[test]
    fn test_ready_most_urgent_bucket() {
        let mut ready = ReadyQueues::new();
        ready.enqueue(5, key(1, 0));
        ready.enqueue(2, key(2, 0));
        ready.enqueue(2, key(3, 0));
        assert_eq!(ready.peek_most_urgent(), Some((2, key(2, 0))));

        let order: Vec<_> = ready.iter().map(|(_, k)| k).collect();
        assert_eq!(order, vec![key(2, 0), key(3, 0), key(1, 0)]);
    }

    #[test]
    fn test_ready_remove_pid_across_buckets() {
        let mut ready = ReadyQueues::new();
        ready.enqueue(0, key(1, 0));
        ready.enqueue(0, key(2, 0));
        ready.enqueue(3, key(1, 1));
        ready.enqueue(3, key(1, 2));
        ready.enqueue(7, key(2, 1));

        let removed = ready.remove_pid(1);
        assert_eq!(removed, vec![key(1, 0), key(1, 1), key(1, 2)]);
        assert_eq!(ready.len(), 2);
        // Emptied buckets disappear
        assert_eq!(ready.peek_most_urgent(), Some((0, key(2, 0))));
        assert!(ready.bucket(3).next().is_none());
    }

    #[test]
    fn test_ready_remove_single() {
        let mut ready = ReadyQueues::new();
        ready.enqueue(0, key(1, 0));
        ready.enqueue(0, key(1, 1));
        assert!(ready.remove(key(1, 0)));
        assert!(!ready.remove(key(1, 0)));
        assert!(ready.contains(key(1, 1)));
    }

    #[test]
    fn test_blocked_take_oldest_match() {
        let mut blocked = BlockedSet::new();
        blocked.push(BlockedEntry::new(key(1, 1), BlockReason::Mutex, "A"));
        blocked.push(BlockedEntry::new(key(1, 2), BlockReason::Io, ""));
        blocked.push(BlockedEntry::new(key(1, 3), BlockReason::Mutex, "A"));

        let first = blocked.take_by_reason(BlockReason::Mutex).unwrap();
        assert_eq!(first.key, key(1, 1));
        let next = blocked
            .take_first(|e| e.reason == BlockReason::Mutex && e.target == "A")
            .unwrap();
        assert_eq!(next.key, key(1, 3));
        assert_eq!(blocked.len(), 1);
    }

    #[test]
    fn test_blocked_take_all_keeps_order() {
        let mut blocked = BlockedSet::new();
        blocked.push(BlockedEntry::new(key(1, 1), BlockReason::Join, "0"));
        blocked.push(BlockedEntry::new(key(2, 0), BlockReason::Io, ""));
        blocked.push(BlockedEntry::new(key(1, 2), BlockReason::Join, "0"));

        let joined = blocked.take_all(|e| e.reason == BlockReason::Join);
        assert_eq!(joined.len(), 2);
        assert_eq!(joined[0].key, key(1, 1));
        assert_eq!(joined[1].key, key(1, 2));
        assert_eq!(blocked.iter().next().map(|e| e.key), Some(key(2, 0)));
    }

    #[test]
    fn test_blocked_take_key_requires_reason() {
        let mut blocked = BlockedSet::new();
        blocked.push(BlockedEntry::new(key(1, 1), BlockReason::Dump, ""));
        assert!(blocked.take_key(key(1, 1), BlockReason::Io).is_none());
        assert!(blocked.take_key(key(1, 1), BlockReason::Dump).is_some());
    }

    #[test]
    fn test_block_reason_display() {
        assert_eq!(BlockReason::Io.to_string(), "IO");
        assert_eq!(BlockReason::Join.to_string(), "JOIN");
    }

    #[test]
    fn test_io_queue_remove_pid() {
        let mut io = IoQueue::new();
        io.push(IoRequest::new(key(1, 0), Duration::from_millis(10)));
        io.push(IoRequest::new(key(2, 0), Duration::from_millis(20)));
        io.remove_pid(1);
        assert_eq!(io.pop().map(|r| r.key), Some(key(2, 0)));
        assert!(io.is_empty());
    }

    #[test]
    fn test_backlog_order() {
        let mut backlog = Backlog::new();
        for pid in [3, 4] {
            backlog.push(NewProcess {
                pid,
                path: "prog".into(),
                size: 64,
                priority: 0,
            });
        }
        assert_eq!(backlog.pids(), vec![3, 4]);
        assert_eq!(backlog.front().map(|p| p.pid), Some(3));
        backlog.remove_pid(3);
        assert_eq!(backlog.pop().map(|p| p.pid), Some(4));
    }
}
