//! Reconcile queue
//!
//! Deduplicating, rate-limited work queue keyed by resource identity.
//!
//! - A key is either absent, queued, or in flight; never two of these.
//! - Enqueuing a queued key only updates its event kind. Enqueuing an
//!   in-flight key records that a re-check is owed once it completes.
//! - Failures re-queue the key after an exponential backoff; after
//!   `max_attempts` consecutive failures the key is dropped and handed to the
//!   `ErrorReporter`. Success clears the key's failure history.
//! - After `shutdown`, new keys and pending retries are discarded, queued
//!   keys are still handed out, then `dequeue` returns `None`.

use crate::apis::metrics::{record_queue_drop, record_queue_retry, set_queue_depth};
use crate::config::RetryConfig;
use common::{EventKind, ResourceKey};
use rand::Rng;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, warn};

#[inline]
fn safe_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("Mutex poisoned in reconcile queue, recovering (data is still valid)");
        poisoned.into_inner()
    })
}

/// A unit of work handed to a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub key: ResourceKey,
    /// 1 for the first attempt, incremented by every consecutive failure
    pub attempt: u32,
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    Drop,
}

/// Pure backoff/drop policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_secs(config.max_delay_secs),
            max_attempts: config.max_attempts.max(1),
            jitter: config.jitter,
        }
    }
}

impl RetryPolicy {
    /// Decide after the `failures`-th consecutive failure (1-based)
    pub fn decide(&self, failures: u32) -> RetryDecision {
        if failures >= self.max_attempts {
            return RetryDecision::Drop;
        }
        RetryDecision::Retry(self.backoff(failures))
    }

    /// `base * 2^(failures-1)`, capped at `max_delay`
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let millis = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        let mut delay = Duration::from_millis(millis).min(self.max_delay);
        if self.jitter {
            let scale = rand::thread_rng().gen_range(0.5..1.5);
            delay = delay.mul_f64(scale).min(self.max_delay);
        }
        delay
    }
}

/// Receives keys dropped after exhausting their retries
pub trait ErrorReporter: Send + Sync {
    fn report(&self, key: &ResourceKey, attempts: u32, error: &str);
}

/// Default reporter: an error log line plus the drop counter
#[derive(Debug, Default)]
pub struct LogErrorReporter;

impl ErrorReporter for LogErrorReporter {
    fn report(&self, key: &ResourceKey, attempts: u32, error: &str) {
        error!(
            key = %key,
            attempts,
            error = %error,
            "Dropping key from reconcile queue after repeated failures"
        );
    }
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<ResourceKey>,
    /// Queued keys and the latest event kind observed for them
    queued: HashMap<ResourceKey, EventKind>,
    processing: HashSet<ResourceKey>,
    /// In-flight keys that were notified again while processing
    dirty: HashMap<ResourceKey, EventKind>,
    failures: HashMap<ResourceKey, u32>,
    delayed: BinaryHeap<Reverse<(Instant, u64, ResourceKey)>>,
    /// Live retry per key; heap entries with another sequence are stale
    delayed_seq: HashMap<ResourceKey, u64>,
    next_seq: u64,
    shutting_down: bool,
}

impl QueueState {
    fn push_ready(&mut self, kind: EventKind, key: ResourceKey) -> bool {
        if self.processing.contains(&key) {
            self.dirty.insert(key, kind);
            return false;
        }
        if let Some(existing) = self.queued.get_mut(&key) {
            *existing = kind;
            return false;
        }
        self.queued.insert(key.clone(), kind);
        self.ready.push_back(key);
        true
    }

    fn schedule_retry(&mut self, key: ResourceKey, at: Instant) {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.delayed_seq.insert(key.clone(), seq);
        self.delayed.push(Reverse((at, seq, key)));
    }

    /// Move retries whose time has come onto the ready list
    fn promote_due(&mut self, now: Instant) {
        while let Some(Reverse((at, _, _))) = self.delayed.peek() {
            if *at > now {
                break;
            }
            if let Some(Reverse((_, seq, key))) = self.delayed.pop() {
                if self.delayed_seq.get(&key) == Some(&seq) {
                    self.delayed_seq.remove(&key);
                    self.push_ready(EventKind::Update, key);
                }
            }
        }
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        // Discard stale heads so the deadline reflects a live retry
        while let Some(Reverse((at, seq, key))) = self.delayed.peek() {
            if self.delayed_seq.get(key) == Some(seq) {
                return Some(*at);
            }
            self.delayed.pop();
        }
        None
    }
}

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
    policy: RetryPolicy,
    reporter: Arc<dyn ErrorReporter>,
}

enum Outcome {
    Success,
    Failure(String),
}

/// Deduplicating, rate-limited reconcile queue (cheap to clone)
#[derive(Clone)]
pub struct ReconcileQueue {
    shared: Arc<Shared>,
}

impl fmt::Debug for ReconcileQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = safe_lock(&self.shared.state);
        f.debug_struct("ReconcileQueue")
            .field("ready", &state.ready.len())
            .field("processing", &state.processing.len())
            .field("delayed", &state.delayed_seq.len())
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}

impl ReconcileQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_reporter(policy, Arc::new(LogErrorReporter))
    }

    pub fn with_reporter(policy: RetryPolicy, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                policy,
                reporter,
            }),
        }
    }

    /// Add or coalesce a pending item for `key`
    pub fn enqueue(&self, kind: EventKind, key: ResourceKey) {
        let added = {
            let mut state = safe_lock(&self.shared.state);
            if state.shutting_down {
                debug!(key = %key, "Queue shutting down, ignoring event");
                return;
            }
            let added = state.push_ready(kind, key.clone());
            set_queue_depth(state.ready.len());
            added
        };
        if added {
            debug!(key = %key, kind = %kind, "Enqueued key");
            self.shared.notify.notify_waiters();
        } else {
            debug!(key = %key, kind = %kind, "Coalesced event into pending item");
        }
    }

    /// Wait for the next key, or `None` once shut down and drained
    pub async fn dequeue(&self) -> Option<WorkItem> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so no wakeup is lost
            notified.as_mut().enable();

            let deadline = {
                let mut state = safe_lock(&self.shared.state);
                state.promote_due(Instant::now());

                if let Some(key) = state.ready.pop_front() {
                    let kind = state.queued.remove(&key).unwrap_or(EventKind::Update);
                    // A fresh run supersedes any scheduled retry
                    state.delayed_seq.remove(&key);
                    state.processing.insert(key.clone());
                    let attempt = state.failures.get(&key).copied().unwrap_or(0) + 1;
                    set_queue_depth(state.ready.len());
                    return Some(WorkItem {
                        event: Event { kind, key, attempt },
                        shared: Some(self.shared.clone()),
                    });
                }

                if state.shutting_down {
                    return None;
                }
                state.next_deadline()
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Stop accepting work; blocked `dequeue` calls return once drained
    pub fn shutdown(&self) {
        {
            let mut state = safe_lock(&self.shared.state);
            state.shutting_down = true;
            state.delayed.clear();
            state.delayed_seq.clear();
            state.dirty.clear();
        }
        debug!("Reconcile queue shutting down");
        self.shared.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        safe_lock(&self.shared.state).shutting_down
    }

    /// Keys waiting for a worker
    pub fn len(&self) -> usize {
        safe_lock(&self.shared.state).ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        safe_lock(&self.shared.state).processing.len()
    }

    /// Keys waiting out a backoff delay
    pub fn delayed(&self) -> usize {
        safe_lock(&self.shared.state).delayed_seq.len()
    }

    /// Consecutive failures recorded for `key`
    pub fn failures(&self, key: &ResourceKey) -> u32 {
        safe_lock(&self.shared.state)
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

impl Shared {
    fn finish(&self, key: &ResourceKey, outcome: Outcome) {
        let mut dropped = None;
        {
            let mut state = safe_lock(&self.state);
            state.processing.remove(key);

            match outcome {
                Outcome::Success => {
                    state.failures.remove(key);
                }
                Outcome::Failure(error) => {
                    let failures = {
                        let count = state.failures.entry(key.clone()).or_insert(0);
                        *count += 1;
                        *count
                    };
                    match self.policy.decide(failures) {
                        RetryDecision::Retry(delay) if !state.shutting_down => {
                            warn!(
                                key = %key,
                                attempt = failures,
                                retry_in_ms = delay.as_millis() as u64,
                                error = %error,
                                "Reconciliation failed, retrying"
                            );
                            record_queue_retry();
                            state.schedule_retry(key.clone(), Instant::now() + delay);
                        }
                        RetryDecision::Retry(_) => {
                            debug!(key = %key, "Reconciliation failed during shutdown, not retrying");
                        }
                        RetryDecision::Drop => {
                            state.failures.remove(key);
                            state.delayed_seq.remove(key);
                            dropped = Some((failures, error));
                        }
                    }
                }
            }

            if let Some(kind) = state.dirty.remove(key) {
                if !state.shutting_down {
                    state.push_ready(kind, key.clone());
                }
            }
            set_queue_depth(state.ready.len());
        }

        if let Some((attempts, error)) = dropped {
            record_queue_drop();
            self.reporter.report(key, attempts, &error);
        }
        self.notify.notify_waiters();
    }
}

/// Handle for one dequeued key; report the outcome with `complete`
///
/// Dropping a handle without completing it counts as a failure so the key is
/// never stuck in flight.
pub struct WorkItem {
    pub event: Event,
    shared: Option<Arc<Shared>>,
}

impl WorkItem {
    pub fn key(&self) -> &ResourceKey {
        &self.event.key
    }

    pub fn complete<E: fmt::Display>(mut self, result: Result<(), E>) {
        if let Some(shared) = self.shared.take() {
            let outcome = match result {
                Ok(()) => Outcome::Success,
                Err(e) => Outcome::Failure(e.to_string()),
            };
            shared.finish(&self.event.key, outcome);
        }
    }
}

impl Drop for WorkItem {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.finish(
                &self.event.key,
                Outcome::Failure("work item dropped before completion".to_string()),
            );
        }
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem").field("event", &self.event).finish()
    }
}
