//! Time-triggered proactive nudges.
//!
//! A bounded schedule of `(user, task, fire_time)` entries, delivered in
//! fire-time order through the same cognitive pipeline as user input.
//! Delivery is best effort: late fires are coalesced per `(user, task)` so a
//! wake-up after a long sleep delivers one nudge, not a storm.

use async_trait::async_trait;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clock;
use crate::config::{NudgeConfig, ShutdownDrain};
use crate::error::{Error, Result};

/// Identifier of a scheduled fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NudgeId(u64);

/// Outcome of delivering one fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The nudge traversed the loop and went out.
    Delivered,
    /// Admission was denied; the scheduler applies its reschedule policy.
    RateLimited,
    /// The loop failed; the fire is dropped.
    Failed,
}

/// The scheduler's way into the cognitive loop.
#[async_trait]
pub trait NudgeDelivery: Send + Sync {
    /// Deliver one due fire.
    async fn deliver(&self, user_id: &str, task_id: &str) -> DeliveryOutcome;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingNudge {
    fire_at: Instant,
    seq: u64,
    user_id: String,
    task_id: String,
    rescheduled: bool,
}

impl Ord for PendingNudge {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fire_at
            .cmp(&other.fire_at)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for PendingNudge {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A pending fire drained at shutdown, for the embedder to serialize.
#[derive(Debug, Clone, Serialize)]
pub struct DrainedNudge {
    pub user_id: String,
    pub task_id: String,
    /// How far in the future the fire was, at drain time.
    pub due_in_secs: u64,
}

struct SchedulerState {
    heap: BinaryHeap<Reverse<PendingNudge>>,
    cancelled: HashSet<u64>,
    next_seq: u64,
}

impl SchedulerState {
    fn live_count(&self) -> usize {
        self.heap.len() - self.cancelled.len()
    }
}

/// Bounded priority schedule of proactive fires.
pub struct NudgeScheduler {
    config: NudgeConfig,
    state: Mutex<SchedulerState>,
    notify: Notify,
    shutdown: AtomicBool,
}

impl NudgeScheduler {
    /// Create an empty scheduler.
    pub fn new(config: NudgeConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SchedulerState {
                heap: BinaryHeap::new(),
                cancelled: HashSet::new(),
                next_seq: 0,
            }),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Schedule a fire at an absolute instant.
    pub fn schedule_at(
        &self,
        user_id: impl Into<String>,
        task_id: impl Into<String>,
        fire_at: Instant,
    ) -> Result<NudgeId> {
        self.schedule_entry(user_id.into(), task_id.into(), fire_at, false)
    }

    /// Schedule a fire after a delay.
    pub fn schedule_in(
        &self,
        user_id: impl Into<String>,
        task_id: impl Into<String>,
        delay: Duration,
    ) -> Result<NudgeId> {
        self.schedule_at(user_id, task_id, clock::now() + delay)
    }

    fn schedule_entry(
        &self,
        user_id: String,
        task_id: String,
        fire_at: Instant,
        rescheduled: bool,
    ) -> Result<NudgeId> {
        let mut state = self.lock();
        if state.live_count() >= self.config.max_pending {
            return Err(Error::ScheduleFull(format!(
                "{} fires pending",
                state.live_count()
            )));
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        debug!(user_id = %user_id, task_id = %task_id, seq, "nudge scheduled");
        state.heap.push(Reverse(PendingNudge {
            fire_at,
            seq,
            user_id,
            task_id,
            rescheduled,
        }));
        drop(state);

        self.notify.notify_one();
        Ok(NudgeId(seq))
    }

    /// Cancel a pending fire. Returns false for unknown or already
    /// delivered ids.
    pub fn cancel(&self, id: NudgeId) -> bool {
        let mut state = self.lock();
        let SchedulerState {
            heap, cancelled, ..
        } = &mut *state;
        let exists = heap
            .iter()
            .any(|Reverse(entry)| entry.seq == id.0 && !cancelled.contains(&entry.seq));
        if exists {
            cancelled.insert(id.0);
        }
        exists
    }

    /// Number of live pending fires.
    pub fn pending(&self) -> usize {
        self.lock().live_count()
    }

    /// Pop every due fire, dropping cancelled entries and coalescing
    /// duplicates per `(user, task)` down to the most recent fire time.
    /// Returned fires are in fire-time order.
    fn pop_due(&self, now: Instant) -> Vec<PendingNudge> {
        let mut state = self.lock();
        let mut latest: HashMap<(String, String), PendingNudge> = HashMap::new();

        loop {
            let due = state
                .heap
                .peek()
                .map(|Reverse(entry)| entry.fire_at <= now)
                .unwrap_or(false);
            if !due {
                break;
            }
            let Some(Reverse(entry)) = state.heap.pop() else {
                break;
            };
            if state.cancelled.remove(&entry.seq) {
                continue;
            }
            let key = (entry.user_id.clone(), entry.task_id.clone());
            match latest.get(&key) {
                Some(kept) if (kept.fire_at, kept.seq) >= (entry.fire_at, entry.seq) => {
                    debug!(user_id = %entry.user_id, task_id = %entry.task_id, "coalesced stale fire");
                }
                _ => {
                    latest.insert(key, entry);
                }
            }
        }

        let mut due: Vec<PendingNudge> = latest.into_values().collect();
        due.sort();
        due
    }

    fn next_fire_at(&self) -> Option<Instant> {
        let state = self.lock();
        state
            .heap
            .iter()
            .filter(|Reverse(entry)| !state.cancelled.contains(&entry.seq))
            .map(|Reverse(entry)| entry.fire_at)
            .min()
    }

    /// Drive the schedule until shutdown. Intended to run on its own task.
    pub async fn run(&self, delivery: &dyn NudgeDelivery) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }

            match self.next_fire_at() {
                None => self.notify.notified().await,
                Some(at) if at > clock::now() => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {}
                        _ = self.notify.notified() => continue,
                    }
                }
                Some(_) => {}
            }

            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }

            for fire in self.pop_due(clock::now()) {
                match delivery.deliver(&fire.user_id, &fire.task_id).await {
                    DeliveryOutcome::Delivered => {
                        info!(user_id = %fire.user_id, task_id = %fire.task_id, "nudge delivered");
                    }
                    DeliveryOutcome::RateLimited => {
                        if fire.rescheduled {
                            warn!(
                                user_id = %fire.user_id,
                                task_id = %fire.task_id,
                                "nudge dropped after second rate-limit denial"
                            );
                        } else {
                            let delay = Duration::from_secs(self.config.reschedule_delay_secs);
                            let _ = self.schedule_entry(
                                fire.user_id,
                                fire.task_id,
                                clock::now() + delay,
                                true,
                            );
                        }
                    }
                    DeliveryOutcome::Failed => {
                        warn!(user_id = %fire.user_id, task_id = %fire.task_id, "nudge delivery failed");
                    }
                }
            }
        }
    }

    /// Stop the driver and drain pending fires per the configured policy.
    pub fn shutdown(&self) -> Vec<DrainedNudge> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        self.notify.notify_one();

        let mut state = self.lock();
        let now = clock::now();
        let drained: Vec<DrainedNudge> = match self.config.shutdown_drain {
            ShutdownDrain::Drop => Vec::new(),
            ShutdownDrain::Serialize => state
                .heap
                .iter()
                .filter(|Reverse(entry)| !state.cancelled.contains(&entry.seq))
                .map(|Reverse(entry)| DrainedNudge {
                    user_id: entry.user_id.clone(),
                    task_id: entry.task_id.clone(),
                    due_in_secs: entry.fire_at.saturating_duration_since(now).as_secs(),
                })
                .collect(),
        };
        state.heap.clear();
        state.cancelled.clear();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    struct RecordingDelivery {
        delivered: Mutex<Vec<(String, String)>>,
        outcome: Mutex<Vec<DeliveryOutcome>>,
    }

    impl RecordingDelivery {
        fn new() -> Self {
            Self {
                delivered: Mutex::new(Vec::new()),
                outcome: Mutex::new(Vec::new()),
            }
        }

        fn scripted(outcomes: Vec<DeliveryOutcome>) -> Self {
            Self {
                delivered: Mutex::new(Vec::new()),
                outcome: Mutex::new(outcomes),
            }
        }

        fn deliveries(&self) -> Vec<(String, String)> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NudgeDelivery for RecordingDelivery {
        async fn deliver(&self, user_id: &str, task_id: &str) -> DeliveryOutcome {
            self.delivered
                .lock()
                .unwrap()
                .push((user_id.to_string(), task_id.to_string()));
            let mut outcomes = self.outcome.lock().unwrap();
            if outcomes.is_empty() {
                DeliveryOutcome::Delivered
            } else {
                outcomes.remove(0)
            }
        }
    }

    fn scheduler() -> Arc<NudgeScheduler> {
        Arc::new(NudgeScheduler::new(NudgeConfig::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_deliver_in_fire_time_order() {
        let scheduler = scheduler();
        let delivery = Arc::new(RecordingDelivery::new());

        scheduler
            .schedule_in("u1", "late", Duration::from_secs(30))
            .unwrap();
        scheduler
            .schedule_in("u1", "early", Duration::from_secs(10))
            .unwrap();

        let driver = {
            let scheduler = scheduler.clone();
            let delivery = delivery.clone();
            tokio::spawn(async move { scheduler.run(delivery.as_ref()).await })
        };

        tokio::time::sleep(Duration::from_secs(31)).await;
        scheduler.shutdown();
        driver.await.unwrap();

        assert_eq!(
            delivery.deliveries(),
            vec![
                ("u1".to_string(), "early".to_string()),
                ("u1".to_string(), "late".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_due_duplicates_coalesce_to_most_recent() {
        let scheduler = scheduler();

        // Three fires for the same (user, task), all due by wake-up time
        scheduler
            .schedule_in("u1", "report", Duration::from_secs(1))
            .unwrap();
        scheduler
            .schedule_in("u1", "report", Duration::from_secs(2))
            .unwrap();
        scheduler
            .schedule_in("u1", "report", Duration::from_secs(3))
            .unwrap();
        // A different task survives on its own
        scheduler
            .schedule_in("u1", "other", Duration::from_secs(2))
            .unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        let due = scheduler.pop_due(clock::now());
        let keys: Vec<(&str, &str)> = due
            .iter()
            .map(|fire| (fire.user_id.as_str(), fire.task_id.as_str()))
            .collect();
        assert_eq!(keys, vec![("u1", "other"), ("u1", "report")]);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_delivery() {
        let scheduler = scheduler();
        let id = scheduler
            .schedule_in("u1", "report", Duration::from_secs(5))
            .unwrap();
        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));
        assert_eq!(scheduler.pending(), 0);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(scheduler.pop_due(clock::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_fire_reschedules_once_then_drops() {
        let scheduler = scheduler();
        let delivery = Arc::new(RecordingDelivery::scripted(vec![
            DeliveryOutcome::RateLimited,
            DeliveryOutcome::RateLimited,
        ]));

        scheduler
            .schedule_in("u1", "report", Duration::from_secs(1))
            .unwrap();

        let driver = {
            let scheduler = scheduler.clone();
            let delivery = delivery.clone();
            tokio::spawn(async move { scheduler.run(delivery.as_ref()).await })
        };

        // First denial reschedules to +300 s, second denial drops
        tokio::time::sleep(Duration::from_secs(302)).await;
        tokio::time::sleep(Duration::from_secs(400)).await;
        scheduler.shutdown();
        driver.await.unwrap();

        assert_eq!(delivery.deliveries().len(), 2);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_bound_is_enforced() {
        let scheduler = NudgeScheduler::new(NudgeConfig {
            max_pending: 2,
            ..NudgeConfig::default()
        });
        let first = scheduler
            .schedule_in("u1", "a", Duration::from_secs(5))
            .unwrap();
        scheduler.schedule_in("u1", "b", Duration::from_secs(5)).unwrap();
        assert!(matches!(
            scheduler.schedule_in("u1", "c", Duration::from_secs(5)),
            Err(Error::ScheduleFull(_))
        ));

        // Cancelling frees a slot
        assert!(scheduler.cancel(first));
        scheduler.schedule_in("u1", "c", Duration::from_secs(5)).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_serializes_pending_fires() {
        let scheduler = scheduler();
        scheduler
            .schedule_in("u1", "report", Duration::from_secs(120))
            .unwrap();
        scheduler
            .schedule_in("u2", "email", Duration::from_secs(60))
            .unwrap();

        let drained = scheduler.shutdown();
        assert_eq!(drained.len(), 2);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drop_policy_discards() {
        let scheduler = NudgeScheduler::new(NudgeConfig {
            shutdown_drain: ShutdownDrain::Drop,
            ..NudgeConfig::default()
        });
        scheduler
            .schedule_in("u1", "report", Duration::from_secs(120))
            .unwrap();
        assert!(scheduler.shutdown().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_earlier_fire_wakes_the_driver() {
        let scheduler = scheduler();
        let delivery = Arc::new(RecordingDelivery::new());

        scheduler
            .schedule_in("u1", "late", Duration::from_secs(600))
            .unwrap();

        let driver = {
            let scheduler = scheduler.clone();
            let delivery = delivery.clone();
            tokio::spawn(async move { scheduler.run(delivery.as_ref()).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        scheduler
            .schedule_in("u1", "early", Duration::from_secs(5))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(
            delivery.deliveries(),
            vec![("u1".to_string(), "early".to_string())]
        );

        scheduler.shutdown();
        driver.await.unwrap();
    }
}
