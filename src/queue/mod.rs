//! Priority queue manager.
//!
//! Single-owner state: the daemon's event loop is the only caller, so no
//! internal locking is needed — queue state is owned exclusively by the
//! daemon loop. Events are broadcast out rather than handed back through a
//! callback, avoiding a cyclic reference back to the server: the queue
//! emits, the server observes, the queue never holds a pointer back to it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Bounded ring of recent wait-time samples.
const WAIT_TIME_RING_CAPACITY: usize = 100;

/// Default per-item timeout if the caller doesn't specify one.
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Event broadcast channel capacity. Generous relative to expected burst
/// size — a slow consumer sees a `Lagged` error on `recv`, never blocks the
/// queue itself.
const EVENT_CHANNEL_CAPACITY: usize = 512;

// ---------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------

/// Named priority bands. Higher numeric value is serviced first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Ambient = 10,
    Low = 20,
    Normal = 50,
    High = 80,
    Critical = 100,
}

impl Priority {
    pub fn value(self) -> i32 {
        self as i32
    }
}

/// Accepts either a named band or a raw integer on the wire, since the
/// protocol carries priority as a bare number in `EnqueueRequest`.
pub fn priority_from_i32(v: i32) -> i32 {
    v
}

// ---------------------------------------------------------------------
// Interruption policy
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptionPolicy {
    /// Count the preempted item as dropped; never requeue it.
    Drop,
    /// Prepend the preempted item to the front of the queue unconditionally.
    RequeueFront,
    /// Re-insert the preempted item using the normal priority-ordering rule.
    RequeuePriority,
}

// ---------------------------------------------------------------------
// Queue items
// ---------------------------------------------------------------------

/// A request to enqueue an utterance (wire shape: `EnqueueRequest`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub text: String,
    pub priority: i32,
    #[serde(default)]
    pub voice_config: serde_json::Value,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// An immutable queue item. Once constructed, only its play/terminal
/// bookkeeping (tracked separately by the queue, not on the item) changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub text: String,
    pub priority: i32,
    #[serde(default)]
    pub voice_config: serde_json::Value,
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
    pub timeout_ms: u64,

    /// Enqueue timestamp, monotonic. Not serialized on the wire (internal
    /// ordering/TTL bookkeeping only) — wire consumers see the rest.
    #[serde(skip)]
    enqueue_ts: Option<Instant>,
}

impl QueueItem {
    fn age(&self) -> Duration {
        self.enqueue_ts
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO)
    }
}

// ---------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    Enqueued { item: QueueItem, position: usize },
    Interrupted { current_id: String, new_item: QueueItem },
    Dropped { id: String, reason: DropReason },
    Playing { item: QueueItem },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    Expired,
    Overflow,
    Interrupted,
}

// ---------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_length: usize,
    pub current_item_id: Option<String>,
    pub band_counts: Vec<(i32, usize)>,
    pub total_processed: u64,
    pub total_dropped: u64,
    pub mean_wait_ms: f64,
    pub is_playing: bool,
}

// ---------------------------------------------------------------------
// PriorityQueue
// ---------------------------------------------------------------------

pub struct PriorityQueue {
    items: Vec<QueueItem>,
    current: Option<QueueItem>,
    is_playing: bool,
    last_speaker: Option<String>,
    total_processed: u64,
    total_dropped: u64,
    wait_times: VecDeque<u64>,
    max_queue_size: usize,
    interrupt_threshold: i32,
    interruption_policy: InterruptionPolicy,
    events_tx: broadcast::Sender<QueueEvent>,
}

impl PriorityQueue {
    pub fn new(
        max_queue_size: usize,
        interrupt_threshold: i32,
        interruption_policy: InterruptionPolicy,
    ) -> (Self, broadcast::Receiver<QueueEvent>) {
        let (events_tx, events_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        (
            Self {
                items: Vec::new(),
                current: None,
                is_playing: false,
                last_speaker: None,
                total_processed: 0,
                total_dropped: 0,
                wait_times: VecDeque::with_capacity(WAIT_TIME_RING_CAPACITY),
                max_queue_size,
                interrupt_threshold,
                interruption_policy,
                events_tx,
            },
            events_rx,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events_tx.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is not an error — events are best-effort broadcast.
        let _ = self.events_tx.send(event);
    }

    pub fn enqueue(&mut self, request: EnqueueRequest) -> (String, usize) {
        let id = Uuid::new_v4().to_string();
        let item = QueueItem {
            id: id.clone(),
            text: request.text,
            priority: request.priority,
            voice_config: request.voice_config,
            session_id: request.session_id,
            agent_id: request.agent_id,
            timeout_ms: request.timeout.unwrap_or(DEFAULT_TIMEOUT_MS),
            enqueue_ts: Some(Instant::now()),
        };

        if self.items.len() >= self.max_queue_size {
            self.apply_overflow();
        }

        // Insert before the first strictly-lower-priority item, preserving
        // FIFO within a band.
        let insert_at = self
            .items
            .iter()
            .position(|existing| existing.priority < item.priority)
            .unwrap_or(self.items.len());
        self.items.insert(insert_at, item.clone());

        self.emit(QueueEvent::Enqueued {
            item: item.clone(),
            position: insert_at,
        });

        if let Some(current) = &self.current {
            if self.is_playing
                && item.priority >= self.interrupt_threshold
                && item.priority > current.priority
            {
                self.emit(QueueEvent::Interrupted {
                    current_id: current.id.clone(),
                    new_item: item.clone(),
                });
            }
        }

        (id, insert_at)
    }

    /// Overflow policy: drop the lowest-priority, latest-enqueued item.
    fn apply_overflow(&mut self) {
        if self.items.is_empty() {
            return;
        }
        let min_priority = self.items.iter().map(|i| i.priority).min().unwrap();
        // Latest-enqueued among the minimum-priority items: the last one in
        // the vec with that priority, since insertion preserves FIFO order
        // and later enqueues of the same priority sit after earlier ones.
        let victim_idx = self
            .items
            .iter()
            .enumerate()
            .filter(|(_, i)| i.priority == min_priority)
            .last()
            .map(|(idx, _)| idx)
            .unwrap();
        let victim = self.items.remove(victim_idx);
        self.total_dropped += 1;
        self.emit(QueueEvent::Dropped {
            id: victim.id,
            reason: DropReason::Overflow,
        });
    }

    /// TTL sweep, then pop head.
    pub fn get_next(&mut self) -> Option<QueueItem> {
        self.sweep_expired();

        if self.items.is_empty() {
            return None;
        }

        let item = self.items.remove(0);
        self.current = Some(item.clone());
        self.is_playing = true;

        let wait_ms = item.age().as_millis() as u64;
        if self.wait_times.len() >= WAIT_TIME_RING_CAPACITY {
            self.wait_times.pop_front();
        }
        self.wait_times.push_back(wait_ms);

        self.emit(QueueEvent::Playing { item: item.clone() });
        Some(item)
    }

    fn sweep_expired(&mut self) {
        let mut i = 0;
        while i < self.items.len() {
            let expired = self.items[i].age() > Duration::from_millis(self.items[i].timeout_ms);
            if expired {
                let dropped = self.items.remove(i);
                self.total_dropped += 1;
                self.emit(QueueEvent::Dropped {
                    id: dropped.id,
                    reason: DropReason::Expired,
                });
            } else {
                i += 1;
            }
        }
    }

    /// Idempotent on an unknown id.
    pub fn cancel(&mut self, id: &str) -> bool {
        if let Some(pos) = self.items.iter().position(|i| i.id == id) {
            self.items.remove(pos);
            true
        } else {
            false
        }
    }

    /// `lastSpeaker` updates here.
    pub fn mark_completed(&mut self, id: &str, _duration_ms: u64) {
        if self.current.as_ref().map(|c| c.id.as_str()) == Some(id) {
            let item = self.current.take().unwrap();
            self.last_speaker = item.agent_id;
            self.is_playing = false;
            self.total_processed += 1;
        }
    }

    pub fn mark_failed(&mut self, id: &str, _error: &str) {
        if self.current.as_ref().map(|c| c.id.as_str()) == Some(id) {
            self.current = None;
            self.is_playing = false;
        }
    }

    /// Re-queue the just-popped item per the configured interruption policy,
    /// or use as the "reinsert the last-popped item" fallback when
    /// `process_queue` finds no idle connection.
    pub fn handle_interruption(&mut self, id: &str) {
        let Some(current) = &self.current else {
            return;
        };
        if current.id != id {
            return;
        }
        let item = self.current.take().unwrap();
        self.is_playing = false;

        match self.interruption_policy {
            InterruptionPolicy::Drop => {
                self.total_dropped += 1;
                self.emit(QueueEvent::Dropped {
                    id: item.id,
                    reason: DropReason::Interrupted,
                });
            }
            InterruptionPolicy::RequeueFront => {
                self.items.insert(0, item);
            }
            InterruptionPolicy::RequeuePriority => {
                let insert_at = self
                    .items
                    .iter()
                    .position(|existing| existing.priority < item.priority)
                    .unwrap_or(self.items.len());
                self.items.insert(insert_at, item);
            }
        }
    }

    pub fn needs_speaker_transition(&self, item: &QueueItem) -> bool {
        match (&self.last_speaker, &item.agent_id) {
            (Some(last), Some(next)) => last != next,
            _ => false,
        }
    }

    pub fn get_stats(&self) -> QueueStats {
        let mut band_counts: Vec<(i32, usize)> = Vec::new();
        for item in &self.items {
            if let Some(entry) = band_counts.iter_mut().find(|(p, _)| *p == item.priority) {
                entry.1 += 1;
            } else {
                band_counts.push((item.priority, 1));
            }
        }
        let mean_wait_ms = if self.wait_times.is_empty() {
            0.0
        } else {
            self.wait_times.iter().sum::<u64>() as f64 / self.wait_times.len() as f64
        };
        QueueStats {
            queue_length: self.items.len(),
            current_item_id: self.current.as_ref().map(|i| i.id.clone()),
            band_counts,
            total_processed: self.total_processed,
            total_dropped: self.total_dropped,
            mean_wait_ms,
            is_playing: self.is_playing,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    pub fn current(&self) -> Option<&QueueItem> {
        self.current.as_ref()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.current = None;
        self.is_playing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(text: &str, priority: i32) -> EnqueueRequest {
        EnqueueRequest {
            text: text.to_string(),
            priority,
            voice_config: serde_json::Value::Null,
            session_id: None,
            agent_id: None,
            timeout: None,
        }
    }

    /// Ordering — priority descending, FIFO within a band.
    #[test]
    fn ordering_by_priority_then_fifo() {
        let (mut q, _rx) = PriorityQueue::new(100, 80, InterruptionPolicy::RequeueFront);
        q.enqueue(req("a", 50));
        q.enqueue(req("b", 80));
        q.enqueue(req("c", 50));
        q.enqueue(req("d", 100));

        let order: Vec<String> = std::iter::from_fn(|| q.get_next().map(|i| i.text))
            .collect();
        assert_eq!(order, vec!["d", "b", "a", "c"]);
    }

    /// Overflow — K+M enqueues with ascending priority drop exactly M,
    /// surviving items are the top-K by priority.
    #[test]
    fn overflow_drops_lowest_priority() {
        let (mut q, _rx) = PriorityQueue::new(3, 80, InterruptionPolicy::RequeueFront);
        for p in [10, 20, 30, 40, 50] {
            q.enqueue(req("x", p));
        }
        let stats = q.get_stats();
        assert_eq!(stats.queue_length, 3);
        assert_eq!(stats.total_dropped, 2);
        let remaining: Vec<i32> = std::iter::from_fn(|| q.get_next().map(|i| i.priority)).collect();
        assert_eq!(remaining, vec![50, 40, 30]);
    }

    /// Overflow drops the new lowest-priority item first, then displaces an
    /// existing one once all bands are full.
    #[test]
    fn scenario_overflow_exact() {
        let (mut q, _rx) = PriorityQueue::new(3, 80, InterruptionPolicy::RequeueFront);
        for p in [50, 50, 50, 10] {
            q.enqueue(req("x", p));
        }
        let stats = q.get_stats();
        assert_eq!(stats.total_dropped, 1);
        assert_eq!(stats.queue_length, 3);

        q.enqueue(req("urgent", 100));
        let stats = q.get_stats();
        assert_eq!(stats.total_dropped, 2);
        assert_eq!(stats.queue_length, 3);
        let remaining: Vec<i32> = std::iter::from_fn(|| q.get_next().map(|i| i.priority)).collect();
        assert_eq!(remaining, vec![100, 50, 50]);
    }

    /// TTL — an item with a short timeout never plays, and is dropped with
    /// reason `expired` exactly once.
    #[test]
    fn ttl_expiry_drops_before_playing() {
        let (mut q, mut rx) = PriorityQueue::new(10, 80, InterruptionPolicy::RequeueFront);
        let mut item = req("bg", 20);
        item.timeout = Some(1);
        q.enqueue(item);
        std::thread::sleep(Duration::from_millis(20));

        assert!(q.get_next().is_none());
        let mut saw_expired = 0;
        while let Ok(event) = rx.try_recv() {
            if let QueueEvent::Dropped {
                reason: DropReason::Expired,
                ..
            } = event
            {
                saw_expired += 1;
            }
        }
        assert_eq!(saw_expired, 1);
    }

    /// Preemption — interrupted emitted iff p >= threshold && p > current.
    #[test]
    fn preemption_requires_threshold_and_higher_priority() {
        let (mut q, mut rx) = PriorityQueue::new(10, 80, InterruptionPolicy::RequeueFront);
        q.enqueue(req("bg", 20));
        q.get_next(); // now playing priority 20

        q.enqueue(req("not urgent enough", 79));
        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(!events
            .iter()
            .any(|e| matches!(e, QueueEvent::Interrupted { .. })));

        q.enqueue(req("urgent", 100));
        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, QueueEvent::Interrupted { .. })));
    }

    /// Idempotence on unknown ids.
    #[test]
    fn idempotent_on_unknown_id() {
        let (mut q, _rx) = PriorityQueue::new(10, 80, InterruptionPolicy::RequeueFront);
        assert!(!q.cancel("does-not-exist"));
        q.mark_completed("does-not-exist", 10); // no panic, no state change
        q.mark_failed("does-not-exist", "boom");
        q.handle_interruption("does-not-exist");
        assert_eq!(q.get_stats().total_processed, 0);
    }

    #[test]
    fn speaker_transition_tracks_last_speaker() {
        let (mut q, _rx) = PriorityQueue::new(10, 80, InterruptionPolicy::RequeueFront);
        let mut a = req("from a", 50);
        a.agent_id = Some("A".into());
        let mut b = req("from b", 50);
        b.agent_id = Some("B".into());
        q.enqueue(a);
        q.enqueue(b);

        let first = q.get_next().unwrap();
        assert!(!q.needs_speaker_transition(&first)); // no prior speaker yet
        q.mark_completed(&first.id, 100);

        let second = q.get_next().unwrap();
        assert!(q.needs_speaker_transition(&second));
    }

    #[test]
    fn handle_interruption_requeue_front_reinstates_item() {
        let (mut q, _rx) = PriorityQueue::new(10, 80, InterruptionPolicy::RequeueFront);
        q.enqueue(req("bg", 20));
        let item = q.get_next().unwrap();
        q.handle_interruption(&item.id);
        assert_eq!(q.get_stats().queue_length, 1);
        let replayed = q.get_next().unwrap();
        assert_eq!(replayed.id, item.id);
    }
}
