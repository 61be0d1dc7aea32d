//! `relay-bus` — the typed, in-process event bus (§4.1). Publish delivers
//! synchronously to matching handlers with per-type failure isolation, and
//! separately feeds a ring-buffered broadcast sink consumed by the Gateway's
//! WebSocket layer once a client attaches.
//!
//! The fan-out half is a plain `tokio::sync::broadcast` wrapper; the
//! synchronous handler chain and queue-until-ready ring in front of it give
//! every publisher a typed in-process pub/sub with failure-counted handlers,
//! independent of whether any WebSocket client has attached yet.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, RwLock};

use dashmap::DashMap;
use relay_core::types::{Event, EventType};
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_RING_CAPACITY: usize = 1000;

/// A subscribed callback. Returning `Err` marks the handler as failed for
/// this delivery; the bus counts it per event type and moves on to the next
/// handler — a failing handler never blocks others.
pub type Handler = Box<dyn Fn(&Event) -> Result<(), String> + Send + Sync>;

/// Opaque handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription(u64);

struct HandlerEntry {
    id: u64,
    filter: Option<EventType>,
    handler: Handler,
}

struct PendingRing {
    buf: VecDeque<Event>,
    capacity: usize,
}

/// Typed in-process event bus. One writer (any component may call `publish`),
/// many readers (both synchronous handlers and the broadcast sink).
pub struct EventBus {
    handlers: RwLock<Vec<HandlerEntry>>,
    next_id: AtomicU64,
    failure_counts: DashMap<EventType, AtomicU64>,
    broadcast_tx: broadcast::Sender<Event>,
    pending: Mutex<PendingRing>,
    /// Signalled whenever `pending` gains room or the bus attaches, so a
    /// publisher parked in `feed_broadcast` under `drop_if_slow = false`
    /// wakes up and re-checks.
    pending_space: Condvar,
    attached: AtomicBool,
    drop_if_slow: bool,
}

impl EventBus {
    pub fn new(drop_if_slow: bool) -> Self {
        Self::with_ring_capacity(DEFAULT_RING_CAPACITY, drop_if_slow)
    }

    pub fn with_ring_capacity(ring_capacity: usize, drop_if_slow: bool) -> Self {
        let (broadcast_tx, _) = broadcast::channel(ring_capacity.max(16));
        Self {
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            failure_counts: DashMap::new(),
            broadcast_tx,
            pending: Mutex::new(PendingRing { buf: VecDeque::new(), capacity: ring_capacity }),
            pending_space: Condvar::new(),
            attached: AtomicBool::new(false),
            drop_if_slow,
        }
    }

    /// Subscribe to one event type, or `None` for every type ("any").
    pub fn subscribe(&self, filter: Option<EventType>, handler: Handler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.write().expect("handlers lock poisoned").push(HandlerEntry { id, filter, handler });
        Subscription(id)
    }

    pub fn unsubscribe(&self, sub: Subscription) {
        self.handlers.write().expect("handlers lock poisoned").retain(|h| h.id != sub.0);
    }

    /// Deliver `event` synchronously to every matching handler, then feed the
    /// broadcast sink. Handler failures are caught and counted per event
    /// type; they never prevent delivery to the remaining handlers.
    pub fn publish(&self, event: Event) {
        let handlers = self.handlers.read().expect("handlers lock poisoned");
        for entry in handlers.iter() {
            if entry.filter.is_some() && entry.filter != Some(event.event_type) {
                continue;
            }
            if let Err(reason) = (entry.handler)(&event) {
                warn!(event_type = ?event.event_type, reason = %reason, "event handler failed");
                self.failure_counts.entry(event.event_type).or_insert_with(|| AtomicU64::new(0)).fetch_add(1, Ordering::Relaxed);
            }
        }
        drop(handlers);

        self.feed_broadcast(event);
    }

    /// Before the first WebSocket client attaches, events queue in a bounded
    /// ring. `drop_if_slow = true` drops the oldest queued event to make
    /// room; `drop_if_slow = false` blocks the calling publisher on
    /// `pending_space` until either room frees up or a client attaches
    /// (`attach_broadcast` notifies this condvar either way).
    ///
    /// Once attached, delivery goes straight to `broadcast::Sender::send`,
    /// which never blocks by its own design — a slow receiver drops
    /// messages on its own lagged end rather than stalling the publisher.
    /// `drop_if_slow` has nothing left to govern past that point; it only
    /// ever shaped the pre-attach ring.
    fn feed_broadcast(&self, event: Event) {
        if self.attached.load(Ordering::Acquire) {
            let _ = self.broadcast_tx.send(event);
            return;
        }

        let mut pending = self.pending.lock().expect("pending lock poisoned");
        while pending.buf.len() >= pending.capacity && !self.attached.load(Ordering::Acquire) {
            if self.drop_if_slow {
                pending.buf.pop_front();
                break;
            }
            warn!("broadcast ring at capacity before first attach, publisher blocking for room");
            pending = tokio::task::block_in_place(|| self.pending_space.wait(pending).expect("pending lock poisoned"));
        }

        if self.attached.load(Ordering::Acquire) {
            drop(pending);
            let _ = self.broadcast_tx.send(event);
            return;
        }

        pending.buf.push_back(event);
        drop(pending);
        self.pending_space.notify_all();
    }

    /// Failures recorded for `event_type` across this bus's lifetime.
    pub fn failure_count(&self, event_type: EventType) -> u64 {
        self.failure_counts.get(&event_type).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }

    /// Called once by the Gateway when the first WebSocket client attaches.
    /// Returns buffered events in publish order, plus a live receiver for
    /// everything published from now on. Idempotent: later calls just hand
    /// back a fresh receiver with an empty flush.
    pub fn attach_broadcast(&self) -> (Vec<Event>, broadcast::Receiver<Event>) {
        self.attached.store(true, Ordering::Release);
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        let flushed: Vec<Event> = pending.buf.drain(..).collect();
        drop(pending);
        // Wake any publisher parked in `feed_broadcast` under
        // `drop_if_slow = false` — it re-checks `attached` and proceeds.
        self.pending_space.notify_all();
        (flushed, self.broadcast_tx.subscribe())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::types::EventType;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn event(t: EventType) -> Event {
        Event::new(t, "test", serde_json::json!({}))
    }

    #[test]
    fn any_subscriber_receives_every_type() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe(None, Box::new(move |_e| { c.fetch_add(1, Ordering::Relaxed); Ok(()) }));

        bus.publish(event(EventType::AgentStart));
        bus.publish(event(EventType::CronTick));

        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn filtered_subscriber_ignores_other_types() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe(Some(EventType::AgentDone), Box::new(move |_e| { c.fetch_add(1, Ordering::Relaxed); Ok(()) }));

        bus.publish(event(EventType::AgentStart));
        bus.publish(event(EventType::AgentDone));

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn failing_handler_does_not_block_others_and_is_counted() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe(None, Box::new(|_e| Err("boom".to_string())));
        bus.subscribe(None, Box::new(move |_e| { c.fetch_add(1, Ordering::Relaxed); Ok(()) }));

        bus.publish(event(EventType::AgentError));

        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(bus.failure_count(EventType::AgentError), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let sub = bus.subscribe(None, Box::new(move |_e| { c.fetch_add(1, Ordering::Relaxed); Ok(()) }));
        bus.unsubscribe(sub);

        bus.publish(event(EventType::SystemStartup));

        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn events_published_before_attach_are_buffered_and_flushed_in_order() {
        let bus = EventBus::default();
        bus.publish(event(EventType::AgentStart));
        bus.publish(event(EventType::AgentDone));

        let (flushed, _rx) = bus.attach_broadcast();
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].event_type, EventType::AgentStart);
        assert_eq!(flushed[1].event_type, EventType::AgentDone);
    }

    #[test]
    fn events_after_attach_go_to_live_receiver() {
        let bus = EventBus::default();
        let (_flushed, mut rx) = bus.attach_broadcast();
        bus.publish(event(EventType::CronRunDone));

        let received = rx.try_recv().expect("event should be available");
        assert_eq!(received.event_type, EventType::CronRunDone);
    }

    #[test]
    fn drop_if_slow_pops_the_oldest_pending_event() {
        let bus = EventBus::with_ring_capacity(2, true);
        bus.publish(event(EventType::AgentStart));
        bus.publish(event(EventType::AgentText));
        bus.publish(event(EventType::AgentDone));

        let (flushed, _rx) = bus.attach_broadcast();
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].event_type, EventType::AgentText);
        assert_eq!(flushed[1].event_type, EventType::AgentDone);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_publisher_is_released_by_attach() {
        let bus = Arc::new(EventBus::with_ring_capacity(1, false));
        bus.publish(event(EventType::AgentStart));

        let released = Arc::new(AtomicUsize::new(0));
        let blocker = {
            let bus = bus.clone();
            let released = released.clone();
            tokio::spawn(async move {
                // The ring is already full and nothing attaches yet, so this
                // call must block rather than drop `AgentStart`.
                bus.publish(event(EventType::AgentDone));
                released.fetch_add(1, Ordering::Relaxed);
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(released.load(Ordering::Relaxed), 0, "publisher should still be parked");

        let (flushed, _rx) = bus.attach_broadcast();
        blocker.await.unwrap();

        assert_eq!(released.load(Ordering::Relaxed), 1);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].event_type, EventType::AgentStart);
    }
}
