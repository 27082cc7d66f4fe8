//! Event Bus
//!
//! Typed publish/subscribe fan-out. Every subscriber owns a bounded queue;
//! `publish` never blocks and never waits on a slow consumer. A subscriber
//! whose queue overflows is dropped and receives a terminal `OVERFLOW`
//! notice after draining what was already queued. Ordering is preserved per
//! subscriber; nothing is replayed to late subscribers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::models::event::{Event, EventFilter, OverflowNotice};

const DEFAULT_QUEUE_CAPACITY: usize = 1024;

struct SubscriberHandle {
    filter: EventFilter,
    tx: mpsc::Sender<Event>,
    overflowed: Arc<AtomicBool>,
}

/// The bus. Cheap to clone; owns no domain state.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    subscribers: DashMap<u64, SubscriberHandle>,
    next_id: AtomicU64,
    queue_capacity: usize,
    published: AtomicU64,
    dropped_subscribers: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(1),
                queue_capacity: queue_capacity.max(1),
                published: AtomicU64::new(0),
                dropped_subscribers: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe with a filter. Only events published after this call are
    /// delivered.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        let overflowed = Arc::new(AtomicBool::new(false));

        self.inner.subscribers.insert(
            id,
            SubscriberHandle {
                filter,
                tx,
                overflowed: Arc::clone(&overflowed),
            },
        );

        debug!(subscriber = id, "event bus subscription opened");

        Subscription {
            id,
            rx,
            overflowed,
            overflow_emitted: false,
            bus: Arc::clone(&self.inner),
        }
    }

    /// Deliver to every matching subscriber. Completes in bounded time
    /// regardless of subscriber count; a full queue drops that subscriber
    /// and touches nobody else.
    pub fn publish(&self, event: Event) {
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        let mut to_drop: Vec<u64> = Vec::new();

        for entry in self.inner.subscribers.iter() {
            if !entry.filter.matches(&event) {
                continue;
            }
            match entry.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    entry.overflowed.store(true, Ordering::Release);
                    to_drop.push(*entry.key());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Receiver went away without unsubscribing
                    to_drop.push(*entry.key());
                }
            }
        }

        for id in to_drop {
            if self.inner.subscribers.remove(&id).is_some() {
                self.inner.dropped_subscribers.fetch_add(1, Ordering::Relaxed);
                warn!(subscriber = id, "event bus subscriber dropped");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped_subscribers.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription. Dropping it releases the subscriber slot.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Event>,
    overflowed: Arc<AtomicBool>,
    overflow_emitted: bool,
    bus: Arc<BusInner>,
}

impl Subscription {
    /// Next event. After an overflow the already-queued events drain first,
    /// then one terminal `OVERFLOW` notice, then `None`.
    pub async fn recv(&mut self) -> Option<Event> {
        if let Some(event) = self.rx.recv().await {
            return Some(event);
        }
        self.terminal_overflow()
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<Event> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => self.terminal_overflow(),
        }
    }

    fn terminal_overflow(&mut self) -> Option<Event> {
        if self.overflowed.load(Ordering::Acquire) && !self.overflow_emitted {
            self.overflow_emitted = true;
            Some(Event::Overflow(OverflowNotice::default()))
        } else {
            None
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.subscribers.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::event::{EventKind, PriceEvent};
    use rust_decimal::Decimal;

    fn tick(symbol: &str, seq: i64) -> Event {
        Event::Price(PriceEvent {
            kind: EventKind::PriceUpdate,
            symbol: symbol.to_string(),
            price: Decimal::from(seq),
            change_pct: Decimal::ZERO,
            ts: seq,
        })
    }

    fn seq_of(event: &Event) -> i64 {
        match event {
            Event::Price(e) => e.ts,
            _ => panic!("expected price event"),
        }
    }

    #[tokio::test]
    async fn test_delivery_preserves_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventFilter::all());

        for i in 0..10 {
            bus.publish(tick("AAPL", i));
        }

        for i in 0..10 {
            let event = sub.recv().await.unwrap();
            assert_eq!(seq_of(&event), i);
        }
    }

    #[tokio::test]
    async fn test_no_replay_before_subscription() {
        let bus = EventBus::new();
        bus.publish(tick("AAPL", 1));

        let mut sub = bus.subscribe(EventFilter::all());
        bus.publish(tick("AAPL", 2));

        assert_eq!(seq_of(&sub.try_recv().unwrap()), 2);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_filter_restricts_delivery() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(
            EventFilter::for_kinds([EventKind::PriceUpdate]).with_symbols(["AAPL".to_string()]),
        );

        bus.publish(tick("GOOG", 1));
        bus.publish(tick("AAPL", 2));

        assert_eq!(seq_of(&sub.try_recv().unwrap()), 2);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_drop_releases_slot() {
        let bus = EventBus::new();
        let sub = bus.subscribe(EventFilter::all());
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    /// Fan-out backpressure: many subscribers, one stops reading. The slow
    /// one is dropped with a terminal OVERFLOW after 1024 undelivered
    /// events; the rest keep receiving everything, in order.
    #[tokio::test]
    async fn test_slow_subscriber_dropped_with_overflow() {
        let bus = EventBus::new();
        let total = 1100i64;

        let mut fast: Vec<Subscription> =
            (0..99).map(|_| bus.subscribe(EventFilter::all())).collect();
        let mut slow = bus.subscribe(EventFilter::all());
        let mut fast_received: Vec<Vec<i64>> = vec![Vec::new(); fast.len()];

        for i in 0..total {
            bus.publish(tick("AAPL", i));
            // Fast subscribers keep up; the slow one never reads.
            if i % 256 == 0 {
                for (sub, received) in fast.iter_mut().zip(fast_received.iter_mut()) {
                    while let Some(event) = sub.try_recv() {
                        received.push(seq_of(&event));
                    }
                }
            }
        }

        for (sub, received) in fast.iter_mut().zip(fast_received.iter_mut()) {
            while let Some(event) = sub.try_recv() {
                received.push(seq_of(&event));
            }
        }

        // The 99 fast subscribers got every event, in order.
        for received in &fast_received {
            assert_eq!(received.len(), total as usize);
            assert!(received.windows(2).all(|w| w[0] < w[1]));
        }

        // The slow one drained its 1024 queued events, then saw OVERFLOW.
        let mut drained = 0;
        loop {
            match slow.try_recv() {
                Some(event) if event.is_overflow() => break,
                Some(_) => drained += 1,
                None => panic!("expected terminal OVERFLOW"),
            }
        }
        assert_eq!(drained, 1024);
        assert!(slow.try_recv().is_none());
        assert_eq!(bus.dropped_count(), 1);
        assert_eq!(bus.subscriber_count(), 99);
    }

    #[tokio::test]
    async fn test_publish_with_no_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(tick("AAPL", 1));
        assert_eq!(bus.published_count(), 1);
    }
}
