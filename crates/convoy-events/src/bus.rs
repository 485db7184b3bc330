//! The event bus

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::warn;

use convoy_audit::{AuditError, AuditGateway};
use convoy_ports::{Clock, EventSink, StoreError};
use convoy_types::{DeploymentEvent, DeploymentId, EventPayload};

/// What to do when a subscriber's buffer fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest buffered event and count it.
    #[default]
    DropOldest,
    /// Deliver a final `Overflow` event and close the subscription.
    Disconnect,
}

/// Bus tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Buffered events per subscriber.
    pub subscriber_buffer: usize,
    /// Default policy for subscribers that don't pick one.
    pub overflow_policy: OverflowPolicy,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 1024,
            overflow_policy: OverflowPolicy::DropOldest,
        }
    }
}

struct SubShared {
    queue: Mutex<VecDeque<DeploymentEvent>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

struct Slot {
    filter: Option<DeploymentId>,
    policy: OverflowPolicy,
    capacity: usize,
    shared: Arc<SubShared>,
}

/// A subscriber's end of the stream.
///
/// `recv` yields events in publish order for each deployment. A return
/// of `None` means the subscription is over: the bus disconnected it
/// after an `Overflow` event, or the bus itself was dropped.
pub struct Subscription {
    shared: Arc<SubShared>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<DeploymentEvent> {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(event) = self.pop() {
                return Some(event);
            }
            if self.shared.closed.load(Ordering::SeqCst) {
                // Drain anything that raced in with the close.
                return self.pop();
            }
            notified.await;
        }
    }

    /// Non-blocking variant for polling observers.
    pub fn try_recv(&mut self) -> Option<DeploymentEvent> {
        self.pop()
    }

    /// Events evicted under `drop_oldest` so far.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::SeqCst)
    }

    fn pop(&self) -> Option<DeploymentEvent> {
        self.shared.queue.lock().unwrap().pop_front()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}

/// Single-process fan-out of pipeline events.
pub struct EventBus {
    audit: Arc<AuditGateway>,
    clock: Arc<dyn Clock>,
    config: EventBusConfig,
    seqs: DashMap<DeploymentId, u64>,
    slots: Mutex<Vec<Slot>>,
}

impl EventBus {
    pub fn new(audit: Arc<AuditGateway>, clock: Arc<dyn Clock>, config: EventBusConfig) -> Self {
        Self {
            audit,
            clock,
            config,
            seqs: DashMap::new(),
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe with the bus-default overflow policy. A `None` filter
    /// receives every deployment's events.
    pub fn subscribe(&self, filter: Option<DeploymentId>) -> Subscription {
        self.subscribe_with_policy(filter, self.config.overflow_policy)
    }

    pub fn subscribe_with_policy(
        &self,
        filter: Option<DeploymentId>,
        policy: OverflowPolicy,
    ) -> Subscription {
        let shared = Arc::new(SubShared {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        self.slots.lock().unwrap().push(Slot {
            filter,
            policy,
            capacity: self.config.subscriber_buffer,
            shared: shared.clone(),
        });
        Subscription { shared }
    }

    /// Sequence, persist, and fan out one event. The audit write happens
    /// before any subscriber sees the event; a persistence failure means
    /// nobody sees it, and the seq is not consumed (a deployment has one
    /// publisher, so its stream stays gap-free).
    pub async fn publish(
        &self,
        deployment_id: DeploymentId,
        payload: EventPayload,
    ) -> Result<u64, AuditError> {
        let seq = self.current_seq(deployment_id) + 1;
        let mut event = DeploymentEvent {
            deployment_id,
            seq,
            timestamp: self.clock.now(),
            payload,
        };
        self.audit.event(&mut event).await?;
        self.seqs.insert(deployment_id, seq);
        self.fan_out(event);
        Ok(seq)
    }

    /// Highest seq published for a deployment so far.
    pub fn current_seq(&self, deployment_id: DeploymentId) -> u64 {
        self.seqs.get(&deployment_id).map(|s| *s).unwrap_or(0)
    }

    /// Live subscriber count, for introspection.
    pub fn subscriber_count(&self) -> usize {
        let mut slots = self.slots.lock().unwrap();
        slots.retain(|s| !s.shared.closed.load(Ordering::SeqCst));
        slots.len()
    }

    fn fan_out(&self, event: DeploymentEvent) {
        let mut slots = self.slots.lock().unwrap();
        slots.retain(|s| !s.shared.closed.load(Ordering::SeqCst));
        for slot in slots.iter() {
            if let Some(filter) = slot.filter {
                if filter != event.deployment_id {
                    continue;
                }
            }
            let mut queue = slot.shared.queue.lock().unwrap();
            if queue.len() >= slot.capacity {
                match slot.policy {
                    OverflowPolicy::DropOldest => {
                        queue.pop_front();
                        slot.shared.dropped.fetch_add(1, Ordering::SeqCst);
                    }
                    OverflowPolicy::Disconnect => {
                        let dropped = slot.shared.dropped.load(Ordering::SeqCst) + 1;
                        warn!(
                            deployment_id = %event.deployment_id,
                            "disconnecting overflowing subscriber"
                        );
                        queue.push_back(DeploymentEvent {
                            deployment_id: event.deployment_id,
                            seq: event.seq,
                            timestamp: event.timestamp,
                            payload: EventPayload::Overflow { dropped },
                        });
                        slot.shared.closed.store(true, Ordering::SeqCst);
                        slot.shared.notify.notify_one();
                        continue;
                    }
                }
            }
            queue.push_back(event.clone());
            drop(queue);
            slot.shared.notify.notify_one();
        }
    }
}

#[async_trait]
impl EventSink for EventBus {
    async fn publish(
        &self,
        deployment_id: DeploymentId,
        payload: EventPayload,
    ) -> Result<u64, StoreError> {
        EventBus::publish(self, deployment_id, payload)
            .await
            .map_err(|e| match e {
                AuditError::Store(inner) => inner,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_audit::Redactor;
    use convoy_ports::{InMemoryStore, Store, SystemClock};

    fn bus(config: EventBusConfig) -> (Arc<InMemoryStore>, EventBus) {
        let store = Arc::new(InMemoryStore::new());
        let audit = Arc::new(AuditGateway::new(store.clone(), Arc::new(Redactor::new())));
        (store, EventBus::new(audit, Arc::new(SystemClock), config))
    }

    fn log(n: u64) -> EventPayload {
        EventPayload::LogLine {
            line: format!("line {n}"),
        }
    }

    #[tokio::test]
    async fn delivers_in_publish_order_with_contiguous_seq() {
        let (_, bus) = bus(EventBusConfig::default());
        let id = DeploymentId::generate();
        let mut sub = bus.subscribe(Some(id));

        for n in 0..5 {
            bus.publish(id, log(n)).await.unwrap();
        }
        let mut last = 0;
        for _ in 0..5 {
            let event = sub.recv().await.unwrap();
            assert_eq!(event.seq, last + 1);
            last = event.seq;
        }
    }

    #[tokio::test]
    async fn filter_excludes_other_deployments() {
        let (_, bus) = bus(EventBusConfig::default());
        let watched = DeploymentId::generate();
        let other = DeploymentId::generate();
        let mut sub = bus.subscribe(Some(watched));

        bus.publish(other, log(1)).await.unwrap();
        bus.publish(watched, log(2)).await.unwrap();

        let event = sub.recv().await.unwrap();
        assert_eq!(event.deployment_id, watched);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn drop_oldest_evicts_from_the_front() {
        let (_, bus) = bus(EventBusConfig {
            subscriber_buffer: 2,
            overflow_policy: OverflowPolicy::DropOldest,
        });
        let id = DeploymentId::generate();
        let mut sub = bus.subscribe(Some(id));

        for n in 0..4 {
            bus.publish(id, log(n)).await.unwrap();
        }

        // Seqs 1 and 2 were evicted.
        assert_eq!(sub.recv().await.unwrap().seq, 3);
        assert_eq!(sub.recv().await.unwrap().seq, 4);
        assert_eq!(sub.dropped(), 2);
    }

    #[tokio::test]
    async fn disconnect_policy_ends_with_overflow() {
        let (_, bus) = bus(EventBusConfig {
            subscriber_buffer: 2,
            overflow_policy: OverflowPolicy::Disconnect,
        });
        let id = DeploymentId::generate();
        let mut sub = bus.subscribe(Some(id));

        for n in 0..4 {
            bus.publish(id, log(n)).await.unwrap();
        }

        assert_eq!(sub.recv().await.unwrap().seq, 1);
        assert_eq!(sub.recv().await.unwrap().seq, 2);
        let overflow = sub.recv().await.unwrap();
        assert!(matches!(overflow.payload, EventPayload::Overflow { .. }));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn events_are_durable_with_no_subscribers() {
        let (store, bus) = bus(EventBusConfig::default());
        let id = DeploymentId::generate();
        bus.publish(id, log(1)).await.unwrap();
        assert_eq!(store.list_events(id, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn publish_fails_closed_when_store_is_down() {
        let (store, bus) = bus(EventBusConfig::default());
        let id = DeploymentId::generate();
        let mut sub = bus.subscribe(Some(id));

        store.set_unavailable(true);
        assert!(bus.publish(id, log(1)).await.is_err());
        assert!(sub.try_recv().is_none());
    }
}
