//! Bounded registry of topic subscriptions.
//!
//! Each registration is a `(topic, handler)` pair. Several handlers may share
//! one topic; the broker only ever sees one subscription per topic, at the
//! highest QoS any of its registrations asked for.
//!
//! # Layout
//!
//! Registrations live in a fixed arena of slots with a free list, so the
//! capacity chosen at initialization is a hard limit. A topic index maps each
//! topic to its slots and to the wire request currently standing for it, which
//! keeps message dispatch from scanning unrelated registrations.
//!
//! # Registration states
//!
//! ```text
//! None ──► Requested ──► Acknowledged
//!   │          │
//!   └──────────┴──► Failed (kept, retried on the next reconnect)
//! ```

use super::error::SessionError;
use super::message_manager::{Delivery, InboundMessage, MessageHandler};
use super::transport::{RequestId, Transport};
use super::QoS;
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, info, warn};

/// Broker-side status of one registration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Not subscribed (fresh entry, or connection dropped)
    #[default]
    None,
    /// Subscribe sent, waiting for SUBACK
    Requested,
    /// SUBACK received, messages flow
    Acknowledged,
    /// Wire subscribe could not be sent
    Failed,
}

#[derive(Debug, Clone)]
struct Subscription {
    topic: String,
    handler: MessageHandler,
    qos: QoS,
    state: SubscriptionState,
    pending_request: Option<RequestId>,
}

/// Read-only view of a registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub topic: String,
    pub qos: QoS,
    pub state: SubscriptionState,
    pub pending_request: Option<RequestId>,
}

impl From<&Subscription> for SubscriptionInfo {
    fn from(entry: &Subscription) -> Self {
        SubscriptionInfo {
            topic: entry.topic.clone(),
            qos: entry.qos,
            state: entry.state,
            pending_request: entry.pending_request,
        }
    }
}

/// The subscribe request currently standing for a topic in this connection cycle
#[derive(Debug, Clone, Copy)]
struct WireRequest {
    qos: QoS,
    request_id: RequestId,
    acknowledged: bool,
}

#[derive(Debug, Default)]
struct TopicSlots {
    slots: Vec<usize>,
    wire: Option<WireRequest>,
}

#[derive(Debug)]
pub struct SubscriptionTable {
    slots: Vec<Option<Subscription>>,
    free: Vec<usize>,
    topics: HashMap<String, TopicSlots>,
}

impl SubscriptionTable {
    pub fn with_capacity(capacity: usize) -> Result<Self, SessionError> {
        if capacity == 0 {
            return Err(SessionError::InvalidParameters(
                "subscription capacity must be greater than 0".into(),
            ));
        }
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|e| SessionError::AllocationFailure(e.to_string()))?;
        slots.resize_with(capacity, || None);

        debug!("Subscription table created with {} slots", capacity);
        Ok(Self {
            slots,
            free: (0..capacity).rev().collect(),
            topics: HashMap::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register `handler` for `topic`, or refresh an existing registration.
    ///
    /// Returns `Ok` once the registration is tracked, even when the wire
    /// subscribe failed; such entries are `Failed` and get retried by
    /// [`resubscribe_all`](Self::resubscribe_all).
    pub fn subscribe(
        &mut self,
        topic: &str,
        handler: MessageHandler,
        qos: QoS,
        wire: &mut dyn Transport,
    ) -> Result<(), SessionError> {
        if topic.is_empty() {
            return Err(SessionError::InvalidArgument("topic must not be empty".into()));
        }

        if let Some(slot) = self.find(topic, &handler) {
            let Some(entry) = self.slots[slot].as_mut() else {
                return Ok(());
            };
            entry.handler = handler;

            if entry.state == SubscriptionState::Acknowledged && qos <= entry.qos {
                debug!("Subscription for topic {} already active, nothing to send", topic);
                return Ok(());
            }
            if qos > entry.qos {
                debug!(
                    "QoS upgrade requested for topic: {} ({} -> {})",
                    topic, entry.qos, qos
                );
                entry.qos = qos;
            }
            self.request_for(topic, slot, wire);
            return Ok(());
        }

        let Some(slot) = self.free.pop() else {
            error!("No space for new subscription to topic: {}", topic);
            return Err(SessionError::CapacityExceeded {
                capacity: self.capacity(),
            });
        };
        self.slots[slot] = Some(Subscription {
            topic: topic.to_string(),
            handler,
            qos,
            state: SubscriptionState::None,
            pending_request: None,
        });
        self.topics
            .entry(topic.to_string())
            .or_default()
            .slots
            .push(slot);

        self.request_for(topic, slot, wire);
        Ok(())
    }

    /// Bring the registration in `slot` in line with the broker.
    ///
    /// Reuses the topic's standing request when it already covers the
    /// registration's QoS; otherwise sends one subscribe at the topic's
    /// maximum QoS and moves every not yet acknowledged registration of the
    /// topic onto it.
    fn request_for(&mut self, topic: &str, slot: usize, wire: &mut dyn Transport) {
        let Some(needed) = self.slots[slot].as_ref().map(|entry| entry.qos) else {
            return;
        };
        if let Some(active) = self.active_covering(topic, slot, needed) {
            if let Some(entry) = self.slots[slot].as_mut() {
                entry.state = SubscriptionState::Acknowledged;
                entry.pending_request = active;
                debug!("Added callback for already-subscribed topic: {}", topic);
            }
            return;
        }

        let standing = self.topics.get(topic).and_then(|t| t.wire);
        if let Some(request) = standing.filter(|request| request.qos >= needed) {
            if let Some(entry) = self.slots[slot].as_mut() {
                entry.pending_request = Some(request.request_id);
                if request.acknowledged {
                    entry.state = SubscriptionState::Acknowledged;
                    debug!("Added callback for already-subscribed topic: {}", topic);
                } else {
                    entry.state = SubscriptionState::Requested;
                    debug!(
                        "Joined pending subscribe for topic: {} (msg_id: {})",
                        topic, request.request_id
                    );
                }
            }
            return;
        }

        let qos = self.effective_qos(topic).unwrap_or(needed);
        match wire.subscribe(topic, qos) {
            Ok(request_id) => {
                debug!(
                    "Subscribed to topic: {} (msg_id: {}, QoS: {})",
                    topic, request_id, qos
                );
                if let Some(topic_slots) = self.topics.get_mut(topic) {
                    topic_slots.wire = Some(WireRequest {
                        qos,
                        request_id,
                        acknowledged: false,
                    });
                    for &other in &topic_slots.slots {
                        if let Some(entry) = self.slots[other].as_mut() {
                            if other == slot || entry.state != SubscriptionState::Acknowledged {
                                entry.state = SubscriptionState::Requested;
                                entry.pending_request = Some(request_id);
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!(
                    "MQTT subscribe failed for topic: {}, keeping it for retry: {}",
                    topic, e
                );
                if let Some(entry) = self.slots[slot].as_mut() {
                    entry.state = SubscriptionState::Failed;
                    entry.pending_request = None;
                }
            }
        }
    }

    /// Request id of another registration of `topic` the broker already
    /// delivers to at `needed` or better. An escalation may still be pending
    /// for the topic.
    fn active_covering(&self, topic: &str, slot: usize, needed: QoS) -> Option<Option<RequestId>> {
        self.topics
            .get(topic)?
            .slots
            .iter()
            .filter(|&&other| other != slot)
            .filter_map(|&other| self.slots[other].as_ref())
            .find(|entry| entry.state == SubscriptionState::Acknowledged && entry.qos >= needed)
            .map(|entry| entry.pending_request)
    }

    /// Remove the first registration of `topic`.
    ///
    /// The wire unsubscribe goes out only when no other registration shares
    /// the topic.
    pub fn unsubscribe(&mut self, topic: &str, wire: &mut dyn Transport) -> Result<(), SessionError> {
        let slot = self
            .topics
            .get(topic)
            .and_then(|t| t.slots.first().copied())
            .ok_or_else(|| SessionError::NotFound(topic.to_string()))?;
        self.remove_slot(topic, slot, wire);
        Ok(())
    }

    /// Remove the registration of exactly this `(topic, handler)` pair
    pub fn unsubscribe_handler(
        &mut self,
        topic: &str,
        handler: &MessageHandler,
        wire: &mut dyn Transport,
    ) -> Result<(), SessionError> {
        let slot = self
            .find(topic, handler)
            .ok_or_else(|| SessionError::NotFound(topic.to_string()))?;
        self.remove_slot(topic, slot, wire);
        Ok(())
    }

    /// Drop every registration, one wire unsubscribe per topic (best-effort)
    pub fn unsubscribe_all(&mut self, wire: &mut dyn Transport) -> usize {
        let mut removed = 0;
        for topic in self.topic_order() {
            while let Some(slot) = self.topics.get(&topic).and_then(|t| t.slots.first().copied()) {
                self.remove_slot(&topic, slot, wire);
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Removed {} subscriptions", removed);
        }
        removed
    }

    fn remove_slot(&mut self, topic: &str, slot: usize, wire: &mut dyn Transport) {
        let Some(topic_slots) = self.topics.get_mut(topic) else {
            return;
        };
        topic_slots.slots.retain(|&s| s != slot);
        let last = topic_slots.slots.is_empty();
        self.slots[slot] = None;
        self.free.push(slot);

        if !last {
            debug!(
                "Not unsubscribing from topic {} - other callbacks still exist",
                topic
            );
            return;
        }
        self.topics.remove(topic);
        match wire.unsubscribe(topic) {
            Ok(request_id) => debug!("Unsubscribed from topic: {} (msg_id: {})", topic, request_id),
            Err(e) => warn!("Could not unsubscribe from topic: {}: {}", topic, e),
        }
    }

    /// Forget broker-side state; registrations stay so they survive reconnects
    pub fn reset_all_states(&mut self) {
        for entry in self.slots.iter_mut().flatten() {
            entry.state = SubscriptionState::None;
            entry.pending_request = None;
        }
        for topic_slots in self.topics.values_mut() {
            topic_slots.wire = None;
        }
    }

    /// One subscribe per distinct topic at its maximum QoS.
    ///
    /// Every registration of the topic ends `Requested` with the new request
    /// id, or `Failed` when the wire call errors. Returns the number of wire
    /// subscribes that were accepted.
    pub fn resubscribe_all(&mut self, wire: &mut dyn Transport) -> usize {
        let mut accepted = 0;
        for topic in self.topic_order() {
            let Some(qos) = self.effective_qos(&topic) else {
                continue;
            };
            let result = wire.subscribe(&topic, qos);
            let (state, pending_request) = match &result {
                Ok(request_id) => {
                    accepted += 1;
                    debug!(
                        "Reconnect: Subscribed to {} (msg_id: {}, QoS: {})",
                        topic, request_id, qos
                    );
                    (SubscriptionState::Requested, Some(*request_id))
                }
                Err(e) => {
                    warn!("Reconnect: Failed to subscribe to {}: {}", topic, e);
                    (SubscriptionState::Failed, None)
                }
            };

            let Some(topic_slots) = self.topics.get_mut(&topic) else {
                continue;
            };
            topic_slots.wire = result.ok().map(|request_id| WireRequest {
                qos,
                request_id,
                acknowledged: false,
            });
            for &slot in &topic_slots.slots {
                if let Some(entry) = self.slots[slot].as_mut() {
                    entry.state = state;
                    entry.pending_request = pending_request;
                }
            }
        }
        accepted
    }

    /// SUBACK for `request_id`; returns how many registrations became active
    pub fn acknowledge(&mut self, request_id: RequestId) -> usize {
        for topic_slots in self.topics.values_mut() {
            if let Some(request) = topic_slots.wire.as_mut() {
                if request.request_id == request_id {
                    request.acknowledged = true;
                }
            }
        }

        let mut acknowledged = 0;
        for entry in self.slots.iter_mut().flatten() {
            if entry.pending_request == Some(request_id) {
                entry.state = SubscriptionState::Acknowledged;
                acknowledged += 1;
                debug!("Subscription acknowledged for topic: {}", entry.topic);
            }
        }
        acknowledged
    }

    /// Collect the handlers registered for exactly `topic`.
    ///
    /// Acknowledgment state is ignored: a message may arrive before its SUBACK.
    pub fn dispatch(&self, topic: &str, payload: Vec<u8>) -> Delivery {
        let handlers: Vec<MessageHandler> = self
            .topics
            .get(topic)
            .map(|topic_slots| {
                topic_slots
                    .slots
                    .iter()
                    .filter_map(|&slot| self.slots[slot].as_ref())
                    .map(|entry| entry.handler.clone())
                    .collect()
            })
            .unwrap_or_default();

        Delivery {
            message: InboundMessage::new(topic.to_string(), payload),
            handlers,
        }
    }

    /// Highest QoS among the live registrations of `topic`
    pub fn effective_qos(&self, topic: &str) -> Option<QoS> {
        self.topics.get(topic).and_then(|topic_slots| {
            topic_slots
                .slots
                .iter()
                .filter_map(|&slot| self.slots[slot].as_ref())
                .map(|entry| entry.qos)
                .max()
        })
    }

    pub fn get(&self, topic: &str, handler: &MessageHandler) -> Option<SubscriptionInfo> {
        self.find(topic, handler)
            .and_then(|slot| self.slots[slot].as_ref())
            .map(SubscriptionInfo::from)
    }

    /// Snapshot of all registrations in slot order
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.slots
            .iter()
            .flatten()
            .map(SubscriptionInfo::from)
            .collect()
    }

    fn find(&self, topic: &str, handler: &MessageHandler) -> Option<usize> {
        self.topics.get(topic)?.slots.iter().copied().find(|&slot| {
            self.slots[slot]
                .as_ref()
                .is_some_and(|entry| entry.handler.same_as(handler))
        })
    }

    /// Distinct topics, ordered by the lowest slot that uses them
    fn topic_order(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        for entry in self.slots.iter().flatten() {
            if seen.insert(entry.topic.as_str()) {
                order.push(entry.topic.clone());
            }
        }
        order
    }
}
