//! Turns transport events into table mutations, handler deliveries and
//! outward notifications.
//!
//! ```text
//! Connected ──────► reset states ──► resubscribe all ──► Notification::Connected
//! Disconnected ───► reset states ──────────────────────► Notification::Disconnected
//! SubscribeAck ───► table.acknowledge
//! PublishAck ─────► Notification::Published
//! MessageDeleted ─► Notification::MessageDeleted (when enabled)
//! Data ───────────► reassembly ──► table.dispatch ──► Delivery
//! Error ──────────► log
//! ```

use super::message_manager::{Delivery, Notification, NotificationSender};
use super::mqtt_handler::{ConnectionState, MqttStatus};
use super::reassembly::{ChunkOutcome, Reassembler};
use super::subscription_table::SubscriptionTable;
use super::transport::{Transport, TransportEvent};
use chrono::Local;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const MAX_ERROR_HISTORY: usize = 16;

#[derive(Debug)]
pub struct EventTranslator {
    reassembler: Reassembler,
    notifier: NotificationSender,
    status: Arc<watch::Sender<MqttStatus>>,
    report_deleted_messages: bool,
}

impl EventTranslator {
    pub fn new(
        notifier: NotificationSender,
        status: Arc<watch::Sender<MqttStatus>>,
        report_deleted_messages: bool,
    ) -> Self {
        Self {
            reassembler: Reassembler::new(),
            notifier,
            status,
            report_deleted_messages,
        }
    }

    /// Apply one event. A returned [`Delivery`] must be run by the caller once
    /// the session lock is released.
    pub fn handle(
        &mut self,
        event: TransportEvent,
        table: &mut SubscriptionTable,
        wire: &mut dyn Transport,
    ) -> Option<Delivery> {
        match event {
            TransportEvent::Connected => {
                info!("MQTT Connected");
                table.reset_all_states();
                let sent = table.resubscribe_all(wire);
                debug!("Resubscribed {} topics after connect", sent);
                self.status.send_modify(|status| {
                    status.connection_state = ConnectionState::Connected;
                    status.last_activity = Some(Local::now());
                });
                self.notifier.emit(Notification::Connected);
                None
            }
            TransportEvent::Disconnected => {
                warn!("MQTT Disconnected. Will try reconnecting in a while...");
                table.reset_all_states();
                self.reassembler.clear();
                self.status.send_modify(|status| {
                    if status.connection_state != ConnectionState::Disconnected {
                        status.connection_state = ConnectionState::Reconnecting;
                    }
                });
                self.notifier.emit(Notification::Disconnected);
                None
            }
            TransportEvent::SubscribeAck { request_id } => {
                let count = table.acknowledge(request_id);
                debug!("SUBACK msg_id={} acknowledged {} subscriptions", request_id, count);
                None
            }
            TransportEvent::UnsubscribeAck { request_id } => {
                debug!("UNSUBACK msg_id={}", request_id);
                None
            }
            TransportEvent::PublishAck { request_id } => {
                debug!("Publish acknowledged, msg_id={}", request_id);
                self.notifier.emit(Notification::Published(request_id));
                None
            }
            TransportEvent::MessageDeleted { request_id } => {
                if self.report_deleted_messages {
                    debug!("Stored message deleted by broker, msg_id={}", request_id);
                    self.notifier.emit(Notification::MessageDeleted(request_id));
                } else {
                    debug!("Ignoring deleted message report, msg_id={}", request_id);
                }
                None
            }
            TransportEvent::Data(chunk) => match self.reassembler.on_chunk(chunk) {
                Ok(ChunkOutcome::Complete { topic, payload }) => {
                    let delivery = table.dispatch(&topic, payload);
                    debug!(
                        "Message on {} ({} bytes) for {} handlers",
                        topic,
                        delivery.message.payload.len(),
                        delivery.handlers.len()
                    );
                    self.status.send_modify(|status| {
                        status.messages_received += 1;
                        status.last_activity = Some(delivery.message.received_at);
                    });
                    Some(delivery)
                }
                Ok(ChunkOutcome::Buffering { .. }) => None,
                Err(e) => {
                    warn!("Dropping inbound data: {}", e);
                    None
                }
            },
            TransportEvent::Error(message) => {
                error!("MQTT_EVENT_ERROR: {}", message);
                self.status.send_modify(|status| {
                    status.error_messages.push(message);
                    let overflow = status.error_messages.len().saturating_sub(MAX_ERROR_HISTORY);
                    status.error_messages.drain(..overflow);
                });
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::message_manager::MessageHandler;
    use crate::mqtt::subscription_table::SubscriptionState;
    use crate::mqtt::transport::testing::MockTransport;
    use crate::mqtt::transport::DataChunk;
    use crate::mqtt::QoS;
    use tokio::sync::mpsc;

    struct Fixture {
        translator: EventTranslator,
        table: SubscriptionTable,
        wire: MockTransport,
        notifications: mpsc::Receiver<Notification>,
        status: watch::Receiver<MqttStatus>,
    }

    fn fixture(report_deleted: bool) -> Fixture {
        let (notifier, notifications) = NotificationSender::channel(16);
        let (status_tx, status) = watch::channel(MqttStatus::default());
        Fixture {
            translator: EventTranslator::new(notifier, Arc::new(status_tx), report_deleted),
            table: SubscriptionTable::with_capacity(8).unwrap(),
            wire: MockTransport::new(),
            notifications,
            status,
        }
    }

    impl Fixture {
        fn feed(&mut self, event: TransportEvent) -> Option<Delivery> {
            self.translator.handle(event, &mut self.table, &mut self.wire)
        }
    }

    #[test]
    fn connected_resubscribes_and_notifies() {
        let mut fx = fixture(false);
        let h = MessageHandler::new(|_| {});
        fx.wire.refuse_subscribes(true);
        fx.table.subscribe("a", h.clone(), QoS::AtLeastOnce, &mut fx.wire).unwrap();
        fx.wire.refuse_subscribes(false);

        fx.feed(TransportEvent::Connected);

        assert_eq!(fx.table.get("a", &h).unwrap().state, SubscriptionState::Requested);
        assert_eq!(fx.notifications.try_recv().unwrap(), Notification::Connected);
        assert_eq!(fx.status.borrow().connection_state, ConnectionState::Connected);
    }

    #[test]
    fn disconnected_resets_without_unsubscribing() {
        let mut fx = fixture(false);
        let h = MessageHandler::new(|_| {});
        fx.table.subscribe("a", h.clone(), QoS::AtMostOnce, &mut fx.wire).unwrap();
        fx.feed(TransportEvent::SubscribeAck { request_id: 1 });

        fx.feed(TransportEvent::Disconnected);

        assert_eq!(fx.table.get("a", &h).unwrap().state, SubscriptionState::None);
        assert!(fx.wire.unsubscribes().is_empty());
        assert_eq!(fx.notifications.try_recv().unwrap(), Notification::Disconnected);
        assert_eq!(fx.status.borrow().connection_state, ConnectionState::Reconnecting);
    }

    #[test]
    fn suback_acknowledges_matching_request() {
        let mut fx = fixture(false);
        let h = MessageHandler::new(|_| {});
        fx.table.subscribe("a", h.clone(), QoS::AtMostOnce, &mut fx.wire).unwrap();

        fx.feed(TransportEvent::SubscribeAck { request_id: 99 });
        assert_eq!(fx.table.get("a", &h).unwrap().state, SubscriptionState::Requested);
        fx.feed(TransportEvent::SubscribeAck { request_id: 1 });
        assert_eq!(fx.table.get("a", &h).unwrap().state, SubscriptionState::Acknowledged);
    }

    #[test]
    fn publish_ack_becomes_notification() {
        let mut fx = fixture(false);
        fx.feed(TransportEvent::PublishAck { request_id: 7 });
        assert_eq!(fx.notifications.try_recv().unwrap(), Notification::Published(7));
    }

    #[test]
    fn deleted_messages_are_reported_only_when_enabled() {
        let mut quiet = fixture(false);
        quiet.feed(TransportEvent::MessageDeleted { request_id: 3 });
        assert!(quiet.notifications.try_recv().is_err());

        let mut loud = fixture(true);
        loud.feed(TransportEvent::MessageDeleted { request_id: 3 });
        assert_eq!(loud.notifications.try_recv().unwrap(), Notification::MessageDeleted(3));
    }

    #[test]
    fn fragmented_data_is_delivered_once_complete() {
        let mut fx = fixture(false);
        let h = MessageHandler::new(|_| {});
        fx.table.subscribe("cfg", h, QoS::AtMostOnce, &mut fx.wire).unwrap();

        assert!(fx
            .feed(TransportEvent::Data(DataChunk::first("cfg", b"abc".to_vec(), 6)))
            .is_none());
        let delivery = fx
            .feed(TransportEvent::Data(DataChunk::continuation(b"def".to_vec(), 3, 6)))
            .unwrap();

        assert_eq!(delivery.message.topic, "cfg");
        assert_eq!(delivery.message.payload, b"abcdef");
        assert_eq!(delivery.handlers.len(), 1);
        assert_eq!(fx.status.borrow().messages_received, 1);
    }

    #[test]
    fn orphan_chunk_and_errors_change_nothing() {
        let mut fx = fixture(false);
        assert!(fx
            .feed(TransportEvent::Data(DataChunk::continuation(b"x".to_vec(), 1, 2)))
            .is_none());
        fx.feed(TransportEvent::Error("tls handshake failed".into()));
        fx.feed(TransportEvent::UnsubscribeAck { request_id: 4 });

        assert!(fx.notifications.try_recv().is_err());
        assert_eq!(fx.status.borrow().error_messages, vec!["tls handshake failed".to_string()]);
    }
}
