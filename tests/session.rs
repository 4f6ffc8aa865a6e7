use mqtt_session::mqtt::{
    ConnectionParams, DataChunk, MessageHandler, MqttHandler, Notification, QoS, SessionError,
    SessionSettings, SubscriptionState, TransportEvent,
};
use mqtt_session::mqtt::transport::testing::{MockTransport, WireCall};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

struct Harness {
    session: MqttHandler<MockTransport>,
    wire: MockTransport,
    notifications: mpsc::Receiver<Notification>,
}

impl Harness {
    fn with_settings(settings: SessionSettings) -> Self {
        let (session, notifications) = MqttHandler::new(settings);
        let wire = MockTransport::new();
        let params = ConnectionParams::new("broker.local", "node-1")
            .with_client_identity(b"cert".to_vec(), b"key".to_vec());
        session.init(params, wire.clone()).unwrap();
        session.connect().unwrap();
        wire.emit(TransportEvent::Connected);
        Self {
            session,
            wire,
            notifications,
        }
    }

    fn connected() -> Self {
        Self::with_settings(SessionSettings::default())
    }

    fn states(&self) -> Vec<SubscriptionState> {
        self.session
            .subscriptions()
            .into_iter()
            .map(|info| info.state)
            .collect()
    }

    fn drain(&mut self) -> Vec<Notification> {
        let mut seen = Vec::new();
        while let Ok(notification) = self.notifications.try_recv() {
            seen.push(notification);
        }
        seen
    }
}

fn collector() -> (MessageHandler, Arc<Mutex<Vec<Vec<u8>>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let handler = MessageHandler::new(move |message| {
        sink.lock().unwrap().push(message.payload.clone());
    });
    (handler, received)
}

#[test]
fn repeated_subscribe_keeps_one_entry_at_highest_qos() {
    let h = Harness::connected();
    let x = MessageHandler::new(|_| {});

    for qos in [QoS::AtLeastOnce, QoS::AtMostOnce, QoS::ExactlyOnce, QoS::AtLeastOnce] {
        h.session.subscribe("sensors/t", x.clone(), qos).unwrap();
    }

    let entries = h.session.subscriptions();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].qos, QoS::ExactlyOnce);
}

#[test]
fn shared_topic_has_one_outstanding_request_at_max_qos() {
    let h = Harness::connected();
    let handlers: Vec<MessageHandler> = (0..3).map(|_| MessageHandler::new(|_| {})).collect();

    h.session.subscribe("t", handlers[0].clone(), QoS::AtLeastOnce).unwrap();
    h.session.subscribe("t", handlers[1].clone(), QoS::AtMostOnce).unwrap();
    h.session.subscribe("t", handlers[2].clone(), QoS::ExactlyOnce).unwrap();

    assert_eq!(
        h.wire.subscribes(),
        vec![("t".to_string(), QoS::AtLeastOnce), ("t".to_string(), QoS::ExactlyOnce)]
    );
    let latest = h.wire.subscribe_ids().last().copied();
    for entry in h.session.subscriptions() {
        assert_eq!(entry.state, SubscriptionState::Requested);
        assert_eq!(entry.pending_request, latest);
    }
}

#[test]
fn handler_joining_acknowledged_topic_sends_nothing() {
    let h = Harness::connected();
    h.session
        .subscribe("t", MessageHandler::new(|_| {}), QoS::AtLeastOnce)
        .unwrap();
    let id = h.wire.subscribe_ids()[0];
    h.wire.emit(TransportEvent::SubscribeAck { request_id: id });

    h.session
        .subscribe("t", MessageHandler::new(|_| {}), QoS::AtMostOnce)
        .unwrap();

    assert_eq!(h.wire.subscribes().len(), 1);
    assert_eq!(h.states(), vec![SubscriptionState::Acknowledged; 2]);
}

#[test]
fn connected_rerequests_every_registration() {
    let h = Harness::connected();
    let a = MessageHandler::new(|_| {});
    let b1 = MessageHandler::new(|_| {});
    let b2 = MessageHandler::new(|_| {});
    h.session.subscribe("a", a, QoS::AtMostOnce).unwrap();
    h.session.subscribe("b", b1, QoS::AtLeastOnce).unwrap();
    h.session.subscribe("b", b2, QoS::AtMostOnce).unwrap();
    let first = h.wire.subscribe_ids()[0];
    h.wire.emit(TransportEvent::SubscribeAck { request_id: first });

    h.wire.clear_calls();
    h.wire.emit(TransportEvent::Connected);

    assert_eq!(h.session.subscription_count(), 3);
    assert_eq!(h.states(), vec![SubscriptionState::Requested; 3]);
    assert_eq!(
        h.wire.subscribes(),
        vec![("a".to_string(), QoS::AtMostOnce), ("b".to_string(), QoS::AtLeastOnce)]
    );
}

#[test]
fn refused_resubscribe_leaves_entries_failed_not_lost() {
    let h = Harness::connected();
    h.session
        .subscribe("a", MessageHandler::new(|_| {}), QoS::AtMostOnce)
        .unwrap();

    h.wire.refuse_subscribes(true);
    h.wire.emit(TransportEvent::Connected);
    assert_eq!(h.states(), vec![SubscriptionState::Failed]);

    h.wire.refuse_subscribes(false);
    h.wire.emit(TransportEvent::Connected);
    assert_eq!(h.states(), vec![SubscriptionState::Requested]);
}

#[test]
fn subscribe_failure_is_not_an_error() {
    let h = Harness::connected();
    h.wire.refuse_subscribes(true);
    assert!(h
        .session
        .subscribe("a", MessageHandler::new(|_| {}), QoS::AtLeastOnce)
        .is_ok());
    assert_eq!(h.states(), vec![SubscriptionState::Failed]);
}

#[test]
fn chunked_message_reaches_handler_once() {
    let h = Harness::connected();
    let (handler, received) = collector();
    h.session.subscribe("ota/blob", handler, QoS::AtMostOnce).unwrap();

    let body = b"0123456789abcdef".to_vec();
    h.wire.emit(TransportEvent::Data(DataChunk::first(
        "ota/blob",
        body[..4].to_vec(),
        body.len(),
    )));
    h.wire.emit(TransportEvent::Data(DataChunk::continuation(
        body[4..10].to_vec(),
        4,
        body.len(),
    )));
    assert!(received.lock().unwrap().is_empty());
    h.wire.emit(TransportEvent::Data(DataChunk::continuation(
        body[10..].to_vec(),
        10,
        body.len(),
    )));

    assert_eq!(*received.lock().unwrap(), vec![body]);
}

#[test]
fn new_fragment_discards_incomplete_one() {
    let h = Harness::connected();
    let (handler, received) = collector();
    h.session.subscribe("t", handler, QoS::AtMostOnce).unwrap();

    h.wire
        .emit(TransportEvent::Data(DataChunk::first("t", b"abc".to_vec(), 10)));
    h.wire
        .emit(TransportEvent::Data(DataChunk::first("t", b"new".to_vec(), 5)));
    h.wire
        .emit(TransportEvent::Data(DataChunk::continuation(b"er".to_vec(), 3, 5)));
    // tail of the abandoned message has nowhere to go
    h.wire
        .emit(TransportEvent::Data(DataChunk::continuation(b"defg".to_vec(), 3, 10)));

    assert_eq!(*received.lock().unwrap(), vec![b"newer".to_vec()]);
}

#[test]
fn messages_are_delivered_before_suback() {
    let h = Harness::connected();
    let (handler, received) = collector();
    h.session.subscribe("t", handler, QoS::AtLeastOnce).unwrap();
    assert_eq!(h.states(), vec![SubscriptionState::Requested]);

    h.wire
        .emit(TransportEvent::Data(DataChunk::complete("t", b"early".to_vec())));
    assert_eq!(received.lock().unwrap().len(), 1);
}

#[test]
fn every_handler_of_a_topic_gets_the_message() {
    let h = Harness::connected();
    let (first, first_seen) = collector();
    let (second, second_seen) = collector();
    let (other, other_seen) = collector();
    h.session.subscribe("t", first, QoS::AtMostOnce).unwrap();
    h.session.subscribe("t", second, QoS::AtMostOnce).unwrap();
    h.session.subscribe("t/other", other, QoS::AtMostOnce).unwrap();

    h.wire
        .emit(TransportEvent::Data(DataChunk::complete("t", b"x".to_vec())));

    assert_eq!(first_seen.lock().unwrap().len(), 1);
    assert_eq!(second_seen.lock().unwrap().len(), 1);
    assert!(other_seen.lock().unwrap().is_empty());
}

#[test]
fn unsubscribe_sends_wire_request_only_for_last_handler() {
    let h = Harness::connected();
    let x = MessageHandler::new(|_| {});
    let y = MessageHandler::new(|_| {});
    h.session.subscribe("t", x.clone(), QoS::AtMostOnce).unwrap();
    h.session.subscribe("t", y, QoS::AtMostOnce).unwrap();

    h.session.unsubscribe_handler("t", &x).unwrap();
    assert_eq!(h.session.subscription_count(), 1);
    assert!(h.wire.unsubscribes().is_empty());

    h.session.unsubscribe("t").unwrap();
    assert_eq!(h.session.subscription_count(), 0);
    assert_eq!(h.wire.unsubscribes(), vec!["t".to_string()]);

    assert!(matches!(h.session.unsubscribe("t"), Err(SessionError::NotFound(_))));
}

#[test]
fn unsubscribe_matches_whole_topic_only() {
    let h = Harness::connected();
    h.session
        .subscribe("a/b", MessageHandler::new(|_| {}), QoS::AtMostOnce)
        .unwrap();

    assert!(matches!(h.session.unsubscribe("a"), Err(SessionError::NotFound(_))));
    assert!(matches!(h.session.unsubscribe("a/b/c"), Err(SessionError::NotFound(_))));
    assert_eq!(h.session.subscription_count(), 1);
}

#[test]
fn qos_escalation_on_shared_topic() {
    let h = Harness::connected();
    let x = MessageHandler::new(|_| {});
    let y = MessageHandler::new(|_| {});

    h.session.subscribe("a/b", x, QoS::AtMostOnce).unwrap();
    h.session.subscribe("a/b", y, QoS::AtLeastOnce).unwrap();

    assert_eq!(
        h.wire.subscribes(),
        vec![("a/b".to_string(), QoS::AtMostOnce), ("a/b".to_string(), QoS::AtLeastOnce)]
    );

    let ids = h.wire.subscribe_ids();
    h.wire.emit(TransportEvent::SubscribeAck { request_id: ids[0] });
    h.wire.emit(TransportEvent::SubscribeAck { request_id: ids[1] });

    assert_eq!(h.states(), vec![SubscriptionState::Acknowledged; 2]);
    let max_qos = h.session.subscriptions().iter().map(|e| e.qos).max();
    assert_eq!(max_qos, Some(QoS::AtLeastOnce));
}

#[test]
fn disconnect_then_connect_loses_nothing() {
    let mut h = Harness::connected();
    h.session
        .subscribe("a", MessageHandler::new(|_| {}), QoS::AtLeastOnce)
        .unwrap();
    h.session
        .subscribe("b", MessageHandler::new(|_| {}), QoS::AtMostOnce)
        .unwrap();
    for id in h.wire.subscribe_ids() {
        h.wire.emit(TransportEvent::SubscribeAck { request_id: id });
    }
    h.drain();
    h.wire.clear_calls();

    h.wire.emit(TransportEvent::Disconnected);
    assert_eq!(h.states(), vec![SubscriptionState::None; 2]);
    assert!(h.wire.calls().is_empty());

    h.wire.emit(TransportEvent::Connected);
    assert_eq!(h.states(), vec![SubscriptionState::Requested; 2]);
    assert!(h.wire.unsubscribes().is_empty());
    assert_eq!(h.wire.subscribes().len(), 2);
    assert_eq!(
        h.drain(),
        vec![Notification::Disconnected, Notification::Connected]
    );
}

#[test]
fn stale_suback_after_reconnect_is_ignored() {
    let h = Harness::connected();
    h.session
        .subscribe("a", MessageHandler::new(|_| {}), QoS::AtMostOnce)
        .unwrap();
    let before = h.wire.subscribe_ids()[0];

    h.wire.emit(TransportEvent::Disconnected);
    h.wire.emit(TransportEvent::Connected);
    h.wire.emit(TransportEvent::SubscribeAck { request_id: before });

    assert_eq!(h.states(), vec![SubscriptionState::Requested]);
}

#[test]
fn capacity_is_a_hard_limit() {
    let h = Harness::with_settings(SessionSettings {
        max_subscriptions: 2,
        ..SessionSettings::default()
    });
    h.session
        .subscribe("a", MessageHandler::new(|_| {}), QoS::AtMostOnce)
        .unwrap();
    h.session
        .subscribe("b", MessageHandler::new(|_| {}), QoS::AtMostOnce)
        .unwrap();

    let err = h
        .session
        .subscribe("c", MessageHandler::new(|_| {}), QoS::AtMostOnce)
        .unwrap_err();
    assert!(matches!(err, SessionError::CapacityExceeded { capacity: 2 }));

    h.session.unsubscribe("a").unwrap();
    assert!(h
        .session
        .subscribe("c", MessageHandler::new(|_| {}), QoS::AtMostOnce)
        .is_ok());
}

#[test]
fn publish_acks_and_deletions_become_notifications() {
    let mut h = Harness::with_settings(SessionSettings {
        report_deleted_messages: true,
        ..SessionSettings::default()
    });
    h.drain();

    let id = h.session.publish("status", b"online", QoS::AtLeastOnce).unwrap();
    h.wire.emit(TransportEvent::PublishAck { request_id: id });
    h.wire.emit(TransportEvent::MessageDeleted { request_id: 42 });

    assert_eq!(
        h.drain(),
        vec![Notification::Published(id), Notification::MessageDeleted(42)]
    );
    assert!(h
        .wire
        .calls()
        .contains(&WireCall::Publish("status".into(), b"online".to_vec(), QoS::AtLeastOnce)));
}

#[test]
fn deinit_unsubscribes_and_stops_once() {
    let h = Harness::connected();
    h.session
        .subscribe("a", MessageHandler::new(|_| {}), QoS::AtMostOnce)
        .unwrap();
    h.session
        .subscribe("a", MessageHandler::new(|_| {}), QoS::AtMostOnce)
        .unwrap();
    h.wire.clear_calls();

    h.session.deinit();
    h.session.deinit();

    assert_eq!(
        h.wire.calls(),
        vec![WireCall::Unsubscribe("a".into()), WireCall::Stop]
    );
    assert!(matches!(
        h.session.publish("a", b"x", QoS::AtMostOnce),
        Err(SessionError::NotInitialized)
    ));
}
