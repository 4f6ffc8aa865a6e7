//! Contract of the wire client the session drives.
//!
//! The session never speaks MQTT itself. It asks a [`Transport`] to start,
//! stop, subscribe, unsubscribe and publish, and gets every outcome back later
//! as a [`TransportEvent`] through the [`EventSink`] handed over in `start`.
//! All requests are fire-and-forget: they either fail right away or return
//! the id under which their acknowledgment will show up.

use super::QoS;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Id assigned by the transport to a subscribe, unsubscribe or publish request
pub type RequestId = u32;

/// Failures reported synchronously by a transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport not started")]
    NotStarted,

    #[error("transport already started")]
    AlreadyStarted,

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("transport failure: {0}")]
    Failure(String),
}

/// One piece of an inbound publish.
///
/// `topic` is only present on the first chunk of a message; continuation
/// chunks carry `None` and an `offset` into the full payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk {
    pub topic: Option<String>,
    pub payload: Vec<u8>,
    pub offset: usize,
    pub total_len: usize,
}

impl DataChunk {
    /// A message that arrived in one piece
    pub fn complete(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        let payload = payload.into();
        Self {
            topic: Some(topic.into()),
            total_len: payload.len(),
            payload,
            offset: 0,
        }
    }

    /// First chunk of a message spread over several events
    pub fn first(topic: impl Into<String>, payload: impl Into<Vec<u8>>, total_len: usize) -> Self {
        Self {
            topic: Some(topic.into()),
            payload: payload.into(),
            offset: 0,
            total_len,
        }
    }

    /// Follow-up chunk at `offset`
    pub fn continuation(payload: impl Into<Vec<u8>>, offset: usize, total_len: usize) -> Self {
        Self {
            topic: None,
            payload: payload.into(),
            offset,
            total_len,
        }
    }
}

/// Everything a transport reports back to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    SubscribeAck { request_id: RequestId },
    UnsubscribeAck { request_id: RequestId },
    PublishAck { request_id: RequestId },
    /// Broker-side eviction of a stored message
    MessageDeleted { request_id: RequestId },
    Data(DataChunk),
    Error(String),
}

/// Callback sink a transport pushes its events into.
///
/// Events must be delivered one at a time; the session relies on a serialized
/// event stream.
#[derive(Clone)]
pub struct EventSink {
    deliver: Arc<dyn Fn(TransportEvent) + Send + Sync>,
}

impl EventSink {
    pub fn new(deliver: impl Fn(TransportEvent) + Send + Sync + 'static) -> Self {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    pub fn deliver(&self, event: TransportEvent) {
        (self.deliver)(event)
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventSink").finish_non_exhaustive()
    }
}

/// The wire-level MQTT client collaborator
pub trait Transport: Send {
    /// Start connecting; events flow into `sink` from now on.
    ///
    /// The sink must not be called from inside any of the request methods,
    /// the session holds its lock while it calls them.
    fn start(&mut self, sink: EventSink) -> Result<(), TransportError>;

    /// Stop the connection; no further events are expected afterwards
    fn stop(&mut self) -> Result<(), TransportError>;

    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS)
        -> Result<RequestId, TransportError>;

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<RequestId, TransportError>;

    fn unsubscribe(&mut self, topic: &str) -> Result<RequestId, TransportError>;
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    //! Recording transport for session tests

    use super::*;
    use std::sync::{Mutex, MutexGuard, PoisonError};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum WireCall {
        Start,
        Stop,
        Subscribe(String, QoS),
        Unsubscribe(String),
        Publish(String, Vec<u8>, QoS),
    }

    #[derive(Debug, Default)]
    struct MockState {
        calls: Vec<WireCall>,
        subscribe_ids: Vec<RequestId>,
        sink: Option<EventSink>,
        refuse_subscribes: bool,
        refuse_unsubscribes: bool,
        last_id: RequestId,
    }

    /// Records every wire call. Clones share the same recording, so a test
    /// keeps one clone while the session owns the other.
    #[derive(Debug, Clone, Default)]
    pub struct MockTransport {
        state: Arc<Mutex<MockState>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        fn state(&self) -> MutexGuard<'_, MockState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        pub fn calls(&self) -> Vec<WireCall> {
            self.state().calls.clone()
        }

        pub fn clear_calls(&self) {
            let mut state = self.state();
            state.calls.clear();
            state.subscribe_ids.clear();
        }

        pub fn subscribes(&self) -> Vec<(String, QoS)> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    WireCall::Subscribe(topic, qos) => Some((topic, qos)),
                    _ => None,
                })
                .collect()
        }

        pub fn unsubscribes(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    WireCall::Unsubscribe(topic) => Some(topic),
                    _ => None,
                })
                .collect()
        }

        /// Ids handed out for accepted subscribes, oldest first
        pub fn subscribe_ids(&self) -> Vec<RequestId> {
            self.state().subscribe_ids.clone()
        }

        pub fn refuse_subscribes(&self, refuse: bool) {
            self.state().refuse_subscribes = refuse;
        }

        pub fn refuse_unsubscribes(&self, refuse: bool) {
            self.state().refuse_unsubscribes = refuse;
        }

        pub fn is_started(&self) -> bool {
            self.state().sink.is_some()
        }

        /// The sink handed over by the last `start`
        pub fn sink(&self) -> Option<EventSink> {
            self.state().sink.clone()
        }

        /// Push an event into the session the way a running client would.
        ///
        /// The sink is cloned out first; delivering re-enters the transport.
        pub fn emit(&self, event: TransportEvent) {
            match self.sink() {
                Some(sink) => sink.deliver(event),
                None => panic!("event {:?} emitted before start", event),
            }
        }

        fn next_id(state: &mut MockState) -> RequestId {
            state.last_id += 1;
            state.last_id
        }
    }

    impl Transport for MockTransport {
        fn start(&mut self, sink: EventSink) -> Result<(), TransportError> {
            let mut state = self.state();
            state.calls.push(WireCall::Start);
            state.sink = Some(sink);
            Ok(())
        }

        fn stop(&mut self) -> Result<(), TransportError> {
            let mut state = self.state();
            state.calls.push(WireCall::Stop);
            state.sink = None;
            Ok(())
        }

        fn publish(
            &mut self,
            topic: &str,
            payload: &[u8],
            qos: QoS,
        ) -> Result<RequestId, TransportError> {
            let mut state = self.state();
            state
                .calls
                .push(WireCall::Publish(topic.to_string(), payload.to_vec(), qos));
            Ok(Self::next_id(&mut state))
        }

        fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<RequestId, TransportError> {
            let mut state = self.state();
            state.calls.push(WireCall::Subscribe(topic.to_string(), qos));
            if state.refuse_subscribes {
                return Err(TransportError::Rejected("subscribe refused".into()));
            }
            let id = Self::next_id(&mut state);
            state.subscribe_ids.push(id);
            Ok(id)
        }

        fn unsubscribe(&mut self, topic: &str) -> Result<RequestId, TransportError> {
            let mut state = self.state();
            state.calls.push(WireCall::Unsubscribe(topic.to_string()));
            if state.refuse_unsubscribes {
                return Err(TransportError::Rejected("unsubscribe refused".into()));
            }
            Ok(Self::next_id(&mut state))
        }
    }
}
