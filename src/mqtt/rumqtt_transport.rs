//! [`Transport`] over the `rumqttc` async client.
//!
//! rumqttc assigns packet ids only when a request actually leaves the event
//! loop, while the session needs an id at request time. Every request therefore
//! gets a local [`RequestId`] that is queued per packet kind; the matching
//! `Outgoing` event binds it to the packet id, and the broker's ack resolves
//! it again.
//!
//! ```text
//! subscribe() ──► ledger.enqueue ──► try_subscribe
//!                                         │
//! EventPump ◄── Outgoing::Subscribe(pkid) ┘  bind(pkid)
//!     ◄──────── Incoming::SubAck(pkid)       resolve(pkid) ──► SubscribeAck{request_id}
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rumqttc::{
    AsyncClient, ClientError, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet,
    SubscribeReasonCode, TlsConfiguration,
};
use statum::{machine, state};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{ConnectionParams, SessionSettings};
use super::transport::{DataChunk, EventSink, RequestId, Transport, TransportError, TransportEvent};
use super::QoS;

/// ALPN protocol for MQTT over port 443
pub const ALPN_PROTOCOL: &[u8] = b"x-amzn-mqtt-ca";

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

impl From<ClientError> for TransportError {
    fn from(e: ClientError) -> Self {
        TransportError::Rejected(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketKind {
    Subscribe,
    Unsubscribe,
    Publish,
}

#[derive(Debug, Default)]
struct Lane {
    queued: VecDeque<RequestId>,
    in_flight: HashMap<u16, RequestId>,
}

/// Maps local request ids to rumqttc packet ids
#[derive(Debug, Default)]
struct RequestLedger {
    last_id: RequestId,
    subscribe: Lane,
    unsubscribe: Lane,
    publish: Lane,
}

impl RequestLedger {
    fn lane(&mut self, kind: PacketKind) -> &mut Lane {
        match kind {
            PacketKind::Subscribe => &mut self.subscribe,
            PacketKind::Unsubscribe => &mut self.unsubscribe,
            PacketKind::Publish => &mut self.publish,
        }
    }

    fn enqueue(&mut self, kind: PacketKind) -> RequestId {
        self.last_id = self.last_id.wrapping_add(1).max(1);
        let id = self.last_id;
        self.lane(kind).queued.push_back(id);
        id
    }

    /// Take back a request the client refused to queue
    fn cancel(&mut self, kind: PacketKind, id: RequestId) {
        self.lane(kind).queued.retain(|&queued| queued != id);
    }

    /// A packet of `kind` went out. Packet id 0 (QoS 0 publish) expects no
    /// ack, a packet id already in flight is a retransmission.
    fn bind(&mut self, kind: PacketKind, pkid: u16) -> Option<RequestId> {
        let lane = self.lane(kind);
        if pkid != 0 && lane.in_flight.contains_key(&pkid) {
            return None;
        }
        let id = lane.queued.pop_front()?;
        if pkid != 0 {
            lane.in_flight.insert(pkid, id);
        }
        Some(id)
    }

    fn resolve(&mut self, kind: PacketKind, pkid: u16) -> Option<RequestId> {
        self.lane(kind).in_flight.remove(&pkid)
    }

    /// Subscribe and unsubscribe packets are not replayed after a reconnect
    fn forget_control_packets(&mut self) {
        self.subscribe.in_flight.clear();
        self.unsubscribe.in_flight.clear();
    }
}

type SharedLedger = Arc<Mutex<RequestLedger>>;

fn lock_ledger(ledger: &Mutex<RequestLedger>) -> MutexGuard<'_, RequestLedger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

fn tls_transport(params: &ConnectionParams) -> Result<rumqttc::Transport, TransportError> {
    let alpn = params.use_alpn.then(|| vec![ALPN_PROTOCOL.to_vec()]);
    let client_auth = match (&params.client_cert, &params.client_key) {
        (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
        _ => None,
    };

    match &params.server_cert {
        Some(ca) => Ok(rumqttc::Transport::tls_with_config(TlsConfiguration::Simple {
            ca: ca.clone(),
            alpn,
            client_auth,
        })),
        None if client_auth.is_none() && alpn.is_none() => {
            Ok(rumqttc::Transport::tls_with_default_config())
        }
        None => Err(TransportError::Failure(
            "client certificates and ALPN need a server CA certificate".into(),
        )),
    }
}

pub fn mqtt_options(params: &ConnectionParams) -> Result<MqttOptions, TransportError> {
    let mut options = MqttOptions::new(params.client_id.clone(), params.host.clone(), params.port);
    options
        .set_keep_alive(Duration::from_secs(params.keep_alive_secs))
        .set_clean_session(params.clean_session)
        .set_transport(tls_transport(params)?);
    if let Some(username) = &params.username {
        options.set_credentials(username.clone(), params.password.clone().unwrap_or_default());
    }
    if params.use_alpn && params.port != 443 {
        warn!("ALPN requested on port {}, brokers expect it on 443", params.port);
    }
    Ok(options)
}

#[state]
#[derive(Debug, Clone)]
pub enum PumpState {
    Idle,
    Pumping,
}

/// Drives the rumqttc event loop and reports its events to the session.
///
/// Each `start` gets its own pump with its own ledger and connection flag.
/// Once `retired` fires the pump may keep polling to flush a DISCONNECT, but
/// nothing it sees reaches the session anymore.
#[machine]
pub struct EventPump<S: PumpState> {
    eventloop: EventLoop,
    ledger: SharedLedger,
    sink: EventSink,
    cancel: CancellationToken,
    retired: CancellationToken,
    connected: Arc<AtomicBool>,
    retry_delay: Duration,
}

impl EventPump<Idle> {
    fn create(
        eventloop: EventLoop,
        ledger: SharedLedger,
        sink: EventSink,
        cancel: CancellationToken,
        retired: CancellationToken,
        connected: Arc<AtomicBool>,
    ) -> Self {
        Self::new(
            eventloop,
            ledger,
            sink,
            cancel,
            retired,
            connected,
            INITIAL_RETRY_DELAY,
        )
    }

    fn arm(self) -> EventPump<Pumping> {
        debug!("MQTT event pump armed");
        self.transition()
    }
}

impl EventPump<Pumping> {
    async fn run(mut self) {
        let cancel = self.cancel.clone();
        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = self.eventloop.poll() => polled,
            };

            match polled {
                Ok(event) => {
                    if !self.on_event(event) {
                        break;
                    }
                }
                Err(e) => {
                    self.on_connection_error(e);
                    let delay = self.retry_delay;
                    self.retry_delay = (self.retry_delay * 2).min(MAX_RETRY_DELAY);
                    warn!("Retrying MQTT connection in {:?}", delay);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.finish();
        info!("MQTT event pump stopped");
    }

    fn finish(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.emit(TransportEvent::Disconnected);
        }
    }

    fn emit(&self, event: TransportEvent) {
        if self.retired.is_cancelled() {
            debug!("Client stopped, dropping {:?}", event);
            return;
        }
        self.sink.deliver(event);
    }

    fn ledger(&self) -> MutexGuard<'_, RequestLedger> {
        lock_ledger(&self.ledger)
    }

    /// Returns `false` once the client has sent its DISCONNECT
    fn on_event(&mut self, event: Event) -> bool {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                info!(
                    "Connected to MQTT broker (session present: {})",
                    ack.session_present
                );
                self.retry_delay = INITIAL_RETRY_DELAY;
                self.ledger().forget_control_packets();
                self.connected.store(true, Ordering::SeqCst);
                self.emit(TransportEvent::Connected);
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                let resolved = self.ledger().resolve(PacketKind::Subscribe, ack.pkid);
                let rejected = ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                match resolved {
                    Some(request_id) if rejected => {
                        self.emit(TransportEvent::Error(format!(
                            "subscribe request {} rejected by broker",
                            request_id
                        )));
                    }
                    Some(request_id) => {
                        self.emit(TransportEvent::SubscribeAck { request_id });
                    }
                    None => debug!("SUBACK for unknown packet id {}", ack.pkid),
                }
            }
            Event::Incoming(Packet::UnsubAck(ack)) => {
                match self.ledger().resolve(PacketKind::Unsubscribe, ack.pkid) {
                    Some(request_id) => {
                        self.emit(TransportEvent::UnsubscribeAck { request_id })
                    }
                    None => debug!("UNSUBACK for unknown packet id {}", ack.pkid),
                }
            }
            Event::Incoming(Packet::PubAck(rumqttc::PubAck { pkid, .. }))
            | Event::Incoming(Packet::PubComp(rumqttc::PubComp { pkid, .. })) => {
                match self.ledger().resolve(PacketKind::Publish, pkid) {
                    Some(request_id) => self.emit(TransportEvent::PublishAck { request_id }),
                    None => debug!("Publish ack for unknown packet id {}", pkid),
                }
            }
            Event::Incoming(Packet::Publish(publish)) => {
                debug!(
                    "Received publish on {} ({} bytes)",
                    publish.topic,
                    publish.payload.len()
                );
                self.emit(TransportEvent::Data(DataChunk::complete(
                    publish.topic,
                    publish.payload.to_vec(),
                )));
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Broker sent DISCONNECT");
            }
            Event::Outgoing(Outgoing::Subscribe(pkid)) => self.bind(PacketKind::Subscribe, pkid),
            Event::Outgoing(Outgoing::Unsubscribe(pkid)) => {
                self.bind(PacketKind::Unsubscribe, pkid)
            }
            Event::Outgoing(Outgoing::Publish(pkid)) => self.bind(PacketKind::Publish, pkid),
            Event::Outgoing(Outgoing::Disconnect) => {
                info!("Sent MQTT Disconnect packet to server");
                return false;
            }
            Event::Incoming(Packet::PingResp) | Event::Outgoing(Outgoing::PingReq) => {}
            other => debug!("MQTT event: {:?}", other),
        }
        true
    }

    fn bind(&self, kind: PacketKind, pkid: u16) {
        match self.ledger().bind(kind, pkid) {
            Some(request_id) => debug!("{:?} msg_id={} sent as packet {}", kind, request_id, pkid),
            None if pkid != 0 => debug!("{:?} packet {} retransmitted", kind, pkid),
            None => debug!("{:?} packet sent without a queued request", kind),
        }
    }

    fn on_connection_error(&mut self, e: ConnectionError) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.emit(TransportEvent::Disconnected);
        }
        error!("MQTT connection error: {}", e);
        self.emit(TransportEvent::Error(e.to_string()));
    }
}

/// State owned by one `start`, dropped again by `stop`
struct Running {
    client: AsyncClient,
    ledger: SharedLedger,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    retired: CancellationToken,
}

/// Transport backed by `rumqttc::AsyncClient`.
///
/// `start` needs a running tokio runtime; the event loop lives in a task
/// spawned on it.
pub struct RumqttTransport {
    options: MqttOptions,
    capacity: usize,
    running: Option<Running>,
}

impl RumqttTransport {
    pub fn new(params: &ConnectionParams, settings: &SessionSettings) -> Result<Self, TransportError> {
        Ok(Self {
            options: mqtt_options(params)?,
            capacity: settings.request_capacity().max(1),
            running: None,
        })
    }

    pub fn is_started(&self) -> bool {
        self.running.is_some()
    }

    /// Queue a request id, run `send`, and take the id back if it fails
    fn request(
        &self,
        kind: PacketKind,
        send: impl FnOnce(&AsyncClient) -> Result<(), ClientError>,
    ) -> Result<RequestId, TransportError> {
        let running = self.running.as_ref().ok_or(TransportError::NotStarted)?;
        let mut ledger = lock_ledger(&running.ledger);
        let request_id = ledger.enqueue(kind);
        if let Err(e) = send(&running.client) {
            ledger.cancel(kind, request_id);
            return Err(e.into());
        }
        Ok(request_id)
    }
}

impl Transport for RumqttTransport {
    fn start(&mut self, sink: EventSink) -> Result<(), TransportError> {
        if self.running.is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Failure(format!("no tokio runtime: {}", e)))?;

        let (client, eventloop) = AsyncClient::new(self.options.clone(), self.capacity);
        let running = Running {
            client,
            ledger: SharedLedger::default(),
            connected: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            retired: CancellationToken::new(),
        };

        let pump = EventPump::create(
            eventloop,
            running.ledger.clone(),
            sink,
            running.cancel.clone(),
            running.retired.clone(),
            running.connected.clone(),
        );
        let task_handle = runtime.spawn(async move {
            pump.arm().run().await;
        });
        debug!("MQTT event pump spawned: {:?}", task_handle);

        let (host, port) = self.options.broker_address();
        info!("MQTT client started for {}:{}", host, port);
        self.running = Some(running);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        let Some(running) = self.running.take() else {
            debug!("MQTT client not running, nothing to stop");
            return Ok(());
        };
        running.retired.cancel();

        if running.connected.load(Ordering::SeqCst) {
            match running.client.try_disconnect() {
                Ok(_) => debug!("DISCONNECT queued"),
                Err(e) => {
                    warn!("Could not queue DISCONNECT, cancelling event pump: {}", e);
                    running.cancel.cancel();
                }
            }
        } else {
            running.cancel.cancel();
        }
        info!("MQTT client stopped");
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> Result<RequestId, TransportError> {
        self.request(PacketKind::Publish, |client| {
            client.try_publish(topic, qos.into(), false, payload.to_vec())
        })
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<RequestId, TransportError> {
        self.request(PacketKind::Subscribe, |client| {
            client.try_subscribe(topic, qos.into())
        })
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<RequestId, TransportError> {
        self.request(PacketKind::Unsubscribe, |client| client.try_unsubscribe(topic))
    }
}

impl Drop for RumqttTransport {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.retired.cancel();
            running.cancel.cancel();
        }
    }
}
