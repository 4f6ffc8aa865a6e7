use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Local;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::config::{ConnectionParams, SessionSettings};
use super::error::SessionError;
use super::event_translator::EventTranslator;
use super::message_manager::{MessageHandler, Notification, NotificationSender};
use super::subscription_table::{SubscriptionInfo, SubscriptionTable};
use super::transport::{EventSink, RequestId, Transport, TransportError, TransportEvent};
use super::QoS;

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Reconnecting,
}

#[derive(Clone, Debug, Default)]
pub struct MqttStatus {
    pub connection_state: ConnectionState,
    pub error_messages: Vec<String>,
    pub messages_received: usize,
    pub messages_published: usize,
    pub last_activity: Option<chrono::DateTime<chrono::Local>>,
}

/// Everything one init/deinit cycle owns
struct SessionCore<T: Transport> {
    params: ConnectionParams,
    table: SubscriptionTable,
    translator: EventTranslator,
    transport: T,
}

type SharedCore<T> = Arc<Mutex<Option<SessionCore<T>>>>;

fn lock_core<T: Transport>(core: &Mutex<Option<SessionCore<T>>>) -> MutexGuard<'_, Option<SessionCore<T>>> {
    core.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Feed one transport event through the translator, then run the matched
/// handlers with the lock released so they may call back into the session.
fn apply_event<T: Transport>(core: &Mutex<Option<SessionCore<T>>>, event: TransportEvent) {
    let delivery = {
        let mut guard = lock_core(core);
        let Some(session) = guard.as_mut() else {
            debug!("Session gone, dropping event {:?}", event);
            return;
        };
        let SessionCore {
            table,
            translator,
            transport,
            ..
        } = session;
        translator.handle(event, table, transport)
    };

    if let Some(delivery) = delivery {
        let handled = delivery.deliver();
        if handled == 0 {
            debug!("No handler registered for incoming message");
        }
    }
}

/// Session controller.
///
/// Owns the subscription table, the event translator and the transport of
/// one session between `init` and `deinit`. All of it sits behind a single
/// lock shared by caller operations and the transport's event stream.
pub struct MqttHandler<T: Transport + 'static> {
    settings: SessionSettings,
    core: SharedCore<T>,
    notifier: NotificationSender,
    status: Arc<watch::Sender<MqttStatus>>,
}

impl<T: Transport + 'static> Clone for MqttHandler<T> {
    fn clone(&self) -> Self {
        Self {
            settings: self.settings.clone(),
            core: self.core.clone(),
            notifier: self.notifier.clone(),
            status: self.status.clone(),
        }
    }
}

impl<T: Transport + 'static> MqttHandler<T> {
    pub fn new(settings: SessionSettings) -> (Self, mpsc::Receiver<Notification>) {
        let (notifier, notifications) = NotificationSender::channel(settings.notification_capacity);
        let (status, _) = watch::channel(MqttStatus::default());

        let handler = MqttHandler {
            settings,
            core: Arc::new(Mutex::new(None)),
            notifier,
            status: Arc::new(status),
        };
        (handler, notifications)
    }

    fn lock(&self) -> MutexGuard<'_, Option<SessionCore<T>>> {
        lock_core(&self.core)
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().is_some()
    }

    /// Watch the connection state and traffic counters
    pub fn status(&self) -> watch::Receiver<MqttStatus> {
        self.status.subscribe()
    }

    pub fn init(&self, params: ConnectionParams, transport: T) -> Result<(), SessionError> {
        let mut guard = self.lock();
        if guard.is_some() {
            warn!("MQTT session already initialized");
            return Err(SessionError::AlreadyInitialized);
        }
        params.validate()?;

        let table = SubscriptionTable::with_capacity(self.settings.max_subscriptions)?;
        let translator = EventTranslator::new(
            self.notifier.clone(),
            self.status.clone(),
            self.settings.report_deleted_messages,
        );
        info!(
            "MQTT session initialized for {}:{} as {} ({} subscription slots)",
            params.host,
            params.port,
            params.client_id,
            table.capacity()
        );
        *guard = Some(SessionCore {
            params,
            table,
            translator,
            transport,
        });
        self.status.send_replace(MqttStatus::default());
        Ok(())
    }

    fn event_sink(&self) -> EventSink {
        let core: Weak<Mutex<Option<SessionCore<T>>>> = Arc::downgrade(&self.core);
        EventSink::new(move |event| match core.upgrade() {
            Some(core) => apply_event(&core, event),
            None => debug!("Session dropped, ignoring transport event"),
        })
    }

    /// Start the transport. Subscriptions become live with the `Connected` event.
    pub fn connect(&self) -> Result<(), SessionError> {
        let sink = self.event_sink();
        let mut guard = self.lock();
        let session = guard.as_mut().ok_or(SessionError::NotInitialized)?;

        info!(
            "Connecting to MQTT broker {}:{}",
            session.params.host, session.params.port
        );
        if let Err(e) = session.transport.start(sink) {
            if e == TransportError::AlreadyStarted {
                warn!("MQTT client already running");
            } else {
                error!("Failed to start MQTT client: {}", e);
                self.status.send_modify(|status| {
                    status.connection_state = ConnectionState::Failed;
                    status.error_messages.push(e.to_string());
                });
            }
            return Err(e.into());
        }
        self.status.send_modify(|status| {
            if status.connection_state != ConnectionState::Connected {
                status.connection_state = ConnectionState::Connecting;
            }
        });
        Ok(())
    }

    /// Drop every subscription and stop the transport
    pub fn disconnect(&self) -> Result<(), SessionError> {
        let mut guard = self.lock();
        let session = guard.as_mut().ok_or(SessionError::NotInitialized)?;

        session.table.unsubscribe_all(&mut session.transport);
        self.status
            .send_modify(|status| status.connection_state = ConnectionState::Disconnected);
        session.transport.stop().map_err(|e| {
            error!("Failed to stop MQTT client: {}", e);
            SessionError::from(e)
        })?;
        info!("MQTT disconnected");
        Ok(())
    }

    /// Tear the session down. Calling it without a session is a no-op.
    pub fn deinit(&self) {
        let Some(mut session) = self.lock().take() else {
            debug!("MQTT session not initialized, nothing to deinit");
            return;
        };

        session.table.unsubscribe_all(&mut session.transport);
        if let Err(e) = session.transport.stop() {
            warn!("Error while stopping MQTT client: {}", e);
        }
        self.status
            .send_modify(|status| status.connection_state = ConnectionState::Disconnected);
        info!("MQTT session deinitialized");
    }

    pub fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<RequestId, SessionError> {
        let mut guard = self.lock();
        let session = guard.as_mut().ok_or(SessionError::NotInitialized)?;
        if topic.is_empty() {
            return Err(SessionError::InvalidArgument("topic must not be empty".into()));
        }

        let request_id = session.transport.publish(topic, payload, qos).map_err(|e| {
            error!("Failed to publish to {}: {}", topic, e);
            SessionError::from(e)
        })?;
        debug!(
            "Published {} bytes to {} (msg_id: {}, QoS: {})",
            payload.len(),
            topic,
            request_id,
            qos
        );
        self.status.send_modify(|status| {
            status.messages_published += 1;
            status.last_activity = Some(Local::now());
        });
        Ok(request_id)
    }

    pub fn subscribe(&self, topic: &str, handler: MessageHandler, qos: QoS) -> Result<(), SessionError> {
        let mut guard = self.lock();
        let session = guard.as_mut().ok_or(SessionError::NotInitialized)?;
        session
            .table
            .subscribe(topic, handler, qos, &mut session.transport)
    }

    /// Remove one registration of `topic`
    pub fn unsubscribe(&self, topic: &str) -> Result<(), SessionError> {
        let mut guard = self.lock();
        let session = guard.as_mut().ok_or(SessionError::NotInitialized)?;
        session.table.unsubscribe(topic, &mut session.transport)
    }

    /// Remove the registration of `handler` on `topic`
    pub fn unsubscribe_handler(&self, topic: &str, handler: &MessageHandler) -> Result<(), SessionError> {
        let mut guard = self.lock();
        let session = guard.as_mut().ok_or(SessionError::NotInitialized)?;
        session
            .table
            .unsubscribe_handler(topic, handler, &mut session.transport)
    }

    /// Entry point for transport events. Transports started through
    /// [`connect`](Self::connect) already feed this.
    pub fn handle_event(&self, event: TransportEvent) {
        apply_event(&self.core, event);
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.lock()
            .as_ref()
            .map(|session| session.table.subscriptions())
            .unwrap_or_default()
    }

    pub fn subscription_count(&self) -> usize {
        self.lock()
            .as_ref()
            .map(|session| session.table.len())
            .unwrap_or(0)
    }
}
