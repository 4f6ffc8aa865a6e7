use super::transport::RequestId;
use chrono::{DateTime, Local};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const PREVIEW_LEN: usize = 32;

/// A complete publish received from the broker
#[derive(Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Local>,
}

impl InboundMessage {
    pub fn new(topic: String, payload: Vec<u8>) -> Self {
        InboundMessage {
            topic,
            payload,
            received_at: Local::now(),
        }
    }

    /// Payload as text, lossy for non UTF-8 bytes
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = self.payload_str();
        let preview: String = text.chars().take(PREVIEW_LEN).collect();
        write!(
            f,
            "{} - {} ({} bytes): {}",
            self.received_at.format("%H:%M:%S%.3f"),
            self.topic,
            self.payload.len(),
            preview
        )
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("topic", &self.topic)
            .field("payload_len", &self.payload.len())
            .field("received_at", &self.received_at)
            .finish()
    }
}

/// Callback registered for a topic.
///
/// Identity is the shared allocation: clones of one handler are the same
/// registration, two handlers built from identical closures are not. State the
/// callback needs travels inside the closure.
#[derive(Clone)]
pub struct MessageHandler {
    callback: Arc<dyn Fn(&InboundMessage) + Send + Sync>,
}

impl MessageHandler {
    pub fn new(callback: impl Fn(&InboundMessage) + Send + Sync + 'static) -> Self {
        Self {
            callback: Arc::new(callback),
        }
    }

    pub fn same_as(&self, other: &MessageHandler) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.callback), Arc::as_ptr(&other.callback))
    }

    pub fn call(&self, message: &InboundMessage) {
        (self.callback)(message)
    }
}

impl fmt::Debug for MessageHandler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MessageHandler({:p})", Arc::as_ptr(&self.callback) as *const ())
    }
}

/// Outward notifications for the rest of the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    Connected,
    Disconnected,
    Published(RequestId),
    MessageDeleted(RequestId),
}

/// Non-blocking sender side of the notification stream.
///
/// Notifications are emitted while the session lock is held, so a full
/// channel drops the notification instead of waiting.
#[derive(Clone, Debug)]
pub struct NotificationSender {
    sender: mpsc::Sender<Notification>,
}

impl NotificationSender {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    pub fn emit(&self, notification: Notification) {
        match self.sender.try_send(notification) {
            Ok(_) => debug!("Notification emitted: {:?}", notification),
            Err(mpsc::error::TrySendError::Full(n)) => {
                warn!("Notification channel full, dropping {:?}", n)
            }
            Err(mpsc::error::TrySendError::Closed(n)) => {
                debug!("No notification listener, dropping {:?}", n)
            }
        }
    }
}

/// Matched handlers for one message, run after the session lock is released
#[derive(Debug)]
pub struct Delivery {
    pub message: InboundMessage,
    pub handlers: Vec<MessageHandler>,
}

impl Delivery {
    pub fn deliver(self) -> usize {
        for handler in &self.handlers {
            handler.call(&self.message);
        }
        self.handlers.len()
    }
}
