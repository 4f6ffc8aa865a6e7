use super::error::SessionError;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_TLS_PORT: u16 = 8883;
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 120;
pub const MIN_KEEP_ALIVE_SECS: u64 = 5;
pub const DEFAULT_MAX_SUBSCRIPTIONS: usize = 10;
/// Requests on top of a full resubscribe that the client channel must hold
pub const REQUEST_HEADROOM: usize = 10;

/// Broker endpoint and credentials for one session.
///
/// Certificates and keys are PEM bytes. Either a client certificate with its
/// key or a username is required.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub server_cert: Option<Vec<u8>>,
    pub client_cert: Option<Vec<u8>>,
    pub client_key: Option<Vec<u8>>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// `false` asks the broker to keep session state across reconnects
    pub clean_session: bool,
    /// Negotiate the `x-amzn-mqtt-ca` ALPN protocol (MQTT over port 443)
    pub use_alpn: bool,
}

impl ConnectionParams {
    pub fn new(host: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_TLS_PORT,
            client_id: client_id.into(),
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            server_cert: None,
            client_cert: None,
            client_key: None,
            username: None,
            password: None,
            clean_session: true,
            use_alpn: false,
        }
    }

    pub fn with_client_identity(mut self, cert: Vec<u8>, key: Vec<u8>) -> Self {
        self.client_cert = Some(cert);
        self.client_key = Some(key);
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: Option<String>) -> Self {
        self.username = Some(username.into());
        self.password = password;
        self
    }

    /// Check the mandatory fields before a session is built on them
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.host.trim().is_empty() {
            return Err(SessionError::InvalidParameters("broker host is empty".into()));
        }
        if self.client_id.trim().is_empty() {
            return Err(SessionError::InvalidParameters("client id is empty".into()));
        }
        if self.port == 0 {
            return Err(SessionError::InvalidParameters("broker port is 0".into()));
        }
        if self.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            return Err(SessionError::InvalidParameters(format!(
                "keepalive must be at least {} seconds, got {}",
                MIN_KEEP_ALIVE_SECS, self.keep_alive_secs
            )));
        }
        let has_identity = self.client_cert.is_some() && self.client_key.is_some();
        if self.client_cert.is_some() != self.client_key.is_some() {
            return Err(SessionError::InvalidParameters(
                "client certificate and key must be given together".into(),
            ));
        }
        if !has_identity && self.username.is_none() {
            return Err(SessionError::InvalidParameters(
                "either a client certificate/key pair or a username is required".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("server_cert", &self.server_cert.as_ref().map(Vec::len))
            .field("client_cert", &self.client_cert.as_ref().map(Vec::len))
            .field("client_key", &self.client_key.as_ref().map(|_| "<redacted>"))
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("clean_session", &self.clean_session)
            .field("use_alpn", &self.use_alpn)
            .finish()
    }
}

/// Tunables of the session layer
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct SessionSettings {
    /// Fixed number of (topic, handler) registrations
    pub max_subscriptions: usize,
    /// Buffer of the outward notification channel
    pub notification_capacity: usize,
    /// Forward broker evictions of stored messages as notifications
    pub report_deleted_messages: bool,
    /// Request buffer of the rumqttc client
    pub event_loop_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_subscriptions: DEFAULT_MAX_SUBSCRIPTIONS,
            notification_capacity: 100,
            report_deleted_messages: false,
            event_loop_capacity: 100,
        }
    }
}

impl SessionSettings {
    /// Size of the client request channel.
    ///
    /// A reconnect sends one subscribe per topic from the task that drains
    /// the channel, so it has to take every topic at once.
    pub fn request_capacity(&self) -> usize {
        self.event_loop_capacity
            .max(self.max_subscriptions.saturating_add(REQUEST_HEADROOM))
    }
}
