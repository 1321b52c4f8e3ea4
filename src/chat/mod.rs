//! Chat session boundary.
//!
//! Each device worker owns one [`ChatSession`]. The worker only needs the
//! operations below; the protocol binding behind them is supplied through a
//! [`ChatConnector`] at startup: [`xmpp::XmppConnector`] in production,
//! [`console::ConsoleConnector`] for local runs.

pub mod console;
pub mod xmpp;

use std::time::Duration;

use async_trait::async_trait;

use crate::config::DeviceConfig;

/// Session lifecycle events the worker reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// A chat message.
    Message {
        /// Sender address exactly as the server reported it.
        from: String,
        /// Message text.
        body: String,
    },
    /// A presence update from a contact.
    Presence {
        /// Sender address.
        from: String,
        /// Status text, if any.
        status: Option<String>,
    },
    /// The session is authenticated and ready.
    SessionStart,
    /// The remote side closed the stream.
    StreamEnd,
}

/// Errors produced by chat sessions.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Could not establish the session.
    #[error("failed to connect: {0}")]
    Connect(String),
    /// The session is gone.
    #[error("session closed")]
    Closed,
    /// Sending a stanza failed.
    #[error("send failed: {0}")]
    Send(String),
    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One authenticated chat identity.
#[async_trait]
pub trait ChatSession: Send {
    /// Wait up to `timeout` for events and return everything that arrived.
    /// An empty vector means the wait timed out.
    async fn wait_events(&mut self, timeout: Duration) -> Result<Vec<ChatEvent>, ChatError>;

    /// Send a chat message, optionally with a subject line.
    async fn send_message(
        &mut self,
        to: &str,
        body: &str,
        subject: Option<&str>,
    ) -> Result<(), ChatError>;

    /// Publish our presence status text.
    async fn set_presence(&mut self, status: &str) -> Result<(), ChatError>;

    /// Fetch the roster.
    async fn fetch_roster(&mut self) -> Result<(), ChatError>;

    /// Toggle automatic acceptance of subscription requests.
    async fn auto_subscribe(&mut self, enabled: bool) -> Result<(), ChatError>;

    /// Close the session cleanly.
    async fn disconnect(&mut self) -> Result<(), ChatError>;
}

/// Opens chat sessions for devices.
#[async_trait]
pub trait ChatConnector: Send + Sync {
    /// Establish the session for `device_id`. Credentials are already
    /// validated by the caller.
    async fn connect(
        &self,
        device_id: &str,
        device: &DeviceConfig,
    ) -> Result<Box<dyn ChatSession>, ChatError>;
}

/// Strip the resource part of an address (`user@host/res` -> `user@host`).
pub fn bare_address(address: &str) -> &str {
    address.split('/').next().unwrap_or(address)
}
