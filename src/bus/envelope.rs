//! Bus payloads.
//!
//! Every message on the bus is one [`Envelope`]. Envelopes are serialized to
//! JSON before they are queued so the bus can enforce its payload bound on
//! the encoded size.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity attached to a [`Envelope::LogRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Fine-grained diagnostics.
    Debug,
    /// Normal operational events.
    Info,
    /// Something unexpected that the unit recovered from.
    Warning,
    /// A failure the unit could not recover from.
    Error,
}

/// Instruction carried by [`Envelope::Control`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlCommand {
    /// Say goodbye, close the chat session and exit.
    Shutdown,
}

/// What a [`Envelope::ContactRequest`] asks the resolver to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContactQuery {
    /// Resolve one phone number to a directory entry.
    PhoneLookup {
        /// Normalized phone number.
        phone: String,
    },
    /// Free-text directory search.
    Search {
        /// Search text as typed by the user.
        query: String,
    },
}

/// A bus message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// An SMS received by a gateway device, addressed to that device's worker.
    InboundSms {
        /// Device identifier the SMS arrived on.
        device: String,
        /// Sender phone number.
        phone: String,
        /// Message text, already escaped for chat transport.
        body: String,
        /// Address the device reported from, when known.
        source_ip: Option<String>,
    },
    /// Lifecycle instruction for a device worker.
    Control {
        /// The instruction.
        command: ControlCommand,
    },
    /// A log line published by a unit for the log collector.
    LogRecord {
        /// Severity.
        level: LogLevel,
        /// When the unit produced the record.
        timestamp: DateTime<Utc>,
        /// Name of the unit that produced the record.
        unit: String,
        /// Message text.
        text: String,
    },
    /// A request to the contacts resolver.
    ContactRequest {
        /// Requester id; the reply goes to that requester's response partition.
        requester_id: u64,
        /// The lookup or search.
        query: ContactQuery,
    },
    /// The resolver's answer to a phone lookup. An empty name is a miss.
    ContactResponse {
        /// The query being answered, echoed from the request.
        query: ContactQuery,
        /// Display name, empty on a miss.
        name: String,
        /// Phone label such as "mobile", possibly empty.
        label: String,
    },
}

impl Envelope {
    /// Shorthand for the shutdown control message.
    pub fn shutdown() -> Self {
        Self::Control {
            command: ControlCommand::Shutdown,
        }
    }

    /// Short name of the variant, for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InboundSms { .. } => "inbound_sms",
            Self::Control { .. } => "control",
            Self::LogRecord { .. } => "log_record",
            Self::ContactRequest { .. } => "contact_request",
            Self::ContactResponse { .. } => "contact_response",
        }
    }
}
