//! Bus-backed logging: unit-side [`LogHandle`] and the log collector loop.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::bus::{Bus, BusError, Envelope, LogLevel, Partition, ReceiveMode};

/// Logging handle given to each unit at construction.
///
/// Records are published on the log partition. A record the bus refuses is
/// written straight to `tracing` instead.
#[derive(Clone)]
pub struct LogHandle {
    bus: Arc<Bus>,
    unit: Arc<str>,
}

impl std::fmt::Debug for LogHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogHandle")
            .field("unit", &self.unit)
            .finish_non_exhaustive()
    }
}

impl LogHandle {
    /// Create a handle publishing on `bus` under the name `unit`.
    pub fn new(bus: Arc<Bus>, unit: impl Into<String>) -> Self {
        Self {
            bus,
            unit: Arc::from(unit.into()),
        }
    }

    /// Name records are tagged with.
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Publish a debug record.
    pub fn debug(&self, text: impl Into<String>) {
        self.publish(LogLevel::Debug, text.into());
    }

    /// Publish an info record.
    pub fn info(&self, text: impl Into<String>) {
        self.publish(LogLevel::Info, text.into());
    }

    /// Publish a warning record.
    pub fn warning(&self, text: impl Into<String>) {
        self.publish(LogLevel::Warning, text.into());
    }

    /// Publish an error record.
    pub fn error(&self, text: impl Into<String>) {
        self.publish(LogLevel::Error, text.into());
    }

    fn publish(&self, level: LogLevel, text: String) {
        let record = Envelope::LogRecord {
            level,
            timestamp: Utc::now(),
            unit: self.unit.to_string(),
            text,
        };
        if let Err(e) = self.bus.publish(Partition::Log, &record) {
            if let Envelope::LogRecord { text, .. } = record {
                warn!(unit = %self.unit, error = %e, "log record bypassed the bus: {text}");
            }
        }
    }
}

/// Drain the log partition onto the `tracing` sink.
///
/// Blocks on the log partition until the shutdown signal flips or the bus
/// closes, then emits whatever is still queued. Returns the number of
/// records written.
pub async fn run_log_collector(bus: Arc<Bus>, mut shutdown_rx: watch::Receiver<bool>) -> usize {
    let mut written: usize = 0;
    debug!("log collector started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            received = bus.receive(Partition::Log, ReceiveMode::Block) => match received {
                Ok(Some(envelope)) => {
                    emit(&envelope);
                    written = written.saturating_add(1);
                }
                Ok(None) => {}
                Err(BusError::Closed) => break,
                Err(e) => warn!(error = %e, "dropping unreadable log record"),
            },
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    while let Ok(Some(envelope)) = bus.receive(Partition::Log, ReceiveMode::Poll).await {
        emit(&envelope);
        written = written.saturating_add(1);
    }

    debug!(written, "log collector stopped");
    written
}

fn emit(envelope: &Envelope) {
    let Envelope::LogRecord {
        level,
        timestamp,
        unit,
        text,
    } = envelope
    else {
        warn!(kind = envelope.kind(), "unexpected message on log partition");
        return;
    };

    match level {
        LogLevel::Debug => debug!(unit = %unit, at = %timestamp, "{text}"),
        LogLevel::Info => info!(unit = %unit, at = %timestamp, "{text}"),
        LogLevel::Warning => warn!(unit = %unit, at = %timestamp, "{text}"),
        LogLevel::Error => error!(unit = %unit, at = %timestamp, "{text}"),
    }
}
