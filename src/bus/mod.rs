//! In-process message bus.
//!
//! The bus is a set of FIFO queues keyed by [`Partition`]. It is the only
//! channel between units: workers, the contacts resolver, the log collector
//! and the HTTP listener never share memory, they exchange [`Envelope`]s.
//!
//! Partitions are queues, not topics. A message placed on a shared
//! partition is consumed by exactly one reader, so a control message meant
//! for N workers has to be published N times.

pub mod envelope;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tracing::{debug, trace};

pub use envelope::{ContactQuery, ControlCommand, Envelope, LogLevel};

/// Default upper bound on an encoded envelope, in bytes.
pub const DEFAULT_MAX_PAYLOAD: usize = 4096;

/// Queue identifier, segmented by message class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    /// Shared lifecycle messages for all device workers.
    Control,
    /// Log records for the log collector.
    Log,
    /// Requests for the contacts resolver.
    ContactsRequest,
    /// Inbound SMS for one device, keyed by [`device_key`].
    Device(u64),
    /// Resolver replies for one requester.
    ContactsResponse(u64),
}

impl Partition {
    /// Inbound partition for a device identifier.
    pub fn for_device(device: &str) -> Self {
        Self::Device(device_key(device))
    }
}

/// Stable numeric key for a device identifier.
///
/// Derived from the SHA-256 digest of the identifier, so it is the same
/// across restarts and independent of configuration order.
pub fn device_key(device: &str) -> u64 {
    let digest = Sha256::digest(device.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// How [`Bus::receive`] behaves on an empty partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveMode {
    /// Return `None` immediately.
    Poll,
    /// Wait up to the given duration for a message.
    Wait(Duration),
    /// Wait until a message arrives or the bus closes.
    Block,
}

/// Why an envelope could not be turned into a bus payload.
#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    /// Serialization itself failed.
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    /// The encoded payload exceeds the bus bound. Payloads are never truncated.
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    TooLarge {
        /// Encoded size.
        size: usize,
        /// Configured bound.
        max: usize,
    },
}

/// Errors produced by bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The envelope was rejected before it was queued.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
    /// A queued payload could not be decoded.
    #[error("failed to decode payload: {0}")]
    Decode(serde_json::Error),
    /// The bus has been released.
    #[error("bus is closed")]
    Closed,
}

#[derive(Default)]
struct Slot {
    queue: VecDeque<Vec<u8>>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct Queues {
    slots: HashMap<Partition, Slot>,
    closed: bool,
}

impl Queues {
    fn slot(&mut self, partition: Partition) -> &mut Slot {
        self.slots.entry(partition).or_default()
    }

    fn pop(&mut self, partition: Partition) -> Option<Vec<u8>> {
        self.slots
            .get_mut(&partition)
            .and_then(|slot| slot.queue.pop_front())
    }
}

/// Partitioned FIFO message bus.
pub struct Bus {
    queues: Mutex<Queues>,
    max_payload: usize,
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("max_payload", &self.max_payload)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl Bus {
    /// Create an empty bus that rejects payloads above `max_payload` bytes.
    pub fn new(max_payload: usize) -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
            max_payload,
        }
    }

    /// Configured payload bound.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    fn lock(&self) -> MutexGuard<'_, Queues> {
        self.queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Encode and enqueue an envelope at the tail of `partition`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Encoding`] when the envelope cannot be serialized
    /// or its encoded size exceeds the bound, and [`BusError::Closed`] after
    /// [`Bus::close`].
    pub fn publish(&self, partition: Partition, envelope: &Envelope) -> Result<(), BusError> {
        let payload = serde_json::to_vec(envelope).map_err(EncodingError::from)?;
        if payload.len() > self.max_payload {
            return Err(EncodingError::TooLarge {
                size: payload.len(),
                max: self.max_payload,
            }
            .into());
        }

        let mut queues = self.lock();
        if queues.closed {
            return Err(BusError::Closed);
        }
        let slot = queues.slot(partition);
        slot.queue.push_back(payload);
        slot.notify.notify_one();
        trace!(?partition, kind = envelope.kind(), "published");
        Ok(())
    }

    /// Take the head of `partition`.
    ///
    /// Returns `Ok(None)` when the partition stayed empty for the whole wait
    /// allowed by `mode`. Waiting returns as soon as a message is available.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Closed`] once the bus is closed and the partition
    /// is drained, or [`BusError::Decode`] if a payload is corrupt.
    pub async fn receive(
        &self,
        partition: Partition,
        mode: ReceiveMode,
    ) -> Result<Option<Envelope>, BusError> {
        let deadline = match mode {
            ReceiveMode::Wait(wait) => tokio::time::Instant::now().checked_add(wait),
            ReceiveMode::Poll | ReceiveMode::Block => None,
        };

        loop {
            let notify = {
                let mut queues = self.lock();
                if let Some(payload) = queues.pop(partition) {
                    return decode(&payload).map(Some);
                }
                if queues.closed {
                    return Err(BusError::Closed);
                }
                if mode == ReceiveMode::Poll {
                    return Ok(None);
                }
                Arc::clone(&queues.slot(partition).notify)
            };

            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // A publish may have landed between releasing the lock and
            // registering interest.
            {
                let mut queues = self.lock();
                if let Some(payload) = queues.pop(partition) {
                    return decode(&payload).map(Some);
                }
                if queues.closed {
                    return Err(BusError::Closed);
                }
            }

            match (mode, deadline) {
                (ReceiveMode::Block, _) => notified.await,
                (ReceiveMode::Wait(_), Some(deadline)) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                // Wait duration overflowed the clock: treat as unbounded.
                (ReceiveMode::Wait(_), None) => notified.await,
                (ReceiveMode::Poll, _) => return Ok(None),
            }
        }
    }

    /// Number of messages queued on `partition`.
    pub fn pending(&self, partition: Partition) -> usize {
        self.lock()
            .slots
            .get(&partition)
            .map_or(0, |slot| slot.queue.len())
    }

    /// Release the bus. Queued messages can still be drained; new publishes
    /// fail and blocked receivers wake up with [`BusError::Closed`].
    pub fn close(&self) {
        let mut queues = self.lock();
        if queues.closed {
            return;
        }
        queues.closed = true;
        for slot in queues.slots.values() {
            slot.notify.notify_waiters();
        }
        debug!("bus closed");
    }

    /// Whether [`Bus::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

fn decode(payload: &[u8]) -> Result<Envelope, BusError> {
    serde_json::from_slice(payload).map_err(BusError::Decode)
}
