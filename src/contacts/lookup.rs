//! Requester side of the contacts round trip.
//!
//! A requester publishes a [`Envelope::ContactRequest`] carrying its own id
//! and waits a bounded time on its private response partition. Replies
//! carry the query they answer; a reply to an earlier, timed-out request is
//! discarded. No answer within the wait is a valid outcome, not an error.

use std::time::{Duration, Instant};

use crate::bus::{Bus, BusError, ContactQuery, Envelope, Partition, ReceiveMode};

/// A resolver hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactMatch {
    /// Display name.
    pub name: String,
    /// Phone label, possibly empty.
    pub label: String,
}

/// Resolve `phone` through the contacts resolver.
///
/// Returns `Ok(None)` on a miss, on timeout, or when no resolver runs.
///
/// # Errors
///
/// Returns [`BusError`] if the request cannot be published or the bus
/// fails while waiting.
pub async fn lookup_phone(
    bus: &Bus,
    requester_id: u64,
    phone: &str,
    timeout: Duration,
) -> Result<Option<ContactMatch>, BusError> {
    let query = ContactQuery::PhoneLookup {
        phone: phone.to_owned(),
    };
    round_trip(bus, requester_id, query, timeout).await
}

/// Send a free-text directory search and wait for an answer.
///
/// # Errors
///
/// Same as [`lookup_phone`].
pub async fn search(
    bus: &Bus,
    requester_id: u64,
    query: &str,
    timeout: Duration,
) -> Result<Option<ContactMatch>, BusError> {
    let query = ContactQuery::Search {
        query: query.to_owned(),
    };
    round_trip(bus, requester_id, query, timeout).await
}

/// Publish a search without waiting for any answer.
///
/// # Errors
///
/// Returns [`BusError`] if the request cannot be published.
pub fn submit_search(bus: &Bus, requester_id: u64, query: &str) -> Result<(), BusError> {
    bus.publish(
        Partition::ContactsRequest,
        &Envelope::ContactRequest {
            requester_id,
            query: ContactQuery::Search {
                query: query.to_owned(),
            },
        },
    )
}

async fn round_trip(
    bus: &Bus,
    requester_id: u64,
    query: ContactQuery,
    timeout: Duration,
) -> Result<Option<ContactMatch>, BusError> {
    let partition = Partition::ContactsResponse(requester_id);

    // A reply that arrived after an earlier request timed out must not be
    // mistaken for the answer to this one.
    while bus.receive(partition, ReceiveMode::Poll).await?.is_some() {}

    bus.publish(
        Partition::ContactsRequest,
        &Envelope::ContactRequest {
            requester_id,
            query: query.clone(),
        },
    )?;

    let Some(deadline) = Instant::now().checked_add(timeout) else {
        return Ok(None);
    };
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        match bus.receive(partition, ReceiveMode::Wait(remaining)).await? {
            Some(Envelope::ContactResponse {
                query: answered,
                name,
                label,
            }) if answered == query => {
                return Ok((!name.is_empty()).then_some(ContactMatch { name, label }));
            }
            Some(_) => {}
            None => return Ok(None),
        }
    }
}
