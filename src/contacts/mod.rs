//! Contacts resolver.
//!
//! Keeps a phone -> name cache synced from a remote directory and answers
//! lookups from other units over the bus. The resolver is the only writer
//! of the cache; everyone else goes through [`lookup`].
//!
//! Sync cycle:
//! 1. list remote entry ids with modification tags
//! 2. evict cached ids missing from the listing, queue new or newer ids
//! 3. fetch queued records, write each to `<id>.vcf` stamped with the
//!    later of its revision and its listing tag
//! 4. rebuild the in-memory map from every cached record

pub mod cache;
pub mod carddav;
pub mod lookup;
pub mod vcard;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio::time::Instant;

use crate::bus::{Bus, BusError, ContactQuery, Envelope, Partition, ReceiveMode};
use crate::logging::LogHandle;

pub use cache::ContactCache;
pub use carddav::{CardDavClient, DirectoryClient, RemoteEntry};
pub use lookup::{lookup_phone, ContactMatch};

/// Unit name used in log records.
pub const UNIT_NAME: &str = "contacts";

/// How long one request wait lasts before rescan and shutdown are rechecked.
const REQUEST_WAIT: Duration = Duration::from_secs(1);

/// Errors produced by the contacts resolver.
#[derive(Debug, thiserror::Error)]
pub enum ContactsError {
    /// Cache filesystem failure.
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Directory request failed.
    #[error("directory request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Directory answered with something unusable.
    #[error("directory protocol error: {0}")]
    Protocol(String),
    /// An entry id that cannot be used as a file name.
    #[error("invalid entry id: {0:?}")]
    InvalidId(String),
}

/// Cached answer for one phone number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactEntry {
    /// Display name.
    pub name: String,
    /// Phone label, possibly empty.
    pub label: String,
}

/// Outcome of one sync cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Entries in the remote listing.
    pub listed: usize,
    /// Records fetched and written.
    pub fetched: usize,
    /// Cached records deleted because they vanished upstream.
    pub evicted: usize,
    /// Phone numbers in the rebuilt map.
    pub phones: usize,
}

/// Lets other parts of the process ask for a rescan.
#[derive(Debug, Clone)]
pub struct ContactsHandle {
    rescan: Arc<AtomicBool>,
}

impl ContactsHandle {
    /// Ask for a sync before the next request is served.
    pub fn request_rescan(&self) {
        self.rescan.store(true, Ordering::SeqCst);
    }
}

/// Owner of the contact cache.
pub struct ContactsResolver {
    client: Arc<dyn DirectoryClient>,
    cache: ContactCache,
    bus: Arc<Bus>,
    log: LogHandle,
    entries: HashMap<String, ContactEntry>,
    rescan: Arc<AtomicBool>,
    rescan_interval: Option<Duration>,
}

impl std::fmt::Debug for ContactsResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContactsResolver")
            .field("cache", &self.cache)
            .field("entries", &self.entries.len())
            .field("rescan_interval", &self.rescan_interval)
            .finish_non_exhaustive()
    }
}

impl ContactsResolver {
    /// Create a resolver. The cache is empty until the first sync.
    pub fn new(
        client: Arc<dyn DirectoryClient>,
        cache: ContactCache,
        bus: Arc<Bus>,
        log: LogHandle,
    ) -> Self {
        Self {
            client,
            cache,
            bus,
            log,
            entries: HashMap::new(),
            rescan: Arc::new(AtomicBool::new(false)),
            rescan_interval: None,
        }
    }

    /// Also rescan every `interval`.
    #[must_use]
    pub fn with_rescan_interval(mut self, interval: Option<Duration>) -> Self {
        self.rescan_interval = interval.filter(|d| !d.is_zero());
        self
    }

    /// Handle for requesting a rescan from outside.
    pub fn handle(&self) -> ContactsHandle {
        ContactsHandle {
            rescan: Arc::clone(&self.rescan),
        }
    }

    /// Cached entry for `phone`, compared after normalization.
    pub fn lookup(&self, phone: &str) -> Option<&ContactEntry> {
        self.entries.get(&vcard::normalize_phone(phone))
    }

    /// Number of phone numbers in the map.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run one sync cycle against the directory.
    ///
    /// # Errors
    ///
    /// Any listing, fetch or cache failure aborts the cycle.
    pub async fn sync(&mut self) -> Result<SyncReport, ContactsError> {
        let remote = self.client.list_entries().await?;
        let mut report = SyncReport {
            listed: remote.len(),
            ..SyncReport::default()
        };
        let remote_ids: HashSet<&str> = remote.iter().map(|e| e.id.as_str()).collect();

        for id in self.cache.ids()? {
            if !remote_ids.contains(id.as_str()) {
                self.cache.remove(&id)?;
                report.evicted = report.evicted.saturating_add(1);
                self.log.debug(format!("evicted contact {id}"));
            }
        }

        let mut queued = Vec::new();
        for entry in &remote {
            match self.is_stale(entry) {
                Ok(true) => queued.push(entry),
                Ok(false) => {}
                Err(ContactsError::InvalidId(id)) => {
                    self.log.warning(format!("skipping contact with unusable id {id:?}"));
                }
                Err(e) => return Err(e),
            }
        }

        for entry in queued {
            let raw = self.client.fetch_entry(&entry.id).await?;
            let card = vcard::parse(&raw);
            // Never stamp older than the listing tag, or the next sync
            // would see the record as stale again.
            let stamp = match (card.revision, entry.modified) {
                (Some(revision), Some(modified)) => Some(revision.max(modified)),
                (revision, modified) => revision.or(modified),
            }
            .map_or_else(SystemTime::now, SystemTime::from);
            self.cache.write(&entry.id, &raw, stamp)?;
            report.fetched = report.fetched.saturating_add(1);
            self.log.debug(format!(
                "fetched contact {} ({})",
                entry.id,
                card.name.as_deref().unwrap_or("unnamed")
            ));
        }

        report.phones = self.rebuild()?;
        self.log.info(format!(
            "contacts synced: {} listed, {} fetched, {} evicted, {} numbers",
            report.listed, report.fetched, report.evicted, report.phones
        ));
        Ok(report)
    }

    fn is_stale(&self, entry: &RemoteEntry) -> Result<bool, ContactsError> {
        let Some(local) = self.cache.modified(&entry.id)? else {
            return Ok(true);
        };
        Ok(match entry.modified {
            Some(remote) => local < SystemTime::from(remote),
            None => true,
        })
    }

    /// Replace the in-memory map with one built from every cached record.
    /// Returns the number of phone numbers indexed.
    ///
    /// # Errors
    ///
    /// Returns [`ContactsError::Io`] if the cache cannot be read.
    pub fn rebuild(&mut self) -> Result<usize, ContactsError> {
        let mut entries = HashMap::new();
        for id in self.cache.ids()? {
            let card = vcard::parse(&self.cache.read(&id)?);
            let Some(name) = card.name else {
                continue;
            };
            for phone in card.phones {
                entries.insert(
                    vcard::normalize_phone(&phone.number),
                    ContactEntry {
                        name: name.clone(),
                        label: phone.label,
                    },
                );
            }
        }
        self.entries = entries;
        Ok(self.entries.len())
    }

    /// Answer one request. Phone lookups always get a reply, empty on a
    /// miss; searches are accepted and left unanswered.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the reply cannot be published.
    pub fn answer(&self, request: &Envelope) -> Result<(), BusError> {
        let Envelope::ContactRequest {
            requester_id,
            query,
        } = request
        else {
            self.log.warning(format!(
                "unexpected {} on the contacts request partition",
                request.kind()
            ));
            return Ok(());
        };

        match query {
            ContactQuery::PhoneLookup { phone } => {
                let reply = match self.lookup(phone) {
                    Some(entry) => Envelope::ContactResponse {
                        query: query.clone(),
                        name: entry.name.clone(),
                        label: entry.label.clone(),
                    },
                    None => {
                        self.log.debug(format!("no contact for {phone}"));
                        Envelope::ContactResponse {
                            query: query.clone(),
                            name: String::new(),
                            label: String::new(),
                        }
                    }
                };
                self.bus
                    .publish(Partition::ContactsResponse(*requester_id), &reply)
            }
            ContactQuery::Search { query } => {
                self.log
                    .debug(format!("search for {query:?} accepted, not answered"));
                Ok(())
            }
        }
    }

    /// Sync, then serve requests until `shutdown_rx` flips or the bus
    /// closes. Rescans run between requests whenever the flag is set.
    ///
    /// # Errors
    ///
    /// A failed sync ends the resolver; requesters then time out and fall
    /// back to raw numbers.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), ContactsError> {
        self.log.info("contacts resolver started");
        if let Err(e) = self.sync().await {
            self.log.error(format!("contacts sync failed: {e}"));
            return Err(e);
        }

        let mut next_rescan = self.next_rescan(Instant::now());
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            if next_rescan.is_some_and(|at| Instant::now() >= at) {
                self.rescan.store(true, Ordering::SeqCst);
                next_rescan = self.next_rescan(Instant::now());
            }
            if self.rescan.swap(false, Ordering::SeqCst) {
                if let Err(e) = self.sync().await {
                    self.log.error(format!("contacts sync failed: {e}"));
                    return Err(e);
                }
            }

            tokio::select! {
                received = self.bus.receive(Partition::ContactsRequest, ReceiveMode::Wait(REQUEST_WAIT)) => {
                    match received {
                        Ok(Some(request)) => {
                            if let Err(e) = self.answer(&request) {
                                self.log.warning(format!("failed to reply to contact request: {e}"));
                            }
                        }
                        Ok(None) => {}
                        Err(BusError::Closed) => break,
                        Err(e) => self.log.warning(format!("dropping unreadable contact request: {e}")),
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.log.info("contacts resolver stopped");
        Ok(())
    }

    fn next_rescan(&self, now: Instant) -> Option<Instant> {
        self.rescan_interval
            .and_then(|interval| now.checked_add(interval))
    }
}
