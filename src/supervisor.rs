//! Supervisor: starts every unit and drives the shutdown sequence.
//!
//! Startup order: lock file, gateway tag validation, bus, log collector,
//! contacts resolver (optional), HTTP listener (optional), one worker per
//! device. Shutdown runs the reverse: listener, workers (one control
//! message each), resolver, collector, bus, lock file. The collector is
//! signalled only after the resolver has exited so the resolver's last
//! records are written.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{Bus, BusError, Envelope, Partition};
use crate::chat::ChatConnector;
use crate::config::Config;
use crate::contacts::{
    ContactCache, ContactsError, ContactsHandle, ContactsResolver, DirectoryClient,
};
use crate::gateway::GatewayRegistry;
use crate::listener::{self, ListenerState};
use crate::logging::{run_log_collector, LogHandle};
use crate::worker::{run_worker, WorkerContext, WorkerError};

/// Errors that abort startup before any unit runs.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Another dispatcher holds the lock.
    #[error("lock file {0} already exists, dispatcher already running?")]
    LockHeld(PathBuf),
    /// The lock file could not be created or removed.
    #[error("lock file {path}: {source}")]
    Lock {
        /// Lock path.
        path: PathBuf,
        /// Underlying failure.
        source: std::io::Error,
    },
    /// A device names a gateway type nobody registered.
    #[error("device {device} uses unknown gateway type {tag:?}")]
    UnknownGateway {
        /// Device identifier.
        device: String,
        /// Configured tag.
        tag: String,
    },
    /// Contacts cache could not be opened.
    #[error("contacts cache: {0}")]
    Contacts(#[from] ContactsError),
    /// The bus failed while sending shutdown messages.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    /// The listener could not bind.
    #[error("listener failed to bind {addr}: {source}")]
    Listener {
        /// Bind address.
        addr: std::net::SocketAddr,
        /// Underlying failure.
        source: std::io::Error,
    },
}

/// Supervisor lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Units are running.
    Running,
    /// Shutdown in progress.
    Draining,
    /// Every unit has exited and the bus is released.
    Terminated,
}

/// What the shutdown sequence did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers that were still running and got a shutdown message.
    pub shutdown_messages: usize,
    /// Workers that exited cleanly.
    pub workers_stopped: usize,
    /// Workers that had already ended with an error or panicked.
    pub workers_failed: usize,
    /// Log records the collector wrote.
    pub log_records: usize,
}

/// Pluggable collaborators.
#[derive(Clone)]
pub struct Collaborators {
    /// Opens chat sessions.
    pub connector: Arc<dyn ChatConnector>,
    /// Gateway constructors.
    pub registry: Arc<GatewayRegistry>,
    /// Directory for contacts sync. Required when contacts are enabled.
    pub directory: Option<Arc<dyn DirectoryClient>>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("registry", &self.registry)
            .field("directory", &self.directory.is_some())
            .finish_non_exhaustive()
    }
}

struct WorkerUnit {
    device: String,
    handle: JoinHandle<Result<(), WorkerError>>,
}

struct ListenerUnit {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Exclusive lock held for the supervisor's lifetime.
#[derive(Debug)]
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(path: &Path) -> Result<Self, SupervisorError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| SupervisorError::Lock {
                path: path.to_path_buf(),
                source,
            })?;
        }
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(_) => Ok(Self {
                path: path.to_path_buf(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(SupervisorError::LockHeld(path.to_path_buf()))
            }
            Err(source) => Err(SupervisorError::Lock {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn release(self) -> Result<(), SupervisorError> {
        std::fs::remove_file(&self.path).map_err(|source| SupervisorError::Lock {
            path: self.path.clone(),
            source,
        })
    }
}

/// Owns every unit of the dispatcher.
pub struct Supervisor {
    state: SupervisorState,
    bus: Arc<Bus>,
    lock: LockFile,
    workers: Vec<WorkerUnit>,
    resolver: Option<JoinHandle<Result<(), ContactsError>>>,
    contacts: Option<ContactsHandle>,
    listener: Option<ListenerUnit>,
    listener_addr: Option<std::net::SocketAddr>,
    resolver_stop: watch::Sender<bool>,
    collector: JoinHandle<usize>,
    collector_stop: watch::Sender<bool>,
    log: LogHandle,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &self.state)
            .field("workers", &self.workers.len())
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Start every unit described by `config`.
    ///
    /// # Errors
    ///
    /// Fatal-to-process conditions: the lock is held or cannot be created,
    /// a device names an unknown gateway type, the contacts cache cannot be
    /// opened, or the listener cannot bind. Nothing is left running when
    /// this returns an error.
    pub async fn start(config: &Config, collaborators: Collaborators) -> Result<Self, SupervisorError> {
        let lock = LockFile::acquire(&config.dispatcher.app_lock)?;
        match Self::launch(config, collaborators, lock).await {
            Ok(supervisor) => Ok(supervisor),
            Err((e, lock)) => {
                if let Err(release) = lock.release() {
                    warn!(error = %release, "failed to remove lock file");
                }
                Err(e)
            }
        }
    }

    async fn launch(
        config: &Config,
        collaborators: Collaborators,
        lock: LockFile,
    ) -> Result<Self, (SupervisorError, LockFile)> {
        for (device, device_config) in &config.devices {
            if !collaborators.registry.contains(&device_config.gateway_type) {
                return Err((
                    SupervisorError::UnknownGateway {
                        device: device.clone(),
                        tag: device_config.gateway_type.clone(),
                    },
                    lock,
                ));
            }
        }

        let contacts_cache = match (config.contacts.enabled, &collaborators.directory) {
            (true, Some(_)) => match ContactCache::open(&config.contacts.cache_dir) {
                Ok(cache) => Some(cache),
                Err(e) => return Err((e.into(), lock)),
            },
            (true, None) => {
                warn!("contacts enabled without a directory client, lookups disabled");
                None
            }
            (false, _) => None,
        };

        // Bind before spawning anything so a busy port leaves nothing running.
        let tcp = if config.listener.enabled {
            match tokio::net::TcpListener::bind(config.listener.bind).await {
                Ok(tcp) => Some(tcp),
                Err(source) => {
                    return Err((
                        SupervisorError::Listener {
                            addr: config.listener.bind,
                            source,
                        },
                        lock,
                    ))
                }
            }
        } else {
            None
        };

        let bus = Arc::new(Bus::new(config.dispatcher.max_payload_bytes));
        let (collector_stop, collector_rx) = watch::channel(false);
        let (resolver_stop, resolver_rx) = watch::channel(false);
        let log = LogHandle::new(Arc::clone(&bus), "supervisor");

        let collector = tokio::spawn(run_log_collector(Arc::clone(&bus), collector_rx));
        log.info(format!("launched {}", crate::app::identity()));

        let mut contacts = None;
        let resolver = match (contacts_cache, collaborators.directory.clone()) {
            (Some(cache), Some(directory)) => {
                let resolver = ContactsResolver::new(
                    directory,
                    cache,
                    Arc::clone(&bus),
                    LogHandle::new(Arc::clone(&bus), crate::contacts::UNIT_NAME),
                )
                .with_rescan_interval(
                    config
                        .contacts
                        .rescan_interval_secs
                        .map(std::time::Duration::from_secs),
                );
                contacts = Some(resolver.handle());
                Some(tokio::spawn(resolver.run(resolver_rx)))
            }
            _ => None,
        };

        let mut listener_addr = None;
        let listener = match tcp {
            Some(tcp) => {
                listener_addr = tcp.local_addr().ok();
                let state = ListenerState::new(
                    Arc::clone(&bus),
                    Arc::clone(&collaborators.registry),
                    config,
                );
                let (stop, stop_listener) = watch::channel(false);
                let handle = tokio::spawn(async move {
                    if let Err(e) = listener::serve(tcp, state, stop_listener).await {
                        error!(error = %e, "listener stopped with an error");
                    }
                });
                Some(ListenerUnit { stop, handle })
            }
            None => None,
        };

        let ctx = WorkerContext {
            bus: Arc::clone(&bus),
            connector: Arc::clone(&collaborators.connector),
            registry: Arc::clone(&collaborators.registry),
            timings: config.dispatcher.timings(),
            contacts_enabled: resolver.is_some(),
        };
        let workers = config
            .devices
            .iter()
            .map(|(device, device_config)| {
                log.info(format!("launching worker for {device}"));
                WorkerUnit {
                    device: device.clone(),
                    handle: tokio::spawn(run_worker(
                        device.clone(),
                        Arc::clone(device_config),
                        ctx.clone(),
                    )),
                }
            })
            .collect();

        Ok(Self {
            state: SupervisorState::Running,
            bus,
            lock,
            workers,
            resolver,
            contacts,
            listener,
            listener_addr,
            resolver_stop,
            collector,
            collector_stop,
            log,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// The process bus.
    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    /// Handle for requesting a contacts rescan, when a resolver runs.
    pub fn contacts(&self) -> Option<&ContactsHandle> {
        self.contacts.as_ref()
    }

    /// Address the listener bound, when it runs.
    pub fn listener_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener_addr
    }

    /// Number of workers that have not exited yet.
    pub fn live_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|unit| !unit.handle.is_finished())
            .count()
    }

    /// Run the shutdown sequence and release the bus and lock.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Bus`] if a shutdown message cannot be
    /// queued, or [`SupervisorError::Lock`] if the lock file cannot be
    /// removed. Units are still awaited before either is reported.
    pub async fn shutdown(mut self) -> Result<ShutdownReport, SupervisorError> {
        self.state = SupervisorState::Draining;
        self.log.info("shutdown requested");
        let mut report = ShutdownReport::default();
        let mut first_error: Option<SupervisorError> = None;

        if let Some(listener) = self.listener.take() {
            let _ = listener.stop.send(true);
            if let Err(e) = listener.handle.await {
                warn!(error = %e, "listener task failed");
            }
        }

        // The control partition is a queue: one message per live worker.
        let live: Vec<&WorkerUnit> = self
            .workers
            .iter()
            .filter(|unit| !unit.handle.is_finished())
            .collect();
        for unit in &live {
            match self.bus.publish(Partition::Control, &Envelope::shutdown()) {
                Ok(()) => report.shutdown_messages = report.shutdown_messages.saturating_add(1),
                Err(e) => {
                    error!(device = %unit.device, error = %e, "failed to queue shutdown");
                    first_error.get_or_insert(e.into());
                }
            }
        }
        drop(live);

        for unit in self.workers.drain(..) {
            match unit.handle.await {
                Ok(Ok(())) => report.workers_stopped = report.workers_stopped.saturating_add(1),
                Ok(Err(e)) => {
                    warn!(device = %unit.device, error = %e, "worker had ended with an error");
                    report.workers_failed = report.workers_failed.saturating_add(1);
                }
                Err(e) => {
                    error!(device = %unit.device, error = %e, "worker task panicked");
                    report.workers_failed = report.workers_failed.saturating_add(1);
                }
            }
        }
        debug!(stopped = report.workers_stopped, "all workers exited");

        let _ = self.resolver_stop.send(true);
        if let Some(resolver) = self.resolver.take() {
            match resolver.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "contacts resolver had stopped with an error"),
                Err(e) => error!(error = %e, "contacts resolver task panicked"),
            }
        }

        let _ = self.collector_stop.send(true);
        report.log_records = match self.collector.await {
            Ok(written) => written,
            Err(e) => {
                error!(error = %e, "log collector task panicked");
                0
            }
        };

        self.bus.close();
        if let Err(e) = self.lock.release() {
            first_error.get_or_insert(e);
        }
        self.state = SupervisorState::Terminated;
        info!(
            workers = report.workers_stopped,
            failed = report.workers_failed,
            "dispatcher terminated"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}
