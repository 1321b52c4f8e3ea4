//! Device worker: one per configured device.
//!
//! Owns the device's chat session and gateway adapter. Each loop iteration
//! waits briefly for chat events, drains the device's inbound partition,
//! polls the shared control partition once, then runs an unforced health
//! check and republishes presence when the outcome changed.

pub mod commands;

use std::sync::Arc;

use crate::app::{identity, APP_NAME};
use crate::bus::{Bus, BusError, ControlCommand, Envelope, Partition, ReceiveMode};
use crate::chat::{ChatConnector, ChatError, ChatEvent, ChatSession};
use crate::config::{DeviceConfig, Timings};
use crate::contacts::lookup::{self, ContactMatch};
use crate::gateway::{
    Addressing, GatewayAdapter, GatewayContext, GatewayError, GatewayRegistry,
    DEFAULT_GATEWAY_PORT,
};
use crate::logging::LogHandle;

use commands::Command;

/// Reply to anyone who is not the allow-listed peer.
pub const REFUSAL: &str = "Sorry you are not a user whom is permitted to talk with me. :-(";

/// Last message before the session closes.
pub const FAREWELL: &str = "Gateway shutting down... goodbye!";

/// Errors that end a worker.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// A required device setting is absent.
    #[error("device setting {0} is required")]
    MissingSetting(&'static str),
    /// The gateway could not be constructed.
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
    /// The chat session failed.
    #[error("chat error: {0}")]
    Chat(#[from] ChatError),
    /// The bus failed.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

/// Worker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Validating config, connecting and building the gateway.
    Connecting,
    /// Serving chat and bus traffic.
    Active,
    /// Session closed; terminal.
    Draining,
}

/// Shared dependencies handed to every worker.
#[derive(Clone)]
pub struct WorkerContext {
    /// The process bus.
    pub bus: Arc<Bus>,
    /// Opens chat sessions.
    pub connector: Arc<dyn ChatConnector>,
    /// Gateway constructors.
    pub registry: Arc<GatewayRegistry>,
    /// Wait and health timings.
    pub timings: Timings,
    /// Whether a contacts resolver is running.
    pub contacts_enabled: bool,
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("registry", &self.registry)
            .field("timings", &self.timings)
            .field("contacts_enabled", &self.contacts_enabled)
            .finish_non_exhaustive()
    }
}

/// State machine for one device.
pub struct DeviceWorker {
    device: String,
    config: Arc<DeviceConfig>,
    receiver: String,
    bus: Arc<Bus>,
    log: LogHandle,
    timings: Timings,
    contacts_enabled: bool,
    session: Box<dyn ChatSession>,
    gateway: Box<dyn GatewayAdapter>,
    state: WorkerState,
    inbound: Partition,
    requester_id: u64,
    session_ready: bool,
    path_error: Option<String>,
    conversation_target: Option<String>,
    last_announced_status: Option<String>,
    pending_search: Option<String>,
}

impl std::fmt::Debug for DeviceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceWorker")
            .field("device", &self.device)
            .field("state", &self.state)
            .field("conversation_target", &self.conversation_target)
            .finish_non_exhaustive()
    }
}

impl DeviceWorker {
    /// Validate the device config, open the chat session and build the
    /// gateway adapter.
    ///
    /// A malformed gateway path does not fail startup: the adapter waits for
    /// the device to report its address and the peer is told once the
    /// session starts.
    ///
    /// # Errors
    ///
    /// [`WorkerError::MissingSetting`] when the chat server, username or
    /// peer is absent; [`WorkerError::Chat`] when the session cannot be
    /// opened; [`WorkerError::Gateway`] for an unregistered gateway type.
    pub async fn connect(
        device: &str,
        config: Arc<DeviceConfig>,
        ctx: &WorkerContext,
    ) -> Result<Self, WorkerError> {
        let log = LogHandle::new(Arc::clone(&ctx.bus), device);
        log.debug(format!("[{device}] connecting"));

        if config.xmpp_server.as_deref().unwrap_or_default().is_empty() {
            return Err(WorkerError::MissingSetting("xmpp_server"));
        }
        if config.xmpp_username.as_deref().unwrap_or_default().is_empty() {
            return Err(WorkerError::MissingSetting("xmpp_username"));
        }
        let receiver = match config.xmpp_receiver.as_deref() {
            Some(receiver) if !receiver.is_empty() => receiver.to_owned(),
            _ => return Err(WorkerError::MissingSetting("xmpp_receiver")),
        };

        let mut session = ctx.connector.connect(device, &config).await?;

        let gateway_ctx = GatewayContext {
            device: device.to_owned(),
            log: log.clone(),
            timings: ctx.timings,
        };
        let mut gateway = match ctx.registry.create(&config.gateway_type, gateway_ctx) {
            Ok(gateway) => gateway,
            Err(e) => {
                if let Err(close) = session.disconnect().await {
                    log.debug(format!("[{device}] disconnect after failed start: {close}"));
                }
                return Err(e.into());
            }
        };
        let path_error = match gateway.resolve_path(&config.gateway_path) {
            Ok(addressing) => {
                log.debug(format!(
                    "[{device}] gateway path resolved ({addressing:?})"
                ));
                None
            }
            Err(e) => {
                log.error(format!(
                    "[{device}] {e}, waiting for the device to report its address"
                ));
                Some(format!(
                    "Gateway path \"{}\" is invalid, waiting for the device to report its address.",
                    config.gateway_path
                ))
            }
        };

        Ok(Self {
            device: device.to_owned(),
            config,
            receiver,
            bus: Arc::clone(&ctx.bus),
            log,
            timings: ctx.timings,
            contacts_enabled: ctx.contacts_enabled,
            session,
            gateway,
            state: WorkerState::Connecting,
            inbound: Partition::for_device(device),
            requester_id: crate::bus::device_key(device),
            session_ready: false,
            path_error,
            conversation_target: None,
            last_announced_status: None,
            pending_search: None,
        })
    }

    /// Device identifier.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Phone number unaddressed text goes to.
    pub fn conversation_target(&self) -> Option<&str> {
        self.conversation_target.as_deref()
    }

    /// Name of the last `_chat <name>` search still waiting for a result.
    /// Nothing consumes search results yet, so this never clears.
    pub fn pending_search(&self) -> Option<&str> {
        self.pending_search.as_deref()
    }

    /// Last presence text published.
    pub fn last_announced_status(&self) -> Option<&str> {
        self.last_announced_status.as_deref()
    }

    /// The owned gateway adapter.
    pub fn gateway(&self) -> &dyn GatewayAdapter {
        self.gateway.as_ref()
    }

    /// Serve until a shutdown control message arrives or the bus closes.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Chat`] when the chat session fails while
    /// waiting for events.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        self.state = WorkerState::Active;
        self.log.info(format!("[{}] worker active", self.device));

        loop {
            let events = match self.session.wait_events(self.timings.event_wait).await {
                Ok(events) => events,
                Err(e) => {
                    self.state = WorkerState::Draining;
                    self.log
                        .error(format!("[{}] chat session failed: {e}", self.device));
                    return Err(e.into());
                }
            };
            for event in events {
                self.handle_chat_event(event).await;
            }

            if !self.drain_inbound().await {
                self.shutdown().await;
                return Ok(());
            }

            match self.bus.receive(Partition::Control, ReceiveMode::Poll).await {
                Ok(Some(Envelope::Control {
                    command: ControlCommand::Shutdown,
                })) => {
                    self.log
                        .info(format!("[{}] shutdown command received", self.device));
                    self.shutdown().await;
                    return Ok(());
                }
                Ok(Some(other)) => self.log.warning(format!(
                    "[{}] unknown {} on the control partition",
                    self.device,
                    other.kind()
                )),
                Ok(None) => {}
                Err(BusError::Closed) => {
                    self.shutdown().await;
                    return Ok(());
                }
                Err(e) => self
                    .log
                    .warning(format!("[{}] unreadable control message: {e}", self.device)),
            }

            self.check_health().await;
        }
    }

    /// Handle everything queued on the device partition. Returns `false`
    /// once the bus is closed.
    async fn drain_inbound(&mut self) -> bool {
        loop {
            match self.bus.receive(self.inbound, ReceiveMode::Poll).await {
                Ok(Some(envelope)) => self.handle_bus_message(envelope).await,
                Ok(None) => return true,
                Err(BusError::Closed) => return false,
                Err(e) => self
                    .log
                    .warning(format!("[{}] unreadable inbound message: {e}", self.device)),
            }
        }
    }

    /// React to one chat session event.
    pub async fn handle_chat_event(&mut self, event: ChatEvent) {
        match event {
            ChatEvent::Message { from, body } => self.handle_message(&from, &body).await,
            ChatEvent::Presence { from, status } => self.log.debug(format!(
                "[{}] presence notification from {from} with status of {}",
                self.device,
                status.as_deref().unwrap_or("")
            )),
            ChatEvent::SessionStart => self.session_started().await,
            ChatEvent::StreamEnd => self
                .log
                .info(format!("[{}] peer closed the chat stream", self.device)),
        }
    }

    async fn session_started(&mut self) {
        self.log
            .info(format!("[{}] established chat session", self.device));
        if let Err(e) = self.session.fetch_roster().await {
            self.log
                .warning(format!("[{}] roster fetch failed: {e}", self.device));
        }
        let status = self.status_text(true);
        self.publish_presence(status).await;
        if let Err(e) = self.session.auto_subscribe(true).await {
            self.log
                .warning(format!("[{}] auto-subscribe failed: {e}", self.device));
        }

        let receiver = self.receiver.clone();
        self.reply(&receiver, &format!("{} started", identity())).await;
        self.reply(&receiver, "Type \"_help\" for usage and option information")
            .await;
        if let Some(notice) = self.path_error.take() {
            self.reply(&receiver, &notice).await;
        }
        self.session_ready = true;
    }

    async fn handle_message(&mut self, from: &str, body: &str) {
        if from != self.receiver {
            self.log.warning(format!(
                "[{}] denied message from {from}, only {} is permitted",
                self.device, self.receiver
            ));
            self.reply(from, REFUSAL).await;
            return;
        }

        match commands::parse(body) {
            Command::Help => self.reply_lines(from, commands::help_lines()).await,
            Command::Usage => self.reply_lines(from, commands::usage_lines()).await,
            Command::About => self.reply_lines(from, commands::about_lines()).await,
            Command::License => self.reply(from, &commands::license_line()).await,
            Command::Version => self.reply(from, &identity()).await,
            Command::HealthCheck => {
                let text = if self.gateway.health_check(true).await {
                    "Health check succeeded, the gateway device is reachable."
                } else {
                    "Health check failed, the gateway device is unreachable."
                };
                self.reply(from, text).await;
            }
            Command::Chat(target) => self.select_target(from, target).await,
            Command::Find(query) => self.find(from, query).await,
            Command::Text(text) => self.send_text(from, text).await,
        }
    }

    async fn select_target(&mut self, from: &str, target: &str) {
        if target.is_empty() {
            self.reply(from, "Usage: _chat <number>").await;
            return;
        }

        let number = commands::normalize_target(target);
        if commands::is_phone_number(&number) {
            self.reply(
                from,
                &format!(
                    "Chat target set, you are now talking to {number}, all unaddressed replies will go to this recipient."
                ),
            )
            .await;
            self.conversation_target = Some(number);
            return;
        }

        if !self.contacts_enabled {
            self.reply(
                from,
                "Contacts lookup is not enabled, use \"_chat <number>\" instead.",
            )
            .await;
            return;
        }
        match lookup::submit_search(&self.bus, self.requester_id, target) {
            Ok(()) => {
                self.log.debug(format!(
                    "[{}] searching contacts for chat target {target:?}",
                    self.device
                ));
                self.pending_search = Some(target.to_owned());
            }
            Err(e) => self
                .log
                .warning(format!("[{}] contacts search failed: {e}", self.device)),
        }
    }

    async fn find(&mut self, from: &str, query: &str) {
        if query.is_empty() {
            self.reply(from, "Usage: _find <name>").await;
            return;
        }
        if !self.contacts_enabled {
            self.reply(from, "Contacts lookup is not enabled.").await;
            return;
        }
        match lookup::search(&self.bus, self.requester_id, query, self.timings.contacts_timeout)
            .await
        {
            Ok(Some(found)) => {
                let text = format!("Found: {}", display_name(&found));
                self.reply(from, &text).await;
            }
            Ok(None) => self.log.debug(format!(
                "[{}] no contacts answer for {query:?}",
                self.device
            )),
            Err(e) => self
                .log
                .warning(format!("[{}] contacts search failed: {e}", self.device)),
        }
    }

    async fn send_text(&mut self, from: &str, body: &str) {
        if body.trim().is_empty() {
            self.log
                .debug(format!("[{}] dropped empty message", self.device));
            return;
        }

        if !self.gateway.health_check(true).await {
            self.reply(
                from,
                "Unable to send message, the gateway device is currently unreachable.",
            )
            .await;
            return;
        }

        let (phone, text) = match commands::split_destination(body) {
            Some((phone, text)) => {
                let phone = phone.to_owned();
                if self.conversation_target.as_deref() != Some(phone.as_str()) {
                    self.announce_target(&phone).await;
                    self.conversation_target = Some(phone.clone());
                }
                (phone, text.to_owned())
            }
            None => match self.conversation_target.clone() {
                Some(phone) => (phone, body.to_owned()),
                None => {
                    self.reply(
                        from,
                        "Unable to send message, no destination specified. Prefix your message with a phone number, eg \"+640000000: hello\", or pick one with \"_chat <number>\".",
                    )
                    .await;
                    return;
                }
            },
        };

        match self.gateway.send(&phone, &text).await {
            Ok(()) => self
                .log
                .debug(format!("[{}] delivered message to {phone}", self.device)),
            Err(e) => {
                self.log.warning(format!(
                    "[{}] failed to deliver message to {phone}: {e}",
                    self.device
                ));
                self.reply(
                    from,
                    &format!("Message to {phone} could not be delivered: {e}"),
                )
                .await;
            }
        }
    }

    /// React to one message from the device partition.
    pub async fn handle_bus_message(&mut self, envelope: Envelope) {
        let (device, phone, body, source_ip) = match envelope {
            Envelope::InboundSms {
                device,
                phone,
                body,
                source_ip,
            } => (device, phone, body, source_ip),
            other => {
                self.log.warning(format!(
                    "[{}] unexpected {} on the device partition",
                    self.device,
                    other.kind()
                ));
                return;
            }
        };
        if device != self.device {
            self.log.warning(format!(
                "[{}] dropped SMS addressed to device {device}",
                self.device
            ));
            return;
        }

        self.log.debug(format!(
            "[{}] received SMS from {phone}",
            self.device
        ));

        let display = self.display_name_for(&phone).await;

        match self.conversation_target.as_deref() {
            None => self.conversation_target = Some(phone.clone()),
            Some(current) if current != phone => {
                self.announce_target(&phone).await;
                self.conversation_target = Some(phone.clone());
            }
            Some(_) => {}
        }

        let receiver = self.receiver.clone();
        let text = format!("{display}: {body}");
        if let Err(e) = self
            .session
            .send_message(&receiver, &text, Some(&phone))
            .await
        {
            self.log
                .warning(format!("[{}] failed to relay SMS: {e}", self.device));
        }

        if self.gateway.addressing() == Addressing::Dynamic {
            if let Some(host) = source_ip.as_deref().filter(|ip| !ip.is_empty()) {
                let port = self
                    .gateway
                    .address()
                    .map_or(DEFAULT_GATEWAY_PORT, |address| address.port);
                self.gateway.set_address(host, port);
            }
        }
    }

    async fn display_name_for(&mut self, phone: &str) -> String {
        if !self.contacts_enabled {
            return phone.to_owned();
        }
        match lookup::lookup_phone(
            &self.bus,
            self.requester_id,
            phone,
            self.timings.contacts_timeout,
        )
        .await
        {
            Ok(Some(found)) => display_name(&found),
            Ok(None) => {
                self.log
                    .debug(format!("[{}] no contact name for {phone}", self.device));
                phone.to_owned()
            }
            Err(e) => {
                self.log
                    .debug(format!("[{}] contact lookup failed: {e}", self.device));
                phone.to_owned()
            }
        }
    }

    async fn announce_target(&mut self, phone: &str) {
        let receiver = self.receiver.clone();
        let text = format!(
            "Chat target has changed, you are now talking to {phone}, all unaddressed replies will go to this recipient."
        );
        if let Err(e) = self
            .session
            .send_message(&receiver, &text, Some(phone))
            .await
        {
            self.log
                .warning(format!("[{}] failed to announce target: {e}", self.device));
        }
    }

    async fn check_health(&mut self) {
        let healthy = self.gateway.health_check(false).await;
        if !self.session_ready {
            return;
        }
        let status = self.status_text(healthy);
        if self.last_announced_status.as_deref() != Some(status.as_str()) {
            self.publish_presence(status).await;
        }
    }

    fn status_text(&self, healthy: bool) -> String {
        if healthy {
            format!("{APP_NAME} connected to {}", self.device)
        } else {
            format!(
                "{APP_NAME} connected to {} (gateway device unreachable)",
                self.device
            )
        }
    }

    async fn publish_presence(&mut self, status: String) {
        match self.session.set_presence(&status).await {
            Ok(()) => self.last_announced_status = Some(status),
            Err(e) => self
                .log
                .warning(format!("[{}] presence update failed: {e}", self.device)),
        }
    }

    async fn shutdown(&mut self) {
        let receiver = self.receiver.clone();
        self.reply(&receiver, FAREWELL).await;
        if let Err(e) = self.session.disconnect().await {
            self.log
                .warning(format!("[{}] disconnect failed: {e}", self.device));
        }
        self.state = WorkerState::Draining;
        self.log.info(format!("[{}] worker stopped", self.device));
    }

    async fn reply(&mut self, to: &str, body: &str) {
        if let Err(e) = self.session.send_message(to, body, None).await {
            self.log
                .warning(format!("[{}] failed to message {to}: {e}", self.device));
        }
    }

    async fn reply_lines(&mut self, to: &str, lines: Vec<String>) {
        for line in lines {
            self.reply(to, &line).await;
        }
    }

    /// Device configuration this worker was built from.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }
}

fn display_name(found: &ContactMatch) -> String {
    if found.label.is_empty() {
        found.name.clone()
    } else {
        format!("{} ({})", found.name, found.label)
    }
}

/// Connect and run one worker, logging how it ended.
///
/// # Errors
///
/// Whatever ended the worker: a startup failure is fatal to this worker
/// only.
pub async fn run_worker(
    device: String,
    config: Arc<DeviceConfig>,
    ctx: WorkerContext,
) -> Result<(), WorkerError> {
    let worker = match DeviceWorker::connect(&device, config, &ctx).await {
        Ok(worker) => worker,
        Err(e) => {
            LogHandle::new(Arc::clone(&ctx.bus), device.as_str())
                .error(format!("[{device}] failed to start: {e}"));
            return Err(e);
        }
    };
    worker.run().await
}
