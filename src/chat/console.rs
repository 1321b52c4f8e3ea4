//! Console chat sessions: stdin/stdout for local use and testing.
//!
//! Every line typed on stdin is delivered as a message from the device's
//! allow-listed peer. Prefix a line with `@<device>` to address a specific
//! device; unprefixed lines go to the first device that connected.
//! Outbound messages print as `[<device> -> <to>] <body>`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ChatConnector, ChatError, ChatEvent, ChatSession};
use crate::config::DeviceConfig;

#[derive(Default)]
struct Routes {
    devices: HashMap<String, (String, mpsc::UnboundedSender<ChatEvent>)>,
    first: Option<String>,
}

/// Connector that multiplexes stdin across device sessions.
pub struct ConsoleConnector {
    routes: Arc<Mutex<Routes>>,
    reader: Once,
}

impl std::fmt::Debug for ConsoleConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleConnector").finish_non_exhaustive()
    }
}

impl Default for ConsoleConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleConnector {
    /// Create a connector. The stdin reader starts on the first connect.
    pub fn new() -> Self {
        Self {
            routes: Arc::new(Mutex::new(Routes::default())),
            reader: Once::new(),
        }
    }

    fn start_reader(&self) {
        let routes = Arc::clone(&self.routes);
        self.reader.call_once(move || {
            tokio::spawn(async move {
                let mut lines = BufReader::new(tokio::io::stdin()).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => route_line(&routes, &line),
                        Ok(None) => {
                            debug!("console input closed");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "console input failed");
                            break;
                        }
                    }
                }
            });
        });
    }
}

/// Split `@device text` into its parts.
fn split_target(line: &str) -> (Option<&str>, &str) {
    match line.strip_prefix('@') {
        Some(rest) => match rest.split_once(char::is_whitespace) {
            Some((device, text)) => (Some(device), text.trim_start()),
            None => (Some(rest), ""),
        },
        None => (None, line),
    }
}

fn route_line(routes: &Mutex<Routes>, line: &str) {
    let routes = routes
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let (target, text) = split_target(line);
    let device = match target {
        Some(device) => Some(device.to_owned()),
        None => routes.first.clone(),
    };
    let Some(device) = device else {
        warn!("no console session connected yet");
        return;
    };
    match routes.devices.get(&device) {
        Some((peer, tx)) => {
            let event = ChatEvent::Message {
                from: peer.clone(),
                body: text.to_owned(),
            };
            if tx.send(event).is_err() {
                debug!(device = %device, "console session already closed");
            }
        }
        None => warn!(device = %device, "no such console device"),
    }
}

#[async_trait]
impl ChatConnector for ConsoleConnector {
    async fn connect(
        &self,
        device_id: &str,
        device: &DeviceConfig,
    ) -> Result<Box<dyn ChatSession>, ChatError> {
        let peer = device
            .xmpp_receiver
            .clone()
            .ok_or_else(|| ChatError::Connect("no receiver configured".to_owned()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(ChatEvent::SessionStart)
            .map_err(|_| ChatError::Closed)?;
        {
            let mut routes = self
                .routes
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            routes
                .devices
                .insert(device_id.to_owned(), (peer, tx));
            if routes.first.is_none() {
                routes.first = Some(device_id.to_owned());
            }
        }
        self.start_reader();

        Ok(Box::new(ConsoleSession {
            device: device_id.to_owned(),
            routes: Arc::clone(&self.routes),
            rx,
            stdout: tokio::io::stdout(),
        }))
    }
}

/// One device's console session.
pub struct ConsoleSession {
    device: String,
    routes: Arc<Mutex<Routes>>,
    rx: mpsc::UnboundedReceiver<ChatEvent>,
    stdout: tokio::io::Stdout,
}

impl ConsoleSession {
    async fn print(&mut self, line: String) -> Result<(), ChatError> {
        self.stdout.write_all(line.as_bytes()).await?;
        self.stdout.write_all(b"\n").await?;
        self.stdout.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ChatSession for ConsoleSession {
    async fn wait_events(&mut self, timeout: Duration) -> Result<Vec<ChatEvent>, ChatError> {
        let first = match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => return Err(ChatError::Closed),
            Err(_) => return Ok(Vec::new()),
        };
        let mut events = vec![first];
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        Ok(events)
    }

    async fn send_message(
        &mut self,
        to: &str,
        body: &str,
        _subject: Option<&str>,
    ) -> Result<(), ChatError> {
        let line = format!("[{} -> {to}] {body}", self.device);
        self.print(line).await
    }

    async fn set_presence(&mut self, status: &str) -> Result<(), ChatError> {
        let line = format!("[{} presence] {status}", self.device);
        self.print(line).await
    }

    async fn fetch_roster(&mut self) -> Result<(), ChatError> {
        Ok(())
    }

    async fn auto_subscribe(&mut self, _enabled: bool) -> Result<(), ChatError> {
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ChatError> {
        let mut routes = self
            .routes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        routes.devices.remove(&self.device);
        if routes.first.as_deref() == Some(self.device.as_str()) {
            routes.first = routes.devices.keys().next().cloned();
        }
        Ok(())
    }
}
