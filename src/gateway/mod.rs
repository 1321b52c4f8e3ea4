//! SMS gateway adapters.
//!
//! A [`GatewayAdapter`] bridges one device worker to one physical or remote
//! SMS endpoint. Each worker owns exactly one adapter, built at startup from
//! the [`GatewayRegistry`] using the device's configured type tag.

pub mod android;
pub mod health;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Timings;
use crate::logging::LogHandle;

/// Port assumed when a static path names only a host.
pub const DEFAULT_GATEWAY_PORT: u16 = 9090;

/// How the adapter learns where its device is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    /// Address comes from configuration and never changes.
    Static,
    /// Address is learned from the source of inbound messages.
    Dynamic,
}

/// Network location of a gateway device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayAddress {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

/// An SMS parsed from an inbound push request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRecord {
    /// Sender phone number, as received.
    pub phone: String,
    /// Message text, as received.
    pub body: String,
}

/// Errors produced by gateway adapters and the registry.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The configured path is empty.
    #[error("gateway path is empty")]
    EmptyPath,
    /// The configured path is not `auto`, `dynamic` or `host[:port]`.
    #[error("invalid gateway path: {0}")]
    InvalidPath(String),
    /// No adapter is registered for the tag.
    #[error("unknown gateway type: {0}")]
    UnknownType(String),
    /// The device address has not been learned yet.
    #[error("gateway address is unknown")]
    NoAddress,
    /// The device refused or failed the delivery.
    #[error("delivery failed: {0}")]
    Delivery(String),
    /// HTTP request to the device failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Capability set every gateway variant provides.
#[async_trait]
pub trait GatewayAdapter: Send {
    /// Validate the configured path. Static paths set the address right
    /// away; `auto`/`dynamic` defer until the device announces itself.
    /// Never probes.
    fn resolve_path(&mut self, path: &str) -> Result<Addressing, GatewayError>;

    /// Point the adapter at `host:port`. No-op when unchanged; otherwise
    /// resets the health window.
    fn set_address(&mut self, host: &str, port: u16);

    /// Current address, if known.
    fn address(&self) -> Option<&GatewayAddress>;

    /// Addressing policy chosen by [`GatewayAdapter::resolve_path`].
    fn addressing(&self) -> Addressing;

    /// Memoized liveness check. Probes when `force` is set or the window
    /// has elapsed; an unknown address is always unhealthy.
    async fn health_check(&mut self, force: bool) -> bool;

    /// Deliver one SMS. The caller checks health first; failures are
    /// reported, never retried.
    async fn send(&mut self, phone: &str, body: &str) -> Result<(), GatewayError>;

    /// Parse an inbound push request's parameters. `None` when a required
    /// field is missing.
    fn listen(&self, params: &HashMap<String, String>) -> Option<InboundRecord>;
}

/// Parsed form of a gateway path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayPath {
    /// Wait for the device to announce its address.
    Deferred,
    /// Fixed address.
    Static(GatewayAddress),
}

/// Parse a configured gateway path.
///
/// # Errors
///
/// [`GatewayError::EmptyPath`] for an empty path,
/// [`GatewayError::InvalidPath`] when the host contains whitespace or the
/// port is not a number.
pub fn parse_gateway_path(path: &str) -> Result<GatewayPath, GatewayError> {
    if path.is_empty() {
        return Err(GatewayError::EmptyPath);
    }
    if path == "auto" || path == "dynamic" {
        return Ok(GatewayPath::Deferred);
    }

    let (host, port) = match path.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (path, None),
    };
    if host.is_empty() || host.chars().any(char::is_whitespace) {
        return Err(GatewayError::InvalidPath(path.to_owned()));
    }
    let port = match port {
        None => DEFAULT_GATEWAY_PORT,
        Some(port) => port
            .parse::<u16>()
            .map_err(|_| GatewayError::InvalidPath(path.to_owned()))?,
    };

    Ok(GatewayPath::Static(GatewayAddress {
        host: host.to_owned(),
        port,
    }))
}

/// Everything a gateway constructor gets.
#[derive(Debug, Clone)]
pub struct GatewayContext {
    /// Owning device identifier.
    pub device: String,
    /// Logging handle of the owning unit.
    pub log: LogHandle,
    /// Health window and probe timeout.
    pub timings: Timings,
}

/// Constructor stored in the registry.
pub type GatewayFactory = Arc<dyn Fn(GatewayContext) -> Box<dyn GatewayAdapter> + Send + Sync>;

/// Maps gateway type tags to constructors.
#[derive(Clone)]
pub struct GatewayRegistry {
    factories: HashMap<String, GatewayFactory>,
}

impl std::fmt::Debug for GatewayRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}

impl Default for GatewayRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl GatewayRegistry {
    /// Registry with no variants.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every variant shipped in this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        for tag in [android::TYPE_TAG, android::TYPE_ALIAS] {
            registry.register(tag, |ctx| {
                Box::new(android::AndroidSmsGateway::new(ctx)) as Box<dyn GatewayAdapter>
            });
        }
        registry
    }

    /// Add or replace the constructor for `tag`.
    pub fn register<F>(&mut self, tag: &str, factory: F)
    where
        F: Fn(GatewayContext) -> Box<dyn GatewayAdapter> + Send + Sync + 'static,
    {
        self.factories.insert(tag.to_owned(), Arc::new(factory));
    }

    /// Whether `tag` has a constructor.
    pub fn contains(&self, tag: &str) -> bool {
        self.factories.contains_key(tag)
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// Build an adapter for `tag`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnknownType`] for an unregistered tag.
    pub fn create(
        &self,
        tag: &str,
        ctx: GatewayContext,
    ) -> Result<Box<dyn GatewayAdapter>, GatewayError> {
        let factory = self
            .factories
            .get(tag)
            .ok_or_else(|| GatewayError::UnknownType(tag.to_owned()))?;
        Ok(factory(ctx))
    }
}
