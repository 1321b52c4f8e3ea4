//! HTTP listener for push-style gateway devices.
//!
//! Devices call `GET /listener?device=<id>&phone=<number>&text=<body>`
//! (or the same on `/`). The request is parsed by the device's gateway
//! type, validated, escaped and published on the device's bus partition.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use regex::Regex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::{Bus, Envelope, Partition};
use crate::config::Config;
use crate::gateway::{GatewayAdapter, GatewayContext, GatewayRegistry};
use crate::logging::LogHandle;

/// Body of a successful submission.
pub const SUCCESS: &str = "200/SUCCESS";

/// Body for an unknown device.
pub const NO_SUCH_DEVICE: &str = "Sorry, there is no such destination device.";

static PHONE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^\+?[0-9]+$").ok());

/// Shared handler state.
#[derive(Clone)]
pub struct ListenerState {
    bus: Arc<Bus>,
    parsers: Arc<HashMap<String, Mutex<Box<dyn GatewayAdapter>>>>,
}

impl std::fmt::Debug for ListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut devices: Vec<&String> = self.parsers.keys().collect();
        devices.sort_unstable();
        f.debug_struct("ListenerState")
            .field("devices", &devices)
            .finish_non_exhaustive()
    }
}

impl ListenerState {
    /// Build one request parser per configured device. Devices whose
    /// gateway type is unknown are skipped and answer as unknown devices.
    pub fn new(bus: Arc<Bus>, registry: Arc<GatewayRegistry>, config: &Config) -> Self {
        let log = LogHandle::new(Arc::clone(&bus), "listener");
        let timings = config.dispatcher.timings();
        let parsers = config
            .devices
            .iter()
            .filter_map(|(device, device_config)| {
                let ctx = GatewayContext {
                    device: device.clone(),
                    log: log.clone(),
                    timings,
                };
                match registry.create(&device_config.gateway_type, ctx) {
                    Ok(parser) => Some((device.clone(), Mutex::new(parser))),
                    Err(e) => {
                        warn!(device = %device, error = %e, "no request parser for device");
                        None
                    }
                }
            })
            .collect();
        Self {
            bus,
            parsers: Arc::new(parsers),
        }
    }
}

/// Routes of the listener.
pub fn router(state: ListenerState) -> Router {
    Router::new()
        .route("/", get(receive_sms))
        .route("/listener", get(receive_sms))
        .with_state(state)
}

/// Serve until `stop` flips.
///
/// # Errors
///
/// Returns the server's I/O error.
pub async fn serve(
    tcp: TcpListener,
    state: ListenerState,
    mut stop: watch::Receiver<bool>,
) -> std::io::Result<()> {
    if let Ok(addr) = tcp.local_addr() {
        info!(%addr, "listener accepting requests");
    }
    axum::serve(
        tcp,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        while !*stop.borrow() {
            if stop.changed().await.is_err() {
                break;
            }
        }
    })
    .await
}

async fn receive_sms(
    State(state): State<ListenerState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, String) {
    let device = params.get("device").map(String::as_str).unwrap_or_default();
    let Some(parser) = state.parsers.get(device) else {
        debug!(device, %peer, "request for unknown device");
        return (StatusCode::INTERNAL_SERVER_ERROR, NO_SUCH_DEVICE.to_owned());
    };

    let record = parser
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .listen(&params);
    let Some(record) = record else {
        return (
            StatusCode::BAD_REQUEST,
            "Missing phone or text.".to_owned(),
        );
    };
    if !PHONE.as_ref().is_some_and(|re| re.is_match(&record.phone)) {
        return (StatusCode::BAD_REQUEST, "Invalid phone number.".to_owned());
    }

    let envelope = Envelope::InboundSms {
        device: device.to_owned(),
        phone: record.phone,
        body: escape_body(&record.body),
        source_ip: Some(peer.ip().to_string()),
    };
    match state.bus.publish(Partition::for_device(device), &envelope) {
        Ok(()) => {
            debug!(device, %peer, "queued inbound SMS");
            (StatusCode::OK, SUCCESS.to_owned())
        }
        Err(e) => {
            warn!(device, error = %e, "failed to queue inbound SMS");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Unexpected failure attempting to deliver message to queue.".to_owned(),
            )
        }
    }
}

/// Escape text for chat transport.
pub fn escape_body(body: &str) -> String {
    let mut escaped = String::with_capacity(body.len());
    for c in body.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#039;"),
            other => escaped.push(other),
        }
    }
    escaped
}
