//! Android SMS Gateway (`eu.apksoft.android.smsgateway`).
//!
//! Push-style device: it delivers SMS by calling the HTTP listener with
//! `phone` and `text` query parameters, and accepts outbound SMS on
//! `GET http://<device>/sendsms?phone=..&text=..`.
//!
//! The device may sit behind NAT or change address, so its path is either
//! static (`host:port`) or learned from the first inbound request
//! (`auto`/`dynamic`).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use super::health::{probe_tcp, HealthMemo};
use super::{
    parse_gateway_path, Addressing, GatewayAdapter, GatewayAddress, GatewayContext, GatewayError,
    GatewayPath, InboundRecord,
};
use crate::logging::LogHandle;

/// Registry tag.
pub const TYPE_TAG: &str = "eu.apksoft.android.smsgateway";

/// Short registry alias.
pub const TYPE_ALIAS: &str = "android";

/// HTTP request timeout for outbound delivery.
const SEND_TIMEOUT_SECS: u64 = 15;

/// Adapter for the Android SMS Gateway app.
pub struct AndroidSmsGateway {
    device: String,
    log: LogHandle,
    address: Option<GatewayAddress>,
    addressing: Addressing,
    health: HealthMemo,
    client: reqwest::Client,
}

impl std::fmt::Debug for AndroidSmsGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AndroidSmsGateway")
            .field("device", &self.device)
            .field("address", &self.address)
            .field("addressing", &self.addressing)
            .finish_non_exhaustive()
    }
}

impl AndroidSmsGateway {
    /// Create an adapter with no address yet.
    pub fn new(ctx: GatewayContext) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(SEND_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            device: ctx.device,
            log: ctx.log,
            address: None,
            addressing: Addressing::Dynamic,
            health: HealthMemo::new(
                ctx.timings.health_check_frequency,
                ctx.timings.health_check_timeout,
            ),
            client,
        }
    }

    /// Number of network probes performed.
    pub fn probe_count(&self) -> u64 {
        self.health.probes()
    }

    fn send_url(address: &GatewayAddress, phone: &str, body: &str) -> Result<Url, GatewayError> {
        let mut url = Url::parse(&format!("http://{}:{}/sendsms", address.host, address.port))
            .map_err(|e| GatewayError::Delivery(format!("bad device address: {e}")))?;
        url.query_pairs_mut()
            .append_pair("phone", phone)
            .append_pair("text", body);
        Ok(url)
    }
}

#[async_trait]
impl GatewayAdapter for AndroidSmsGateway {
    fn resolve_path(&mut self, path: &str) -> Result<Addressing, GatewayError> {
        match parse_gateway_path(path)? {
            GatewayPath::Deferred => {
                self.addressing = Addressing::Dynamic;
                self.log.debug(format!(
                    "[{}] gateway address deferred until the device reports in",
                    self.device
                ));
            }
            GatewayPath::Static(address) => {
                self.addressing = Addressing::Static;
                self.set_address(&address.host, address.port);
            }
        }
        Ok(self.addressing)
    }

    fn set_address(&mut self, host: &str, port: u16) {
        let unchanged = self
            .address
            .as_ref()
            .is_some_and(|current| current.host == host && current.port == port);
        if unchanged {
            return;
        }
        self.address = Some(GatewayAddress {
            host: host.to_owned(),
            port,
        });
        self.health.reset();
        self.log.info(format!(
            "[{}] updated device address to {host}:{port}",
            self.device
        ));
    }

    fn address(&self) -> Option<&GatewayAddress> {
        self.address.as_ref()
    }

    fn addressing(&self) -> Addressing {
        self.addressing
    }

    async fn health_check(&mut self, force: bool) -> bool {
        if !self.health.is_due(force) {
            return self.health.healthy();
        }

        let Some(address) = self.address.clone() else {
            self.log.debug(format!(
                "[{}] health check failed, gateway address is unknown",
                self.device
            ));
            self.health.record(false);
            return false;
        };

        let healthy = probe_tcp(&address.host, address.port, self.health.timeout()).await;
        self.health.record_probe(healthy);
        if healthy {
            self.log
                .debug(format!("[{}] health check succeeded", self.device));
        } else {
            self.log.debug(format!(
                "[{}] health check failed, unable to connect to {}:{}",
                self.device, address.host, address.port
            ));
        }
        healthy
    }

    async fn send(&mut self, phone: &str, body: &str) -> Result<(), GatewayError> {
        let address = self.address.as_ref().ok_or(GatewayError::NoAddress)?;
        self.log.debug(format!(
            "[{}] sending message to \"{phone}\"",
            self.device
        ));

        let url = Self::send_url(address, phone, body)?;
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Delivery(format!(
                "device answered HTTP {status}"
            )));
        }
        Ok(())
    }

    fn listen(&self, params: &HashMap<String, String>) -> Option<InboundRecord> {
        let phone = params.get("phone").filter(|v| !v.is_empty())?;
        let body = params.get("text").filter(|v| !v.is_empty())?;
        Some(InboundRecord {
            phone: phone.clone(),
            body: body.clone(),
        })
    }
}
