//! XMPP chat sessions over `tokio-xmpp`.
//!
//! One client per device, logged in as `<username>@<domain>/<device>` and
//! connected to `xmpp_server:xmpp_port` with STARTTLS. The domain defaults
//! to the server host.
//!
//! Stanza mapping:
//! - bound session -> [`ChatEvent::SessionStart`]
//! - `<message>` with a body -> [`ChatEvent::Message`]
//! - `<presence>` -> [`ChatEvent::Presence`], or a subscription answer when
//!   auto-subscribe is on
//! - disconnect -> [`ChatEvent::StreamEnd`]

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_xmpp::connect::DnsConfig;
use tokio_xmpp::jid::Jid;
use tokio_xmpp::parsers::iq::Iq;
use tokio_xmpp::parsers::message::Message;
use tokio_xmpp::parsers::minidom::Element;
use tokio_xmpp::parsers::presence::Presence;
use tokio_xmpp::xmlstream::Timeouts;
use tokio_xmpp::{Client, Event, Stanza};
use tracing::debug;

use super::{bare_address, ChatConnector, ChatError, ChatEvent, ChatSession};
use crate::config::DeviceConfig;

const CLIENT_NS: &str = "jabber:client";
const ROSTER_NS: &str = "jabber:iq:roster";

/// What an inbound stanza asks of the session.
#[derive(Debug, PartialEq, Eq)]
enum Inbound {
    Event(ChatEvent),
    /// A contact asked to subscribe to our presence.
    SubscribeRequest(String),
    Ignore,
}

/// Connector that logs every device in to its own XMPP account.
#[derive(Debug, Default)]
pub struct XmppConnector;

impl XmppConnector {
    /// Create a connector.
    pub fn new() -> Self {
        Self
    }
}

/// Account address `<username>@<domain>/<device>`.
fn account_jid(device_id: &str, device: &DeviceConfig) -> Result<Jid, ChatError> {
    let server = device
        .xmpp_server
        .as_deref()
        .filter(|server| !server.is_empty())
        .ok_or_else(|| ChatError::Connect("no server configured".to_owned()))?;
    let username = device
        .xmpp_username
        .as_deref()
        .filter(|username| !username.is_empty())
        .ok_or_else(|| ChatError::Connect("no username configured".to_owned()))?;
    let domain = device
        .xmpp_domain
        .as_deref()
        .filter(|domain| !domain.is_empty())
        .unwrap_or(server);
    Jid::new(&format!("{username}@{domain}/{device_id}"))
        .map_err(|e| ChatError::Connect(format!("invalid account address: {e}")))
}

#[async_trait]
impl ChatConnector for XmppConnector {
    async fn connect(
        &self,
        device_id: &str,
        device: &DeviceConfig,
    ) -> Result<Box<dyn ChatSession>, ChatError> {
        let jid = account_jid(device_id, device)?;
        let server = device.xmpp_server.clone().unwrap_or_default();
        debug!(device = device_id, %jid, server = %server, port = device.xmpp_port, "opening xmpp session");
        let client = Client::new_starttls(
            jid,
            device.xmpp_password.clone(),
            DnsConfig::no_srv(&server, device.xmpp_port),
            Timeouts::default(),
        );
        Ok(Box::new(XmppSession {
            device: device_id.to_owned(),
            client,
            auto_subscribe: false,
            next_id: 0,
        }))
    }
}

/// One device's XMPP session.
pub struct XmppSession {
    device: String,
    client: Client,
    auto_subscribe: bool,
    next_id: u64,
}

impl std::fmt::Debug for XmppSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XmppSession")
            .field("device", &self.device)
            .field("auto_subscribe", &self.auto_subscribe)
            .finish_non_exhaustive()
    }
}

impl XmppSession {
    async fn send(&mut self, stanza: Stanza) -> Result<(), ChatError> {
        self.client
            .send_stanza(stanza)
            .await
            .map_err(|e| ChatError::Send(e.to_string()))?;
        Ok(())
    }

    async fn send_presence(&mut self, xml: &str) -> Result<(), ChatError> {
        let presence = Presence::try_from(parse(xml)?)
            .map_err(|e| ChatError::Send(format!("bad presence: {e}")))?;
        self.send(presence.into()).await
    }

    /// Answer a subscription request and subscribe back.
    async fn accept_subscription(&mut self, from: &str) -> Result<(), ChatError> {
        let contact = bare_address(from).to_owned();
        debug!(device = %self.device, contact = %contact, "accepting subscription");
        self.send_presence(&subscription_xml(&contact, "subscribed"))
            .await?;
        self.send_presence(&subscription_xml(&contact, "subscribe"))
            .await
    }

    /// Turn one client event into at most one worker event.
    async fn handle(&mut self, event: Event) -> Result<Option<ChatEvent>, ChatError> {
        let element = match event {
            Event::Online { bound_jid, .. } => {
                debug!(device = %self.device, jid = %bound_jid, "xmpp session online");
                return Ok(Some(ChatEvent::SessionStart));
            }
            Event::Disconnected(e) => {
                debug!(device = %self.device, error = %e, "xmpp session disconnected");
                return Ok(Some(ChatEvent::StreamEnd));
            }
            Event::Stanza(Stanza::Message(message)) => Element::from(message),
            Event::Stanza(Stanza::Presence(presence)) => Element::from(presence),
            Event::Stanza(Stanza::Iq(_)) => {
                debug!(device = %self.device, "iq stanza ignored");
                return Ok(None);
            }
        };
        match classify(&element, self.auto_subscribe) {
            Inbound::Event(event) => Ok(Some(event)),
            Inbound::SubscribeRequest(from) => {
                self.accept_subscription(&from).await?;
                Ok(None)
            }
            Inbound::Ignore => Ok(None),
        }
    }
}

#[async_trait]
impl ChatSession for XmppSession {
    async fn wait_events(&mut self, timeout: Duration) -> Result<Vec<ChatEvent>, ChatError> {
        let Some(deadline) = tokio::time::Instant::now().checked_add(timeout) else {
            return Ok(Vec::new());
        };
        loop {
            let event = match tokio::time::timeout_at(deadline, self.client.next()).await {
                Ok(Some(event)) => event,
                Ok(None) => return Err(ChatError::Closed),
                Err(_) => return Ok(Vec::new()),
            };
            if let Some(event) = self.handle(event).await? {
                return Ok(vec![event]);
            }
        }
    }

    async fn send_message(
        &mut self,
        to: &str,
        body: &str,
        subject: Option<&str>,
    ) -> Result<(), ChatError> {
        let message = Message::try_from(parse(&message_xml(to, body, subject))?)
            .map_err(|e| ChatError::Send(format!("bad message: {e}")))?;
        self.send(message.into()).await
    }

    async fn set_presence(&mut self, status: &str) -> Result<(), ChatError> {
        self.send_presence(&presence_xml(status)).await
    }

    async fn fetch_roster(&mut self) -> Result<(), ChatError> {
        self.next_id = self.next_id.saturating_add(1);
        let iq = Iq::try_from(parse(&roster_xml(self.next_id))?)
            .map_err(|e| ChatError::Send(format!("bad roster request: {e}")))?;
        self.send(iq.into()).await
    }

    async fn auto_subscribe(&mut self, enabled: bool) -> Result<(), ChatError> {
        self.auto_subscribe = enabled;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ChatError> {
        self.client
            .send_end()
            .await
            .map_err(|e| ChatError::Send(e.to_string()))
    }
}

/// Map an inbound `<message>` or `<presence>` element.
fn classify(element: &Element, auto_subscribe: bool) -> Inbound {
    let Some(from) = element.attr("from").map(str::to_owned) else {
        return Inbound::Ignore;
    };
    match element.name() {
        "message" => {
            if element.attr("type") == Some("error") {
                return Inbound::Ignore;
            }
            match element.get_child("body", CLIENT_NS) {
                Some(body) => Inbound::Event(ChatEvent::Message {
                    from,
                    body: body.text(),
                }),
                None => Inbound::Ignore,
            }
        }
        "presence" => match element.attr("type") {
            Some("subscribe") if auto_subscribe => Inbound::SubscribeRequest(from),
            None | Some("unavailable") => Inbound::Event(ChatEvent::Presence {
                from,
                status: element.get_child("status", CLIENT_NS).map(Element::text),
            }),
            Some(_) => Inbound::Ignore,
        },
        _ => Inbound::Ignore,
    }
}

fn parse(xml: &str) -> Result<Element, ChatError> {
    xml.parse::<Element>()
        .map_err(|e| ChatError::Send(format!("unparsable stanza: {e}")))
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

fn message_xml(to: &str, body: &str, subject: Option<&str>) -> String {
    let subject = subject
        .map(|subject| format!("<subject>{}</subject>", escape(subject)))
        .unwrap_or_default();
    format!(
        "<message xmlns='{CLIENT_NS}' to='{}' type='chat'>{subject}<body>{}</body></message>",
        escape(to),
        escape(body)
    )
}

fn presence_xml(status: &str) -> String {
    format!(
        "<presence xmlns='{CLIENT_NS}'><status>{}</status></presence>",
        escape(status)
    )
}

fn subscription_xml(to: &str, kind: &str) -> String {
    format!(
        "<presence xmlns='{CLIENT_NS}' to='{}' type='{kind}'/>",
        escape(to)
    )
}

fn roster_xml(id: u64) -> String {
    format!("<iq xmlns='{CLIENT_NS}' type='get' id='roster-{id}'><query xmlns='{ROSTER_NS}'/></iq>")
}
