//! Tests for `src/worker/mod.rs`: routing and command state machine.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use smstoxmpp::bus::{Bus, ContactQuery, Envelope, Partition, ReceiveMode};
use smstoxmpp::chat::ChatEvent;
use smstoxmpp::config::{DeviceConfig, Timings};
use smstoxmpp::gateway::{Addressing, GatewayAddress};
use smstoxmpp::worker::{DeviceWorker, WorkerContext, WorkerError, WorkerState, FAREWELL, REFUSAL};

use crate::support::{device_config, FakeConnector, FakeGateways, Sent, PEER};

const DEVICE: &str = "phone1";

struct Harness {
    bus: Arc<Bus>,
    chats: Arc<FakeConnector>,
    gateways: Arc<FakeGateways>,
    ctx: WorkerContext,
}

impl Harness {
    fn new(contacts_enabled: bool) -> Self {
        let bus = Arc::new(Bus::default());
        let chats = FakeConnector::new();
        let gateways = FakeGateways::new();
        let ctx = WorkerContext {
            bus: Arc::clone(&bus),
            connector: Arc::clone(&chats) as Arc<dyn smstoxmpp::chat::ChatConnector>,
            registry: gateways.registry(),
            timings: Timings {
                event_wait: Duration::from_millis(10),
                contacts_timeout: Duration::from_millis(30),
                ..Timings::default()
            },
            contacts_enabled,
        };
        Self {
            bus,
            chats,
            gateways,
            ctx,
        }
    }

    async fn worker(&self, path: &str) -> DeviceWorker {
        DeviceWorker::connect(DEVICE, device_config(path), &self.ctx)
            .await
            .expect("worker should connect")
    }
}

fn inbound(phone: &str, body: &str) -> Envelope {
    Envelope::InboundSms {
        device: DEVICE.to_owned(),
        phone: phone.to_owned(),
        body: body.to_owned(),
        source_ip: None,
    }
}

fn chat_message(body: &str) -> ChatEvent {
    ChatEvent::Message {
        from: PEER.to_owned(),
        body: body.to_owned(),
    }
}

const SWITCH_TO_1: &str = "Chat target has changed, you are now talking to +640000001, all unaddressed replies will go to this recipient.";

#[tokio::test]
async fn missing_receiver_is_fatal_to_the_worker() {
    let harness = Harness::new(false);
    let mut config = (*device_config("auto")).clone();
    config.xmpp_receiver = None;
    let result = DeviceWorker::connect(DEVICE, Arc::new(config), &harness.ctx).await;
    assert!(matches!(
        result,
        Err(WorkerError::MissingSetting("xmpp_receiver"))
    ));
}

#[tokio::test]
async fn missing_server_is_reported_before_connecting() {
    let harness = Harness::new(false);
    let config = DeviceConfig {
        xmpp_server: None,
        ..(*device_config("auto")).clone()
    };
    let result = DeviceWorker::connect(DEVICE, Arc::new(config), &harness.ctx).await;
    assert!(matches!(result, Err(WorkerError::MissingSetting("xmpp_server"))));
    assert!(harness.chats.state(DEVICE).sent().is_empty());
}

#[tokio::test]
async fn first_inbound_sets_target_without_announcement() {
    let harness = Harness::new(false);
    let mut worker = harness.worker("auto").await;
    assert_eq!(worker.state(), WorkerState::Connecting);

    worker.handle_bus_message(inbound("+640000000", "hello")).await;

    assert_eq!(worker.conversation_target(), Some("+640000000"));
    assert_eq!(
        harness.chats.state(DEVICE).sent(),
        vec![Sent {
            to: PEER.to_owned(),
            body: "+640000000: hello".to_owned(),
            subject: Some("+640000000".to_owned()),
        }]
    );
}

#[tokio::test]
async fn new_sender_is_announced_once() {
    let harness = Harness::new(false);
    let mut worker = harness.worker("auto").await;

    worker.handle_bus_message(inbound("+640000000", "hello")).await;
    worker.handle_bus_message(inbound("+640000001", "second")).await;
    worker.handle_bus_message(inbound("+640000001", "third")).await;

    assert_eq!(
        harness.chats.state(DEVICE).bodies(),
        vec![
            "+640000000: hello".to_owned(),
            SWITCH_TO_1.to_owned(),
            "+640000001: second".to_owned(),
            "+640000001: third".to_owned(),
        ]
    );
    assert_eq!(worker.conversation_target(), Some("+640000001"));
}

#[tokio::test]
async fn chat_command_sets_target_for_unaddressed_text() {
    let harness = Harness::new(false);
    let mut worker = harness.worker("10.0.0.5:9090").await;

    worker
        .handle_chat_event(chat_message("_chat +64 000-0002"))
        .await;
    assert_eq!(worker.conversation_target(), Some("+640000002"));
    let bodies = harness.chats.state(DEVICE).bodies();
    assert_eq!(bodies.len(), 1);
    assert!(bodies[0].contains("+640000002"));

    worker.handle_chat_event(chat_message("are you there?")).await;
    assert_eq!(
        harness.gateways.state(DEVICE).sent(),
        vec![("+640000002".to_owned(), "are you there?".to_owned())]
    );
}

#[tokio::test]
async fn unauthorized_sender_is_refused() {
    let harness = Harness::new(false);
    let mut worker = harness.worker("auto").await;

    worker
        .handle_chat_event(ChatEvent::Message {
            from: "stranger@example.com/phone".to_owned(),
            body: "+640000000: hi".to_owned(),
        })
        .await;

    assert_eq!(
        harness.chats.state(DEVICE).sent(),
        vec![Sent {
            to: "stranger@example.com/phone".to_owned(),
            body: REFUSAL.to_owned(),
            subject: None,
        }]
    );
    assert!(harness.gateways.state(DEVICE).sent().is_empty());
}

#[tokio::test]
async fn resource_qualified_peer_is_refused() {
    let harness = Harness::new(false);
    let mut worker = harness.worker("auto").await;
    worker
        .handle_chat_event(ChatEvent::Message {
            from: format!("{PEER}/laptop"),
            body: "+640000001: hi".to_owned(),
        })
        .await;

    assert_eq!(
        harness.chats.state(DEVICE).sent(),
        vec![Sent {
            to: format!("{PEER}/laptop"),
            body: REFUSAL.to_owned(),
            subject: None,
        }]
    );
    assert_eq!(worker.conversation_target(), None);
    assert!(harness.gateways.state(DEVICE).sent().is_empty());
}

#[tokio::test]
async fn exact_peer_address_is_accepted() {
    let harness = Harness::new(false);
    let mut worker = harness.worker("auto").await;
    worker.handle_chat_event(chat_message("_version")).await;
    let bodies = harness.chats.state(DEVICE).bodies();
    assert_eq!(bodies, vec![smstoxmpp::app::identity()]);
}

#[tokio::test]
async fn text_without_destination_asks_for_one() {
    let harness = Harness::new(false);
    let mut worker = harness.worker("auto").await;
    worker.handle_chat_event(chat_message("hello")).await;

    let bodies = harness.chats.state(DEVICE).bodies();
    assert_eq!(bodies.len(), 1);
    assert!(bodies[0].contains("no destination specified"));
    assert!(harness.gateways.state(DEVICE).sent().is_empty());
}

#[tokio::test]
async fn prefixed_text_switches_target_and_sends() {
    let harness = Harness::new(false);
    let mut worker = harness.worker("auto").await;
    worker
        .handle_chat_event(chat_message("+640000001: see you at 5"))
        .await;

    assert_eq!(worker.conversation_target(), Some("+640000001"));
    assert_eq!(harness.chats.state(DEVICE).bodies(), vec![SWITCH_TO_1.to_owned()]);
    assert_eq!(
        harness.gateways.state(DEVICE).sent(),
        vec![("+640000001".to_owned(), "see you at 5".to_owned())]
    );
    assert_eq!(
        harness.gateways.state(DEVICE).forced_probes.load(Ordering::SeqCst),
        1
    );
}

#[tokio::test]
async fn empty_text_is_dropped_silently() {
    let harness = Harness::new(false);
    let mut worker = harness.worker("auto").await;
    worker.handle_chat_event(chat_message("   ")).await;

    assert!(harness.chats.state(DEVICE).sent().is_empty());
    assert_eq!(
        harness.gateways.state(DEVICE).forced_probes.load(Ordering::SeqCst),
        0
    );
}

#[tokio::test]
async fn unhealthy_gateway_drops_message_with_notice() {
    let harness = Harness::new(false);
    let mut worker = harness.worker("auto").await;
    harness.gateways.state(DEVICE).set_healthy(false);

    worker
        .handle_chat_event(chat_message("+640000001: anyone?"))
        .await;

    let bodies = harness.chats.state(DEVICE).bodies();
    assert_eq!(bodies.len(), 1);
    assert!(bodies[0].contains("currently unreachable"));
    assert!(harness.gateways.state(DEVICE).sent().is_empty());
    assert_eq!(worker.conversation_target(), None);
}

#[tokio::test]
async fn failed_send_is_reported() {
    let harness = Harness::new(false);
    let mut worker = harness.worker("auto").await;
    worker.handle_bus_message(inbound("+640000000", "hi")).await;
    harness.chats.state(DEVICE).clear_sent();
    harness
        .gateways
        .state(DEVICE)
        .fail_send
        .store(true, Ordering::SeqCst);

    worker.handle_chat_event(chat_message("reply")).await;

    let bodies = harness.chats.state(DEVICE).bodies();
    assert_eq!(bodies.len(), 1);
    assert!(bodies[0].starts_with("Message to +640000000 could not be delivered"));
}

#[tokio::test]
async fn health_check_command_forces_a_probe() {
    let harness = Harness::new(false);
    let mut worker = harness.worker("auto").await;
    worker.handle_chat_event(chat_message("_health_check")).await;
    harness.gateways.state(DEVICE).set_healthy(false);
    worker.handle_chat_event(chat_message("_health_check")).await;

    let bodies = harness.chats.state(DEVICE).bodies();
    assert!(bodies[0].starts_with("Health check succeeded"));
    assert!(bodies[1].starts_with("Health check failed"));
    assert_eq!(
        harness.gateways.state(DEVICE).forced_probes.load(Ordering::SeqCst),
        2
    );
}

#[tokio::test]
async fn help_is_multi_line() {
    let harness = Harness::new(false);
    let mut worker = harness.worker("auto").await;
    worker.handle_chat_event(chat_message("_help")).await;
    let bodies = harness.chats.state(DEVICE).bodies();
    assert!(bodies.len() > 3);
    assert_eq!(bodies[0], smstoxmpp::app::identity());
}

#[tokio::test]
async fn dynamic_gateway_learns_address_from_inbound_source() {
    let harness = Harness::new(false);
    let mut worker = harness.worker("auto").await;
    assert_eq!(worker.gateway().addressing(), Addressing::Dynamic);

    worker
        .handle_bus_message(Envelope::InboundSms {
            device: DEVICE.to_owned(),
            phone: "+640000000".to_owned(),
            body: "hi".to_owned(),
            source_ip: Some("10.0.0.7".to_owned()),
        })
        .await;

    assert_eq!(
        harness.gateways.state(DEVICE).address(),
        Some(GatewayAddress {
            host: "10.0.0.7".to_owned(),
            port: 9090,
        })
    );
}

#[tokio::test]
async fn static_gateway_ignores_inbound_source() {
    let harness = Harness::new(false);
    let mut worker = harness.worker("192.168.1.2:8000").await;
    worker
        .handle_bus_message(Envelope::InboundSms {
            device: DEVICE.to_owned(),
            phone: "+640000000".to_owned(),
            body: "hi".to_owned(),
            source_ip: Some("10.0.0.7".to_owned()),
        })
        .await;
    assert_eq!(
        worker.gateway().address().map(|a| a.host.as_str()),
        Some("192.168.1.2")
    );
}

#[tokio::test]
async fn session_start_greets_the_peer() {
    let harness = Harness::new(false);
    let mut worker = harness.worker("auto").await;
    worker.handle_chat_event(ChatEvent::SessionStart).await;

    let chat = harness.chats.state(DEVICE);
    assert!(chat.roster_fetched.load(Ordering::SeqCst));
    assert!(chat.auto_subscribed.load(Ordering::SeqCst));
    assert_eq!(chat.presence(), vec!["SMStoXMPP connected to phone1".to_owned()]);
    assert_eq!(
        chat.bodies(),
        vec![
            format!("{} started", smstoxmpp::app::identity()),
            "Type \"_help\" for usage and option information".to_owned(),
        ]
    );
    assert_eq!(worker.last_announced_status(), Some("SMStoXMPP connected to phone1"));
}

#[tokio::test]
async fn invalid_gateway_path_is_reported_on_session_start() {
    let harness = Harness::new(false);
    let mut worker = harness.worker("1.2.3.4:notaport").await;
    worker.handle_chat_event(ChatEvent::SessionStart).await;
    let bodies = harness.chats.state(DEVICE).bodies();
    assert_eq!(bodies.len(), 3);
    assert!(bodies[2].contains("1.2.3.4:notaport"));
}

#[tokio::test]
async fn lookup_timeout_falls_back_to_raw_number() {
    let harness = Harness::new(true);
    let mut worker = harness.worker("auto").await;
    worker.handle_bus_message(inbound("+640000000", "hello")).await;

    assert_eq!(
        harness.chats.state(DEVICE).bodies(),
        vec!["+640000000: hello".to_owned()]
    );
    // The unanswered request is still queued for a resolver.
    assert_eq!(harness.bus.pending(Partition::ContactsRequest), 1);
}

#[tokio::test]
async fn lookup_reply_names_the_sender() {
    let harness = Harness::new(true);
    let bus = Arc::clone(&harness.bus);
    let responder = tokio::spawn(async move {
        let request = bus
            .receive(Partition::ContactsRequest, ReceiveMode::Wait(Duration::from_secs(5)))
            .await
            .expect("receive")
            .expect("a request");
        let Envelope::ContactRequest {
            requester_id,
            query: ContactQuery::PhoneLookup { phone },
        } = request
        else {
            panic!("expected a phone lookup, got {request:?}");
        };
        assert_eq!(phone, "+640000000");
        bus.publish(
            Partition::ContactsResponse(requester_id),
            &Envelope::ContactResponse {
                query: ContactQuery::PhoneLookup { phone },
                name: "Alice".to_owned(),
                label: "Mobile".to_owned(),
            },
        )
        .expect("publish");
    });

    let mut timings = harness.ctx.timings;
    timings.contacts_timeout = Duration::from_secs(2);
    let ctx = WorkerContext {
        timings,
        ..harness.ctx.clone()
    };
    let mut worker = DeviceWorker::connect(DEVICE, device_config("auto"), &ctx)
        .await
        .expect("worker should connect");

    worker.handle_bus_message(inbound("+640000000", "hello")).await;
    responder.await.expect("responder");

    assert_eq!(
        harness.chats.state(DEVICE).bodies(),
        vec!["Alice (Mobile): hello".to_owned()]
    );
}

#[tokio::test]
async fn chat_by_name_leaves_search_pending() {
    let harness = Harness::new(true);
    let mut worker = harness.worker("auto").await;
    worker.handle_chat_event(chat_message("_chat Alice Smith")).await;

    assert_eq!(worker.pending_search(), Some("Alice Smith"));
    assert_eq!(worker.conversation_target(), None);
    let request = harness
        .bus
        .receive(Partition::ContactsRequest, ReceiveMode::Poll)
        .await
        .expect("receive");
    assert!(matches!(
        request,
        Some(Envelope::ContactRequest {
            query: ContactQuery::Search { .. },
            ..
        })
    ));
}

#[tokio::test]
async fn find_without_answer_stays_quiet() {
    let harness = Harness::new(true);
    let mut worker = harness.worker("auto").await;
    worker.handle_chat_event(chat_message("_find Alice")).await;
    assert!(harness.chats.state(DEVICE).sent().is_empty());
}

#[tokio::test]
async fn run_exits_on_shutdown_with_farewell() {
    let harness = Harness::new(false);
    let worker = harness.worker("auto").await;
    let chat = harness.chats.state(DEVICE);
    chat.push(ChatEvent::SessionStart);
    harness
        .bus
        .publish(Partition::for_device(DEVICE), &inbound("+640000000", "hello"))
        .expect("publish");

    let handle = tokio::spawn(worker.run());
    assert!(
        crate::support::eventually(Duration::from_secs(2), || chat
            .bodies()
            .contains(&"+640000000: hello".to_owned()))
        .await
    );

    harness
        .bus
        .publish(Partition::Control, &Envelope::shutdown())
        .expect("publish");
    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("worker should exit")
        .expect("worker task");
    assert!(result.is_ok());
    assert_eq!(chat.bodies().last().map(String::as_str), Some(FAREWELL));
    assert!(chat.disconnected.load(Ordering::SeqCst));
    assert_eq!(harness.bus.pending(Partition::Control), 0);
}

#[tokio::test]
async fn health_change_updates_presence() {
    let harness = Harness::new(false);
    let worker = harness.worker("auto").await;
    let chat = harness.chats.state(DEVICE);
    chat.push(ChatEvent::SessionStart);

    let handle = tokio::spawn(worker.run());
    assert!(
        crate::support::eventually(Duration::from_secs(2), || chat.presence().len() == 1).await
    );
    harness.gateways.state(DEVICE).set_healthy(false);
    assert!(
        crate::support::eventually(Duration::from_secs(2), || chat.presence().len() == 2).await
    );
    assert!(chat.presence()[1].contains("unreachable"));

    harness
        .bus
        .publish(Partition::Control, &Envelope::shutdown())
        .expect("publish");
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("worker should exit")
        .expect("worker task")
        .expect("clean exit");
}

#[tokio::test]
async fn health_is_checked_before_the_session_starts() {
    let harness = Harness::new(false);
    let worker = harness.worker("auto").await;
    let chat = harness.chats.state(DEVICE);
    let gateway = harness.gateways.state(DEVICE);

    let handle = tokio::spawn(worker.run());
    assert!(
        crate::support::eventually(Duration::from_secs(2), || {
            gateway.checks.load(Ordering::SeqCst) >= 2
        })
        .await
    );
    assert!(chat.presence().is_empty());
    assert_eq!(gateway.forced_probes.load(Ordering::SeqCst), 0);

    chat.push(ChatEvent::SessionStart);
    assert!(
        crate::support::eventually(Duration::from_secs(2), || chat.presence().len() == 1).await
    );

    harness
        .bus
        .publish(Partition::Control, &Envelope::shutdown())
        .expect("publish");
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("worker should exit")
        .expect("worker task")
        .expect("clean exit");
}
