//! Tests for the requester side in `src/contacts/lookup.rs`.

use std::sync::Arc;
use std::time::Duration;

use smstoxmpp::bus::{Bus, ContactQuery, Envelope, Partition, ReceiveMode};
use smstoxmpp::contacts::lookup::{search, submit_search};
use smstoxmpp::contacts::{lookup_phone, ContactMatch};

/// Answer every request on the bus with `name` until the bus closes.
fn spawn_responder(bus: Arc<Bus>, name: &'static str) {
    tokio::spawn(async move {
        while let Ok(received) = bus
            .receive(Partition::ContactsRequest, ReceiveMode::Block)
            .await
        {
            if let Some(Envelope::ContactRequest {
                requester_id,
                query,
            }) = received
            {
                let reply = Envelope::ContactResponse {
                    query,
                    name: name.to_owned(),
                    label: "mobile".to_owned(),
                };
                let _ = bus.publish(Partition::ContactsResponse(requester_id), &reply);
            }
        }
    });
}

#[tokio::test]
async fn no_resolver_means_none_after_timeout() {
    let bus = Bus::default();
    let started = tokio::time::Instant::now();
    let found = lookup_phone(&bus, 1, "+640000000", Duration::from_millis(50))
        .await
        .expect("lookup");
    assert_eq!(found, None);
    assert!(started.elapsed() >= Duration::from_millis(40));
    // The request still went out.
    assert_eq!(bus.pending(Partition::ContactsRequest), 1);
}

#[tokio::test]
async fn hit_is_returned_with_label() {
    let bus = Arc::new(Bus::default());
    spawn_responder(Arc::clone(&bus), "Alice");
    let found = lookup_phone(&bus, 5, "+640000000", Duration::from_secs(2))
        .await
        .expect("lookup");
    assert_eq!(
        found,
        Some(ContactMatch {
            name: "Alice".to_owned(),
            label: "mobile".to_owned(),
        })
    );
    bus.close();
}

#[tokio::test]
async fn empty_reply_is_a_miss() {
    let bus = Arc::new(Bus::default());
    spawn_responder(Arc::clone(&bus), "");
    let found = lookup_phone(&bus, 5, "+640000000", Duration::from_secs(2))
        .await
        .expect("lookup");
    assert_eq!(found, None);
    bus.close();
}

#[tokio::test]
async fn stale_reply_is_discarded_before_a_new_request() {
    let bus = Bus::default();
    bus.publish(
        Partition::ContactsResponse(9),
        &Envelope::ContactResponse {
            query: ContactQuery::PhoneLookup {
                phone: "+640000000".to_owned(),
            },
            name: "Stale".to_owned(),
            label: String::new(),
        },
    )
    .expect("publish");

    let found = lookup_phone(&bus, 9, "+640000000", Duration::from_millis(30))
        .await
        .expect("lookup");
    assert_eq!(found, None);
    assert_eq!(bus.pending(Partition::ContactsResponse(9)), 0);
}

#[tokio::test]
async fn late_lookup_reply_is_not_taken_as_a_search_answer() {
    let bus = Arc::new(Bus::default());
    let late = Arc::clone(&bus);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = late.publish(
            Partition::ContactsResponse(4),
            &Envelope::ContactResponse {
                query: ContactQuery::PhoneLookup {
                    phone: "+640000000".to_owned(),
                },
                name: "Caller".to_owned(),
                label: "mobile".to_owned(),
            },
        );
    });

    let found = search(&bus, 4, "Alice", Duration::from_millis(150))
        .await
        .expect("search");
    assert_eq!(found, None);
    assert_eq!(bus.pending(Partition::ContactsResponse(4)), 0);
}

#[tokio::test]
async fn matching_reply_after_a_mismatched_one_is_returned() {
    let bus = Arc::new(Bus::default());
    let responder = Arc::clone(&bus);
    tokio::spawn(async move {
        let Ok(Some(Envelope::ContactRequest {
            requester_id,
            query,
        })) = responder
            .receive(Partition::ContactsRequest, ReceiveMode::Block)
            .await
        else {
            return;
        };
        let partition = Partition::ContactsResponse(requester_id);
        let _ = responder.publish(
            partition,
            &Envelope::ContactResponse {
                query: ContactQuery::PhoneLookup {
                    phone: "+641111111".to_owned(),
                },
                name: "Someone Else".to_owned(),
                label: String::new(),
            },
        );
        let _ = responder.publish(
            partition,
            &Envelope::ContactResponse {
                query,
                name: "Alice".to_owned(),
                label: "mobile".to_owned(),
            },
        );
    });

    let found = lookup_phone(&bus, 6, "+640000000", Duration::from_secs(2))
        .await
        .expect("lookup");
    assert_eq!(found.map(|m| m.name), Some("Alice".to_owned()));
}

#[tokio::test]
async fn replies_go_only_to_the_requester() {
    let bus = Arc::new(Bus::default());
    spawn_responder(Arc::clone(&bus), "Alice");
    lookup_phone(&bus, 1, "+640000000", Duration::from_secs(2))
        .await
        .expect("lookup");
    assert_eq!(bus.pending(Partition::ContactsResponse(2)), 0);
    bus.close();
}

#[tokio::test]
async fn search_uses_the_search_query() {
    let bus = Bus::default();
    let found = search(&bus, 3, "Alice", Duration::from_millis(20))
        .await
        .expect("search");
    assert_eq!(found, None);
    assert_eq!(
        bus.receive(Partition::ContactsRequest, ReceiveMode::Poll)
            .await
            .expect("receive"),
        Some(Envelope::ContactRequest {
            requester_id: 3,
            query: ContactQuery::Search {
                query: "Alice".to_owned(),
            },
        })
    );
}

#[tokio::test]
async fn submit_search_does_not_wait() {
    let bus = Bus::default();
    submit_search(&bus, 3, "Bob").expect("submit");
    assert_eq!(bus.pending(Partition::ContactsRequest), 1);
    assert_eq!(bus.pending(Partition::ContactsResponse(3)), 0);
}
