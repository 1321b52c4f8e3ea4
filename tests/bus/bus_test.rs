//! Tests for `src/bus/mod.rs`: partition queues and payload bounds.

use std::sync::Arc;
use std::time::Duration;

use smstoxmpp::bus::{
    device_key, Bus, BusError, EncodingError, Envelope, LogLevel, Partition, ReceiveMode,
};

fn sms(device: &str, body: &str) -> Envelope {
    Envelope::InboundSms {
        device: device.to_owned(),
        phone: "+640000000".to_owned(),
        body: body.to_owned(),
        source_ip: None,
    }
}

#[test]
fn device_partition_is_stable_and_distinct() {
    assert_eq!(device_key("phone1"), device_key("phone1"));
    assert_ne!(device_key("phone1"), device_key("phone2"));
    assert_eq!(
        Partition::for_device("phone1"),
        Partition::Device(device_key("phone1"))
    );
}

#[tokio::test]
async fn fifo_within_a_partition() {
    let bus = Bus::default();
    let partition = Partition::for_device("phone1");
    for body in ["one", "two", "three"] {
        bus.publish(partition, &sms("phone1", body)).expect("publish");
    }
    for body in ["one", "two", "three"] {
        let received = bus
            .receive(partition, ReceiveMode::Poll)
            .await
            .expect("receive");
        assert_eq!(received, Some(sms("phone1", body)));
    }
    assert_eq!(
        bus.receive(partition, ReceiveMode::Poll).await.expect("receive"),
        None
    );
}

#[tokio::test]
async fn partitions_do_not_cross_talk() {
    let bus = Bus::default();
    bus.publish(Partition::for_device("phone1"), &sms("phone1", "a"))
        .expect("publish");
    assert_eq!(bus.pending(Partition::for_device("phone2")), 0);
    assert_eq!(
        bus.receive(Partition::for_device("phone2"), ReceiveMode::Poll)
            .await
            .expect("receive"),
        None
    );
    assert_eq!(bus.pending(Partition::for_device("phone1")), 1);
}

#[tokio::test]
async fn oversized_payload_is_rejected_not_truncated() {
    let bus = Bus::new(128);
    let result = bus.publish(Partition::Log, &sms("phone1", &"x".repeat(500)));
    assert!(matches!(
        result,
        Err(BusError::Encoding(EncodingError::TooLarge { max: 128, .. }))
    ));
    assert_eq!(bus.pending(Partition::Log), 0);
}

#[tokio::test]
async fn shared_partition_message_is_consumed_once() {
    let bus = Bus::default();
    bus.publish(Partition::Control, &Envelope::shutdown())
        .expect("publish");
    let first = bus
        .receive(Partition::Control, ReceiveMode::Poll)
        .await
        .expect("receive");
    let second = bus
        .receive(Partition::Control, ReceiveMode::Poll)
        .await
        .expect("receive");
    assert_eq!(first, Some(Envelope::shutdown()));
    assert_eq!(second, None);
}

#[tokio::test]
async fn bounded_wait_times_out_empty() {
    let bus = Bus::default();
    let started = tokio::time::Instant::now();
    let received = bus
        .receive(Partition::Log, ReceiveMode::Wait(Duration::from_millis(30)))
        .await
        .expect("receive");
    assert_eq!(received, None);
    assert!(started.elapsed() >= Duration::from_millis(25));
}

#[tokio::test]
async fn bounded_wait_returns_early_when_a_message_arrives() {
    let bus = Arc::new(Bus::default());
    let publisher = Arc::clone(&bus);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        publisher
            .publish(Partition::ContactsResponse(7), &Envelope::shutdown())
            .expect("publish");
    });
    let started = tokio::time::Instant::now();
    let received = bus
        .receive(
            Partition::ContactsResponse(7),
            ReceiveMode::Wait(Duration::from_secs(5)),
        )
        .await
        .expect("receive");
    assert_eq!(received, Some(Envelope::shutdown()));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn close_wakes_blocked_receivers() {
    let bus = Arc::new(Bus::default());
    let receiver = Arc::clone(&bus);
    let handle =
        tokio::spawn(async move { receiver.receive(Partition::Log, ReceiveMode::Block).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    bus.close();
    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("receiver should wake")
        .expect("task");
    assert!(matches!(result, Err(BusError::Closed)));
}

#[tokio::test]
async fn closed_bus_drains_then_reports_closed() {
    let bus = Bus::default();
    let record = Envelope::LogRecord {
        level: LogLevel::Info,
        timestamp: chrono::Utc::now(),
        unit: "test".to_owned(),
        text: "queued before close".to_owned(),
    };
    bus.publish(Partition::Log, &record).expect("publish");
    bus.close();

    assert!(matches!(
        bus.publish(Partition::Log, &record),
        Err(BusError::Closed)
    ));
    assert_eq!(
        bus.receive(Partition::Log, ReceiveMode::Poll)
            .await
            .expect("drain"),
        Some(record)
    );
    assert!(matches!(
        bus.receive(Partition::Log, ReceiveMode::Poll).await,
        Err(BusError::Closed)
    ));
}
