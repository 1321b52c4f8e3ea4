//! Tests for bus-backed logging and the log collector.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use smstoxmpp::bus::{Bus, Envelope, LogLevel, Partition, ReceiveMode};
use smstoxmpp::logging::{run_log_collector, LogHandle, LoggingGuard};

#[test]
fn logging_guard_is_send() {
    fn assert_send<T: Send>() {}
    assert_send::<LoggingGuard>();
}

#[test]
fn init_production_creates_logs_dir() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let logs_dir = tmp.path().join("logs");
    assert!(!logs_dir.exists());

    // The global subscriber can only be installed once per process; the
    // directory is created either way.
    let _result = smstoxmpp::logging::init_production(&logs_dir, false, false);
    assert!(logs_dir.exists(), "logs directory should be created");
}

#[tokio::test]
async fn handle_publishes_tagged_records() {
    let bus = Arc::new(Bus::default());
    let log = LogHandle::new(Arc::clone(&bus), "phone1");
    assert_eq!(log.unit(), "phone1");

    log.info("worker started");
    log.error("gateway unreachable");

    let first = bus
        .receive(Partition::Log, ReceiveMode::Poll)
        .await
        .expect("receive");
    match first {
        Some(Envelope::LogRecord {
            level, unit, text, ..
        }) => {
            assert_eq!(level, LogLevel::Info);
            assert_eq!(unit, "phone1");
            assert_eq!(text, "worker started");
        }
        other => panic!("expected a log record, got {other:?}"),
    }
    assert!(matches!(
        bus.receive(Partition::Log, ReceiveMode::Poll).await,
        Ok(Some(Envelope::LogRecord {
            level: LogLevel::Error,
            ..
        }))
    ));
}

#[tokio::test]
async fn oversized_record_bypasses_the_bus() {
    let bus = Arc::new(Bus::new(256));
    let log = LogHandle::new(Arc::clone(&bus), "phone1");
    log.warning("x".repeat(1024));
    assert_eq!(bus.pending(Partition::Log), 0);
}

#[tokio::test]
async fn collector_drains_everything_before_stopping() {
    let bus = Arc::new(Bus::default());
    let log = LogHandle::new(Arc::clone(&bus), "supervisor");
    for n in 0..5 {
        log.debug(format!("record {n}"));
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let collector = tokio::spawn(run_log_collector(Arc::clone(&bus), stop_rx));
    log.info("late record");
    tokio::time::sleep(Duration::from_millis(20)).await;
    stop_tx.send(true).expect("signal");

    let written = tokio::time::timeout(Duration::from_secs(2), collector)
        .await
        .expect("collector should stop")
        .expect("task");
    assert_eq!(written, 6);
    assert_eq!(bus.pending(Partition::Log), 0);
}

#[tokio::test]
async fn collector_stops_when_bus_closes() {
    let bus = Arc::new(Bus::default());
    let (_stop_tx, stop_rx) = watch::channel(false);
    let collector = tokio::spawn(run_log_collector(Arc::clone(&bus), stop_rx));
    tokio::time::sleep(Duration::from_millis(10)).await;
    bus.close();
    let written = tokio::time::timeout(Duration::from_secs(2), collector)
        .await
        .expect("collector should stop")
        .expect("task");
    assert_eq!(written, 0);
}
