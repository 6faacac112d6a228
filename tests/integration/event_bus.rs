//! Integration tests for event fan-out
//!
//! These tests verify that:
//! - A failing, blocking or panicking subscriber never starves the others
//! - Each subscriber sees events in publish order
//! - Unsubscribing stops delivery
//! - Subscription changes during publishing only affect later publishes

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hostscope::MetricKind;
use hostscope::actors::bus::{EventBus, EventHandler};
use hostscope::actors::messages::{BusEvent, Topic};
use tokio::sync::mpsc;

use crate::helpers::{cpu_sample, drain, samples};

const CPU: Topic = Topic::Kind(MetricKind::Cpu);

/// Forwards every event's timestamp to a channel the test can await.
fn forwarding_handler(
    tx: mpsc::UnboundedSender<i64>,
) -> impl Fn(BusEvent) -> anyhow::Result<()> + Send + Sync + 'static {
    move |event| {
        if let Some(sample) = event.as_sample() {
            tx.send(sample.timestamp_ms())?;
        }
        Ok(())
    }
}

async fn recv_within(rx: &mut mpsc::UnboundedReceiver<i64>, limit: Duration) -> Option<i64> {
    tokio::time::timeout(limit, rx.recv()).await.ok().flatten()
}

/// Never finishes handling its first event.
struct BlockingHandler;

#[async_trait]
impl EventHandler for BlockingHandler {
    async fn handle(&self, _event: BusEvent) -> anyhow::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[tokio::test]
async fn test_failing_subscriber_does_not_block_others() {
    let bus = EventBus::new();
    bus.subscribe(CPU, |_event: BusEvent| -> anyhow::Result<()> {
        anyhow::bail!("handler rejected event")
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe(CPU, forwarding_handler(tx));

    assert_eq!(bus.publish_sample(cpu_sample(1)), 2);
    assert_eq!(recv_within(&mut rx, Duration::from_secs(1)).await, Some(1));

    assert_eq!(bus.publish_sample(cpu_sample(2)), 2);
    assert_eq!(recv_within(&mut rx, Duration::from_secs(1)).await, Some(2));

    tokio::time::timeout(Duration::from_secs(1), async {
        while bus.stats().failed < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_blocking_subscriber_does_not_block_others() {
    let bus = EventBus::new();
    bus.subscribe(CPU, BlockingHandler);

    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe(CPU, forwarding_handler(tx));

    for ts in 0..10 {
        bus.publish_sample(cpu_sample(ts));
    }

    for ts in 0..10 {
        assert_eq!(recv_within(&mut rx, Duration::from_secs(1)).await, Some(ts));
    }
}

#[tokio::test]
async fn test_panicking_subscriber_keeps_running() {
    let bus = EventBus::new();

    let (panic_tx, mut panic_rx) = mpsc::unbounded_channel();
    bus.subscribe(CPU, move |event: BusEvent| -> anyhow::Result<()> {
        let ts = event.as_sample().map(|s| s.timestamp_ms()).unwrap_or(-1);
        panic_tx.send(ts)?;
        if ts % 2 == 0 {
            panic!("handler blew up on {ts}");
        }
        Ok(())
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe(CPU, forwarding_handler(tx));

    for ts in 0..4 {
        bus.publish_sample(cpu_sample(ts));
    }

    for ts in 0..4 {
        assert_eq!(recv_within(&mut rx, Duration::from_secs(1)).await, Some(ts));
        // the panicking subscriber saw every event too
        assert_eq!(
            recv_within(&mut panic_rx, Duration::from_secs(1)).await,
            Some(ts)
        );
    }

    tokio::time::timeout(Duration::from_secs(1), async {
        while bus.stats().failed < 2 || bus.stats().delivered < 6 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_per_subscriber_order() {
    let bus = EventBus::new();
    let (_token, mut first) = bus.subscribe_channel(vec![CPU]);
    let (_token, mut second) = bus.subscribe_channel(vec![CPU, Topic::Composite]);

    let publishers: Vec<_> = (0..4)
        .map(|worker| {
            let bus = bus.clone();
            tokio::spawn(async move {
                for i in 0..50 {
                    bus.publish_sample(cpu_sample(worker * 1000 + i));
                }
            })
        })
        .collect();
    for publisher in publishers {
        publisher.await.unwrap();
    }

    let seen_first: Vec<i64> = samples(&drain(&mut first))
        .iter()
        .map(|s| s.timestamp_ms())
        .collect();
    let seen_second: Vec<i64> = samples(&drain(&mut second))
        .iter()
        .map(|s| s.timestamp_ms())
        .collect();

    assert_eq!(seen_first.len(), 200);
    assert_eq!(seen_second.len(), 200);

    // each publisher's events stay in its own order
    for seen in [&seen_first, &seen_second] {
        for worker in 0..4 {
            let own: Vec<i64> = seen
                .iter()
                .copied()
                .filter(|ts| ts / 1000 == worker)
                .collect();
            assert_eq!(own, (0..50).map(|i| worker * 1000 + i).collect::<Vec<_>>());
        }
    }
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let bus = EventBus::new();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let token = bus.subscribe(CPU, move |event: BusEvent| -> anyhow::Result<()> {
        if let Some(sample) = event.as_sample() {
            sink.lock().unwrap().push(sample.timestamp_ms());
        }
        Ok(())
    });

    assert_eq!(bus.subscriber_count(CPU), 1);
    assert!(bus.unsubscribe(token));
    assert!(!bus.unsubscribe(token));
    assert_eq!(bus.subscriber_count(CPU), 0);

    assert_eq!(bus.publish_sample(cpu_sample(1)), 0);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(received.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_topics_are_filtered() {
    let bus = EventBus::new();
    let (_token, mut rx) = bus.subscribe_channel(vec![Topic::Kind(MetricKind::Memory)]);

    assert_eq!(bus.publish_sample(cpu_sample(1)), 0);
    assert_eq!(bus.publish_composite(hostscope::TelemetryData::new(1)), 0);
    assert!(drain(&mut rx).is_empty());
}

/// Timestamps of the CPU samples queued on `rx`
fn timestamps(rx: &mut mpsc::UnboundedReceiver<BusEvent>) -> Vec<i64> {
    samples(&drain(rx)).iter().map(|s| s.timestamp_ms()).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_subscription_changes_during_publish_affect_later_events() {
    const LAST: i64 = 2_000;

    let bus = EventBus::new();
    let (early_token, mut early) = bus.subscribe_channel(vec![CPU]);

    let publisher = {
        let bus = bus.clone();
        tokio::spawn(async move {
            for ts in 0..LAST {
                bus.publish_sample(cpu_sample(ts));
                if ts % 100 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        })
    };

    tokio::time::sleep(Duration::from_millis(1)).await;
    let (_late_token, mut late) = bus.subscribe_channel(vec![CPU]);
    assert!(bus.unsubscribe(early_token));

    publisher.await.unwrap();
    assert_eq!(bus.publish_sample(cpu_sample(LAST)), 1);

    // the early subscriber got an unbroken prefix, the late one an unbroken suffix
    let early_seen = timestamps(&mut early);
    let late_seen = timestamps(&mut late);

    let early_count = early_seen.len() as i64;
    assert_eq!(early_seen, (0..early_count).collect::<Vec<_>>());

    let late_start = LAST + 1 - late_seen.len() as i64;
    assert_eq!(late_seen, (late_start..=LAST).collect::<Vec<_>>());

    // late subscribed before early left, so every event reached at least one of them
    assert!(late_start <= early_count);
}
