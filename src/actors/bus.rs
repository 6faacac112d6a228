//! EventBus - fans events out to independent subscribers
//!
//! ## Isolation
//!
//! Every subscriber owns an unbounded queue. `publish` only enqueues, so it
//! never waits on a handler, and a slow or failing handler only delays its
//! own queue:
//!
//! ```text
//! publish ──┬──► queue A ──► task A ──► handler A   (slow: only A waits)
//!           ├──► queue B ──► task B ──► handler B   (errors: logged, B continues)
//!           └──► queue C ──► receiver owned by an actor
//! ```
//!
//! Each queue is drained by exactly one task, so a subscriber sees events in
//! publish order. The subscriber list is snapshotted when a publish starts;
//! subscribing or unsubscribing concurrently affects only later publishes.
//!
//! Queues are unbounded. The bus tracks the depth of every handler queue,
//! reports the deepest one in [`BusStats`] and warns each time a queue grows
//! by another [`QUEUE_DEPTH_WARNING`] events. Channel subscribers can check
//! their own backlog with `UnboundedReceiver::len`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{error, trace, warn};

use super::messages::{BusEvent, Topic};
use crate::{Sample, TelemetryData};

/// Receives events from the bus.
///
/// Errors are logged by the bus and do not end the subscription.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: BusEvent) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> EventHandler for F
where
    F: Fn(BusEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn handle(&self, event: BusEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Handler queue depth at which the bus starts warning, and again at every multiple
pub const QUEUE_DEPTH_WARNING: u64 = 1024;

/// Identifies one subscription, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

struct Subscriber {
    token: SubscriptionToken,
    topics: Vec<Topic>,
    sender: mpsc::UnboundedSender<BusEvent>,

    /// Events not yet picked up by the handler; `None` for channel subscribers
    pending: Option<Arc<AtomicU64>>,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Bus statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Events published (each counted once regardless of subscriber count)
    pub published: u64,

    /// Handler invocations that completed successfully
    pub delivered: u64,

    /// Handler invocations that returned an error or panicked
    pub failed: u64,

    /// Deepest handler queue at the time of the call
    pub max_queue_depth: u64,
}

type Target = (
    SubscriptionToken,
    mpsc::UnboundedSender<BusEvent>,
    Option<Arc<AtomicU64>>,
);

struct BusInner {
    subscribers: RwLock<Vec<Subscriber>>,
    next_token: AtomicU64,
    counters: Arc<Counters>,
}

/// Typed publish/subscribe fan-out. Cheap to clone; clones share subscribers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(Vec::new()),
                next_token: AtomicU64::new(1),
                counters: Arc::new(Counters::default()),
            }),
        }
    }

    /// Register a channel subscription for `topics`.
    ///
    /// The receiver yields every matching event in publish order until
    /// [`unsubscribe`](Self::unsubscribe) is called or the bus is dropped.
    pub fn subscribe_channel(
        &self,
        topics: impl Into<Vec<Topic>>,
    ) -> (SubscriptionToken, mpsc::UnboundedReceiver<BusEvent>) {
        self.register(topics.into(), None)
    }

    fn register(
        &self,
        topics: Vec<Topic>,
        pending: Option<Arc<AtomicU64>>,
    ) -> (SubscriptionToken, mpsc::UnboundedReceiver<BusEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let token = SubscriptionToken(self.inner.next_token.fetch_add(1, Ordering::Relaxed));

        trace!("new subscription {token:?} for {topics:?}");

        self.inner
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Subscriber {
                token,
                topics,
                sender,
                pending,
            });

        (token, receiver)
    }

    /// Register `handler` for a single topic.
    pub fn subscribe(&self, topic: Topic, handler: impl EventHandler) -> SubscriptionToken {
        self.subscribe_many(vec![topic], handler)
    }

    /// Register `handler` for several topics.
    ///
    /// The handler runs on its own task. Must be called within a Tokio runtime.
    pub fn subscribe_many(
        &self,
        topics: impl Into<Vec<Topic>>,
        handler: impl EventHandler,
    ) -> SubscriptionToken {
        let pending = Arc::new(AtomicU64::new(0));
        let (token, mut receiver) = self.register(topics.into(), Some(Arc::clone(&pending)));
        let counters = Arc::clone(&self.inner.counters);

        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                pending.fetch_sub(1, Ordering::Relaxed);
                let topic = event.topic();
                let outcome = std::panic::AssertUnwindSafe(handler.handle(event))
                    .catch_unwind()
                    .await;

                match outcome {
                    Ok(Ok(())) => {
                        counters.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Err(e)) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        error!("subscriber {token:?} failed to handle {topic:?}: {e:#}");
                    }
                    Err(_) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        error!("subscriber {token:?} panicked while handling {topic:?}");
                    }
                }
            }
            trace!("subscription {token:?} closed");
        });

        token
    }

    /// Remove a subscription. Events already queued for it are still handled.
    ///
    /// Returns `false` when the token was unknown.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut subscribers = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = subscribers.len();
        subscribers.retain(|s| s.token != token);
        before != subscribers.len()
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|s| s.topics.contains(&topic))
            .count()
    }

    /// Publish one sample on its kind topic. Returns the number of
    /// subscribers it was queued for.
    pub fn publish_sample(&self, sample: Sample) -> usize {
        self.publish(BusEvent::Sample(Arc::new(sample)))
    }

    /// Publish one tick's composite.
    pub fn publish_composite(&self, data: TelemetryData) -> usize {
        self.publish(BusEvent::Composite(Arc::new(data)))
    }

    pub fn publish(&self, event: BusEvent) -> usize {
        let topic = event.topic();
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);

        let targets: Vec<Target> = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|s| s.topics.contains(&topic))
            .map(|s| (s.token, s.sender.clone(), s.pending.clone()))
            .collect();

        let mut reached = 0;
        for (token, sender, pending) in targets {
            // counted before sending so the handler task never sees it go below zero
            let depth = pending
                .as_ref()
                .map(|pending| pending.fetch_add(1, Ordering::Relaxed) + 1);

            match sender.send(event.clone()) {
                Ok(()) => {
                    reached += 1;
                    if let Some(depth) = depth.filter(|depth| depth % QUEUE_DEPTH_WARNING == 0) {
                        warn!("subscriber {token:?} has {depth} events queued");
                    }
                }
                Err(_) => {
                    warn!("subscriber {token:?} is gone, dropping it");
                    self.unsubscribe(token);
                }
            }
        }

        trace!("published {topic:?} to {reached} subscribers");
        reached
    }

    /// Events queued for each handler subscription
    pub fn queue_depths(&self) -> Vec<(SubscriptionToken, u64)> {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter_map(|s| {
                s.pending
                    .as_ref()
                    .map(|pending| (s.token, pending.load(Ordering::Relaxed)))
            })
            .collect()
    }

    pub fn stats(&self) -> BusStats {
        let counters = &self.inner.counters;
        BusStats {
            published: counters.published.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            max_queue_depth: self
                .queue_depths()
                .into_iter()
                .map(|(_, depth)| depth)
                .max()
                .unwrap_or(0),
        }
    }
}
