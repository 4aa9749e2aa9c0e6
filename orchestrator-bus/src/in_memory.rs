//! ABOUTME: Single-process `MessageBus` adapter backed by in-memory fan-out and a stream mirror
//! ABOUTME: Used by the CLI demo and the workspace's integration tests; no external broker required

use async_trait::async_trait;
use dashmap::DashMap;
use orchestrator_core::ports::{
    BusError, BusMessage, MessageBus, MessageHandler, PublishOptions, SubscribeOptions,
    SubscriptionId,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Tunables for the stream-mirror / consumer-group simulation. Defaults are
/// the dead-letter policy this workspace committed to for the spec's open
/// question on redelivery count and visibility timeout (see DESIGN.md).
#[derive(Debug, Clone)]
pub struct InMemoryBusConfig {
    pub max_redeliveries: u32,
    pub visibility_timeout_ms: u64,
    /// How often the consumer-group poll loop checks for new records when
    /// the stream is caught up.
    pub poll_interval_ms: u64,
}

impl Default for InMemoryBusConfig {
    fn default() -> Self {
        Self {
            max_redeliveries: 5,
            visibility_timeout_ms: 30_000,
            poll_interval_ms: 5,
        }
    }
}

struct StreamRecord {
    id: u64,
    payload: Value,
    #[allow(dead_code)]
    key: Option<String>,
    headers: HashMap<String, String>,
}

#[derive(Default)]
struct Stream {
    records: Vec<StreamRecord>,
}

struct PlainSubscription {
    id: SubscriptionId,
    handler: Arc<dyn MessageHandler>,
}

enum SubscriptionRef {
    Plain {
        topic: String,
    },
    Group {
        stream_key: (String, String),
        handler_index: usize,
    },
}

/// In-memory `MessageBus`. Plain broadcast subscriptions see only messages
/// published after they subscribe (spec §4.3); consumer-group subscriptions
/// read from a derived stream named `stream:<topic>` (the wire-exact
/// convention from spec §6) starting at the group's committed cursor, with
/// redelivery-then-DLQ on handler failure.
pub struct InMemoryBus {
    self_ref: Weak<InMemoryBus>,
    config: InMemoryBusConfig,
    topics: DashMap<String, Vec<PlainSubscription>>,
    streams: DashMap<String, Arc<Mutex<Stream>>>,
    record_ids: DashMap<String, AtomicU64>,
    group_cursors: DashMap<(String, String), Mutex<usize>>,
    group_handlers: DashMap<(String, String), Mutex<Vec<Option<Arc<dyn MessageHandler>>>>>,
    group_tasks: DashMap<(String, String), JoinHandle<()>>,
    subscriptions_index: DashMap<SubscriptionId, SubscriptionRef>,
    next_subscription_id: AtomicU64,
    closed: AtomicBool,
}

impl InMemoryBus {
    pub fn new() -> Arc<Self> {
        Self::with_config(InMemoryBusConfig::default())
    }

    pub fn with_config(config: InMemoryBusConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            config,
            topics: DashMap::new(),
            streams: DashMap::new(),
            record_ids: DashMap::new(),
            group_cursors: DashMap::new(),
            group_handlers: DashMap::new(),
            group_tasks: DashMap::new(),
            subscriptions_index: DashMap::new(),
            next_subscription_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    fn stream_name_for(topic: &str) -> String {
        format!("stream:{topic}")
    }

    fn dlq_name_for(topic: &str) -> String {
        format!("dlq:{topic}")
    }

    fn append_to_stream(&self, stream_name: &str, payload: &Value, key: &Option<String>, headers: &HashMap<String, String>) {
        let stream = self
            .streams
            .entry(stream_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Stream::default())))
            .clone();
        let counter = self
            .record_ids
            .entry(stream_name.to_string())
            .or_insert_with(|| AtomicU64::new(0));
        let id = counter.fetch_add(1, Ordering::SeqCst);
        stream.lock().records.push(StreamRecord {
            id,
            payload: payload.clone(),
            key: key.clone(),
            headers: headers.clone(),
        });
    }

    /// Background poll loop for one `(stream, consumer_group)` pair; shared
    /// across every handler registered to the group, round-robin dispatched.
    fn spawn_group_loop(self: &Arc<Self>, topic: String, group: String) {
        let bus = self.clone();
        let stream_name = Self::stream_name_for(&topic);
        let key = (stream_name.clone(), group.clone());
        let poll = Duration::from_millis(self.config.poll_interval_ms);

        let handle = tokio::spawn(async move {
            let mut rr_index: usize = 0;
            loop {
                if bus.closed.load(Ordering::SeqCst) {
                    return;
                }
                let stream = match bus.streams.get(&stream_name) {
                    Some(s) => s.clone(),
                    None => {
                        tokio::time::sleep(poll).await;
                        continue;
                    }
                };

                let next_index = {
                    let cursor = bus.group_cursors.get(&key);
                    cursor.map(|c| *c.lock()).unwrap_or(0)
                };

                let record_payload = {
                    let guard = stream.lock();
                    guard.records.get(next_index).map(|r| (r.payload.clone(), r.headers.clone()))
                };

                let Some((payload, headers)) = record_payload else {
                    tokio::time::sleep(poll).await;
                    continue;
                };

                let handler = {
                    let handlers = match bus.group_handlers.get(&key) {
                        Some(h) => h,
                        None => return,
                    };
                    let guard = handlers.lock();
                    let live: Vec<Arc<dyn MessageHandler>> =
                        guard.iter().filter_map(|h| h.clone()).collect();
                    drop(guard);
                    if live.is_empty() {
                        None
                    } else {
                        let idx = rr_index % live.len();
                        rr_index = rr_index.wrapping_add(1);
                        Some(live[idx].clone())
                    }
                };

                let Some(handler) = handler else {
                    tokio::time::sleep(poll).await;
                    continue;
                };

                let mut delivered = false;
                for attempt in 0..=bus.config.max_redeliveries {
                    let message = BusMessage {
                        topic: topic.clone(),
                        payload: payload.clone(),
                        key: None,
                        headers: headers.clone(),
                        record_id: Some(next_index.to_string()),
                    };
                    let visibility_timeout = Duration::from_millis(bus.config.visibility_timeout_ms);
                    match tokio::time::timeout(visibility_timeout, handler.handle(message)).await {
                        Ok(Ok(())) => {
                            delivered = true;
                            break;
                        }
                        Ok(Err(err)) => {
                            warn!(
                                topic = %topic, group = %group, attempt, %err,
                                "consumer group handler failed, redelivering"
                            );
                        }
                        Err(_) => {
                            warn!(
                                topic = %topic, group = %group, attempt,
                                visibility_timeout_ms = bus.config.visibility_timeout_ms,
                                "consumer group handler exceeded visibility timeout, redelivering"
                            );
                        }
                    }
                }

                if !delivered {
                    error!(topic = %topic, group = %group, "max redeliveries exceeded, routing to DLQ");
                    let dlq = Self::dlq_name_for(&topic);
                    bus.append_to_stream(&dlq, &payload, &None, &headers);
                }

                if let Some(cursor) = bus.group_cursors.get(&key) {
                    *cursor.lock() = next_index + 1;
                }
            }
        });

        self.group_tasks.insert(key, handle);
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, payload: Value, opts: PublishOptions) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Disconnected);
        }

        if let Some(subs) = self.topics.get(topic) {
            for sub in subs.iter() {
                let handler = sub.handler.clone();
                let message = BusMessage {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                    key: opts.key.clone(),
                    headers: opts.headers.clone(),
                    record_id: None,
                };
                tokio::spawn(async move {
                    if let Err(err) = handler.handle(message).await {
                        warn!(%err, "broadcast subscriber handler failed");
                    }
                });
            }
        }

        if let Some(stream_name) = &opts.mirror_to_stream {
            self.append_to_stream(stream_name, &payload, &opts.key, &opts.headers);
        }

        debug!(topic, "published message");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        opts: SubscribeOptions,
    ) -> Result<SubscriptionId, BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Disconnected);
        }

        let id = SubscriptionId(self.next_subscription_id.fetch_add(1, Ordering::SeqCst));

        match opts.consumer_group {
            None => {
                self.topics
                    .entry(topic.to_string())
                    .or_default()
                    .push(PlainSubscription { id, handler });
                self.subscriptions_index.insert(
                    id,
                    SubscriptionRef::Plain {
                        topic: topic.to_string(),
                    },
                );
            }
            Some(group) => {
                let stream_name = Self::stream_name_for(topic);
                let key = (stream_name.clone(), group.clone());

                let is_new_group = !self.group_cursors.contains_key(&key);
                if is_new_group {
                    let start = if opts.from_beginning {
                        0
                    } else {
                        self.streams
                            .get(&stream_name)
                            .map(|s| s.lock().records.len())
                            .unwrap_or(0)
                    };
                    self.group_cursors.insert(key.clone(), Mutex::new(start));
                }

                let handler_index = {
                    let handlers = self.group_handlers.entry(key.clone()).or_default();
                    let mut guard = handlers.lock();
                    guard.push(Some(handler));
                    guard.len() - 1
                };

                self.subscriptions_index.insert(
                    id,
                    SubscriptionRef::Group {
                        stream_key: key.clone(),
                        handler_index,
                    },
                );

                if !self.group_tasks.contains_key(&key) {
                    let bus = self.self_ref.upgrade().expect("bus is alive while subscribing");
                    bus.spawn_group_loop(topic.to_string(), group);
                }
            }
        }

        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BusError> {
        let Some((_, reference)) = self.subscriptions_index.remove(&id) else {
            return Ok(());
        };

        match reference {
            SubscriptionRef::Plain { topic } => {
                if let Some(mut subs) = self.topics.get_mut(&topic) {
                    subs.retain(|s| s.id != id);
                }
            }
            SubscriptionRef::Group { stream_key, handler_index } => {
                let mut all_empty = true;
                if let Some(handlers) = self.group_handlers.get(&stream_key) {
                    let mut guard = handlers.lock();
                    if let Some(slot) = guard.get_mut(handler_index) {
                        *slot = None;
                    }
                    all_empty = guard.iter().all(|h| h.is_none());
                }
                if all_empty {
                    if let Some((_, handle)) = self.group_tasks.remove(&stream_key) {
                        handle.abort();
                    }
                }
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        self.closed.store(true, Ordering::SeqCst);
        for entry in self.group_tasks.iter() {
            entry.value().abort();
        }
        self.group_tasks.clear();
        self.topics.clear();
        Ok(())
    }

    async fn ping(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BusError::Disconnected)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::ports::HandlerFuture;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingHandler {
        received: Arc<AsyncMutex<Vec<Value>>>,
    }

    impl MessageHandler for RecordingHandler {
        fn handle(&self, message: BusMessage) -> HandlerFuture {
            let received = self.received.clone();
            Box::pin(async move {
                received.lock().await.push(message.payload);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn plain_subscribers_miss_messages_published_before_they_subscribe() {
        let bus = InMemoryBus::new();
        bus.publish("topic.a", json!({"early": true}), PublishOptions::default())
            .await
            .unwrap();

        let received = Arc::new(AsyncMutex::new(Vec::new()));
        bus.subscribe(
            "topic.a",
            Arc::new(RecordingHandler { received: received.clone() }),
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

        bus.publish("topic.a", json!({"late": true}), PublishOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let got = received.lock().await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], json!({"late": true}));
    }

    #[tokio::test]
    async fn consumer_group_sees_every_mirrored_record_exactly_once() {
        let bus = InMemoryBus::new();
        let received = Arc::new(AsyncMutex::new(Vec::new()));
        bus.subscribe(
            "agent:tasks:scaffold",
            Arc::new(RecordingHandler { received: received.clone() }),
            SubscribeOptions {
                consumer_group: Some("group-1".to_string()),
                from_beginning: false,
            },
        )
        .await
        .unwrap();

        for i in 0..3 {
            bus.publish(
                "agent:tasks:scaffold",
                json!({"i": i}),
                PublishOptions {
                    mirror_to_stream: Some("stream:agent:tasks:scaffold".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        let got = received.lock().await;
        assert_eq!(got.len(), 3);
    }

    struct AlwaysFailHandler {
        attempts: Arc<AtomicU32>,
    }

    impl MessageHandler for AlwaysFailHandler {
        fn handle(&self, _message: BusMessage) -> HandlerFuture {
            let attempts = self.attempts.clone();
            Box::pin(async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(BusError::Handler("boom".to_string()))
            })
        }
    }

    #[tokio::test]
    async fn exhausted_redeliveries_route_to_dlq() {
        let bus = InMemoryBus::with_config(InMemoryBusConfig {
            max_redeliveries: 2,
            poll_interval_ms: 1,
            ..InMemoryBusConfig::default()
        });
        let attempts = Arc::new(AtomicU32::new(0));
        bus.subscribe(
            "agent:tasks:validation",
            Arc::new(AlwaysFailHandler { attempts: attempts.clone() }),
            SubscribeOptions {
                consumer_group: Some("g".to_string()),
                from_beginning: false,
            },
        )
        .await
        .unwrap();

        bus.publish(
            "agent:tasks:validation",
            json!({"x": 1}),
            PublishOptions {
                mirror_to_stream: Some("stream:agent:tasks:validation".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3); // initial + 2 redeliveries
        assert!(bus.streams.contains_key("dlq:agent:tasks:validation"));
    }

    #[tokio::test]
    async fn re_subscribing_from_beginning_replays_existing_records() {
        let bus = InMemoryBus::new();
        bus.publish(
            "agent:tasks:t",
            json!({"a": 1}),
            PublishOptions {
                mirror_to_stream: Some("stream:agent:tasks:t".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let received = Arc::new(AsyncMutex::new(Vec::new()));
        bus.subscribe(
            "agent:tasks:t",
            Arc::new(RecordingHandler { received: received.clone() }),
            SubscribeOptions {
                consumer_group: Some("replay-group".to_string()),
                from_beginning: true,
            },
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(received.lock().await.len(), 1);
    }
}
