//! ABOUTME: Redis-backed `MessageBus` adapter for real deployments
//! ABOUTME: pub/sub for plain broadcast, Redis Streams + consumer groups for mirrored topics

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use orchestrator_core::ports::{
    BusError, BusMessage, MessageBus, MessageHandler, PublishOptions, SubscribeOptions,
    SubscriptionId,
};
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, RedisResult};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

#[derive(Debug, Clone)]
pub struct RedisBusConfig {
    pub url: String,
    pub max_redeliveries: u32,
    pub visibility_timeout_ms: u64,
    pub block_ms: u64,
}

impl RedisBusConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_redeliveries: 5,
            visibility_timeout_ms: 30_000,
            block_ms: 1_000,
        }
    }
}

/// `MessageBus` backed by a real Redis server: `PUBLISH`/`SUBSCRIBE` for
/// plain broadcast, `XADD`/`XREADGROUP`/`XACK` for the stream mirror and
/// consumer groups (spec §4.3). Honors the same wire-exact topic and
/// `stream:<topic>` / `dlq:<topic>` naming from spec §6 as `InMemoryBus`.
pub struct RedisBus {
    client: Client,
    conn: ConnectionManager,
    config: RedisBusConfig,
    pubsub_tasks: DashMap<SubscriptionId, JoinHandle<()>>,
    group_tasks: DashMap<SubscriptionId, JoinHandle<()>>,
    next_subscription_id: AtomicU64,
    closed: AtomicBool,
}

impl RedisBus {
    pub async fn connect(config: RedisBusConfig) -> Result<Arc<Self>, BusError> {
        let client = Client::open(config.url.clone())
            .map_err(|e| BusError::SubscribeFailed { topic: "<connect>".into(), message: e.to_string() })?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BusError::SubscribeFailed { topic: "<connect>".into(), message: e.to_string() })?;

        Ok(Arc::new(Self {
            client,
            conn,
            config,
            pubsub_tasks: DashMap::new(),
            group_tasks: DashMap::new(),
            next_subscription_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }))
    }

    fn stream_name_for(topic: &str) -> String {
        format!("stream:{topic}")
    }

    fn dlq_name_for(topic: &str) -> String {
        format!("dlq:{topic}")
    }

    async fn ensure_group(conn: &mut ConnectionManager, stream: &str, group: &str, from_beginning: bool) -> RedisResult<()> {
        let start_id = if from_beginning { "0" } else { "$" };
        let result: RedisResult<()> = conn.xgroup_create_mkstream(stream, group, start_id).await;
        if let Err(err) = result {
            if !err.to_string().contains("BUSYGROUP") {
                return Err(err);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, topic: &str, payload: Value, opts: PublishOptions) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Disconnected);
        }

        let body = serde_json::to_string(&payload)
            .map_err(|e| BusError::PublishFailed { topic: topic.to_string(), message: e.to_string() })?;

        let mut conn = self.conn.clone();
        conn.publish::<_, _, i64>(topic, &body)
            .await
            .map_err(|e| BusError::PublishFailed { topic: topic.to_string(), message: e.to_string() })?;

        if let Some(stream_name) = &opts.mirror_to_stream {
            let mut fields: Vec<(String, String)> = vec![("payload".to_string(), body)];
            if let Some(key) = &opts.key {
                fields.push(("key".to_string(), key.clone()));
            }
            for (k, v) in &opts.headers {
                fields.push((format!("header:{k}"), v.clone()));
            }
            let field_refs: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            conn.xadd::<_, _, _, _, String>(stream_name, "*", &field_refs)
                .await
                .map_err(|e| BusError::PublishFailed { topic: stream_name.clone(), message: e.to_string() })?;
        }

        debug!(topic, "published to redis bus");
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
                let client = self.client.clone();
                let topic = topic.to_string();
                let handle = tokio::spawn(async move {
                    let Ok(conn) = client.get_async_connection().await else {
                        error!(topic = %topic, "failed to open pubsub connection");
                        return;
                    };
                    let mut pubsub = conn.into_pubsub();
                    if pubsub.subscribe(&topic).await.is_err() {
                        error!(topic = %topic, "failed to subscribe to channel");
                        return;
                    }
                    let mut stream = pubsub.on_message();
                    while let Some(msg) = stream.next().await {
                        let raw: String = match msg.get_payload() {
                            Ok(p) => p,
                            Err(_) => continue,
                        };
                        let Ok(payload) = serde_json::from_str::<Value>(&raw) else {
                            warn!(topic = %topic, "dropping malformed pubsub payload");
                            continue;
                        };
                        let message = BusMessage {
                            topic: topic.clone(),
                            payload,
                            key: None,
                            headers: HashMap::new(),
                            record_id: None,
                        };
                        if let Err(err) = handler.handle(message).await {
                            warn!(topic = %topic, %err, "broadcast subscriber handler failed");
                        }
                    }
                });
                self.pubsub_tasks.insert(id, handle);
            }
            Some(group) => {
                let stream_name = Self::stream_name_for(topic);
                let mut conn = self.conn.clone();
                Self::ensure_group(&mut conn, &stream_name, &group, opts.from_beginning)
                    .await
                    .map_err(|e| BusError::SubscribeFailed { topic: stream_name.clone(), message: e.to_string() })?;

                let topic_owned = topic.to_string();
                let consumer_name = format!("consumer-{}", id.0);
                let max_redeliveries = self.config.max_redeliveries;
                let block_ms = self.config.block_ms;
                let visibility_timeout = Duration::from_millis(self.config.visibility_timeout_ms);
                let dlq = Self::dlq_name_for(topic);

                let handle = tokio::spawn(async move {
                    loop {
                        let read_opts = StreamReadOptions::default()
                            .group(&group, &consumer_name)
                            .count(10)
                            .block(block_ms as usize);

                        let reply: RedisResult<StreamReadReply> =
                            conn.xread_options(&[&stream_name], &[">"], &read_opts).await;

                        let reply = match reply {
                            Ok(r) => r,
                            Err(err) => {
                                warn!(%err, "xreadgroup failed, backing off");
                                tokio::time::sleep(Duration::from_millis(500)).await;
                                continue;
                            }
                        };

                        for stream_key in reply.keys {
                            for stream_id in stream_key.ids {
                                let raw = stream_id
                                    .map
                                    .get("payload")
                                    .and_then(|v| redis::from_redis_value::<String>(v).ok())
                                    .unwrap_or_default();
                                let payload: Value = serde_json::from_str(&raw).unwrap_or(Value::Null);

                                let message = BusMessage {
                                    topic: topic_owned.clone(),
                                    payload: payload.clone(),
                                    key: None,
                                    headers: HashMap::new(),
                                    record_id: Some(stream_id.id.clone()),
                                };

                                let mut delivered = false;
                                for attempt in 0..=max_redeliveries {
                                    match tokio::time::timeout(visibility_timeout, handler.handle(message.clone())).await {
                                        Ok(Ok(())) => {
                                            delivered = true;
                                            break;
                                        }
                                        Ok(Err(err)) => {
                                            warn!(stream = %stream_name, id = %stream_id.id, attempt, %err, "handler failed, redelivering");
                                        }
                                        Err(_) => {
                                            warn!(
                                                stream = %stream_name, id = %stream_id.id, attempt,
                                                visibility_timeout_ms = visibility_timeout.as_millis() as u64,
                                                "handler exceeded visibility timeout, redelivering"
                                            );
                                        }
                                    }
                                }

                                if delivered {
                                    let _: RedisResult<i32> =
                                        conn.xack(&stream_name, &group, &[stream_id.id.clone()]).await;
                                } else {
                                    error!(stream = %stream_name, id = %stream_id.id, "max redeliveries exceeded, routing to DLQ");
                                    let field_refs: Vec<(&str, &str)> = vec![("payload", &raw)];
                                    let _: RedisResult<String> = conn.xadd(&dlq, "*", &field_refs).await;
                                    let _: RedisResult<i32> =
                                        conn.xack(&stream_name, &group, &[stream_id.id.clone()]).await;
                                }
                            }
                        }
                    }
                });

                self.group_tasks.insert(id, handle);
            }
        }

        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BusError> {
        if let Some((_, handle)) = self.pubsub_tasks.remove(&id) {
            handle.abort();
        }
        if let Some((_, handle)) = self.group_tasks.remove(&id) {
            handle.abort();
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        self.closed.store(true, Ordering::SeqCst);
        for entry in self.pubsub_tasks.iter() {
            entry.value().abort();
        }
        for entry in self.group_tasks.iter() {
            entry.value().abort();
        }
        self.pubsub_tasks.clear();
        self.group_tasks.clear();
        Ok(())
    }

    async fn ping(&self) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        Ok(())
    }
}
