//! [`QueueConsumer`] / [`EventPublisher`] over a redis stream with a single consumer group.
//!
//! Acked entries are deleted from the stream, so `XLEN` minus the group's pending count is the
//! number of entries still waiting for first delivery. Terminated entries are copied to
//! `<stream>:dead` before being acked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamInfoConsumersReply, StreamPendingCountReply,
    StreamPendingReply, StreamReadReply,
};
use tracing::instrument;

use super::{ConsumerInfo, EventPublisher, QueueConsumer, QueueError, QueueMessage, QueueResult};
use crate::db::redis::redis_pool::{bounded, ttl_millis};

const PAYLOAD_FIELD: &str = "payload";
const REASON_FIELD: &str = "reason";
const SOURCE_ID_FIELD: &str = "source_id";

/// Upper bound on pending entries inspected when counting redeliveries.
const METRICS_SCAN: usize = 1000;

pub struct RedisStream {
    manager: ConnectionManager,
    stream: String,
    group: String,
    consumer: String,
    ack_wait: Duration,
    redelivery_delay: Duration,
    op_timeout: Duration,
    closed: AtomicBool,
}

impl RedisStream {
    /// Attaches to `stream`, creating it and the consumer group when missing.
    #[instrument(skip(manager))]
    pub async fn connect(
        manager: ConnectionManager,
        stream: &str,
        group: &str,
        consumer: &str,
        ack_wait: Duration,
        op_timeout: Duration,
    ) -> QueueResult<Self> {
        let this = Self {
            manager,
            stream: stream.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            ack_wait,
            redelivery_delay: Duration::ZERO,
            op_timeout,
            closed: AtomicBool::new(false),
        };

        this.ensure_group().await?;
        Ok(this)
    }

    /// Minimum time a nak'd entry waits before it can be reclaimed. Set it to the event lock
    /// ttl so a redelivery can't find the failed attempt's lock still held.
    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    fn dead_letter_stream(&self) -> String {
        format!("{}:dead", self.stream)
    }

    async fn ensure_group(&self) -> QueueResult<()> {
        let mut conn = self.manager.clone();
        let mut create = redis::cmd("XGROUP");
        create
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM");

        let created = bounded("xgroup_create", self.op_timeout, async move {
            let reply: redis::RedisResult<()> = create.query_async(&mut conn).await;
            match reply {
                Ok(()) => Ok(true),
                Err(e) if e.code() == Some("BUSYGROUP") => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
        .await?;

        tracing::info!(
            stream = %self.stream,
            group = %self.group,
            created,
            "consumer group ready"
        );
        Ok(())
    }

    /// Claims entries another delivery left unacked for longer than `ack_wait`.
    async fn reclaim(&self, max: usize) -> QueueResult<Vec<QueueMessage>> {
        let mut conn = self.manager.clone();
        let idle_ms = ttl_millis(self.ack_wait);
        let (stream, group, consumer) = (&self.stream, &self.group, &self.consumer);

        let messages = bounded("reclaim", self.op_timeout, async move {
            let stale: StreamPendingCountReply = redis::cmd("XPENDING")
                .arg(stream)
                .arg(group)
                .arg("IDLE")
                .arg(idle_ms)
                .arg("-")
                .arg("+")
                .arg(max)
                .query_async(&mut conn)
                .await?;

            if stale.ids.is_empty() {
                return Ok(Vec::new());
            }

            let deliveries: HashMap<String, u64> = stale
                .ids
                .iter()
                .map(|pending| (pending.id.clone(), pending.times_delivered as u64 + 1))
                .collect();

            let mut claim = redis::cmd("XCLAIM");
            claim.arg(stream).arg(group).arg(consumer).arg(idle_ms);
            stale.ids.iter().for_each(|pending| {
                claim.arg(&pending.id);
            });

            let claimed: StreamClaimReply = claim.query_async(&mut conn).await?;
            Ok(claimed
                .ids
                .into_iter()
                .map(|entry| {
                    let count = deliveries.get(&entry.id).copied().unwrap_or(2);
                    to_message(entry, count)
                })
                .collect::<Vec<_>>())
        })
        .await?;

        if !messages.is_empty() {
            tracing::info!(
                stream = %self.stream,
                count = messages.len(),
                "reclaimed unacked messages for redelivery"
            );
        }

        Ok(messages)
    }

    async fn read_new(&self, count: usize) -> QueueResult<Vec<QueueMessage>> {
        let mut conn = self.manager.clone();
        let (stream, group, consumer) = (&self.stream, &self.group, &self.consumer);

        Ok(bounded("read_new", self.op_timeout, async move {
            let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
                .arg("GROUP")
                .arg(group)
                .arg(consumer)
                .arg("COUNT")
                .arg(count)
                .arg("STREAMS")
                .arg(stream)
                .arg(">")
                .query_async(&mut conn)
                .await?;

            Ok(reply
                .map(|reply| {
                    reply
                        .keys
                        .into_iter()
                        .flat_map(|key| key.ids)
                        .map(|entry| to_message(entry, 1))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default())
        })
        .await?)
    }
}

fn to_message(entry: StreamId, deliveries: u64) -> QueueMessage {
    // entries without a payload field fail to parse downstream and get dead-lettered
    let payload: String = entry.get(PAYLOAD_FIELD).unwrap_or_default();
    QueueMessage {
        id: entry.id,
        payload,
        deliveries,
    }
}

#[async_trait]
impl QueueConsumer for RedisStream {
    #[instrument(skip(self), fields(stream = %self.stream))]
    async fn fetch(&self, max: usize) -> QueueResult<Vec<QueueMessage>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        if max == 0 {
            return Ok(Vec::new());
        }

        let mut messages = self.reclaim(max).await?;
        let remaining = max.saturating_sub(messages.len());
        if remaining > 0 {
            messages.extend(self.read_new(remaining).await?);
        }

        Ok(messages)
    }

    async fn ack(&self, message: &QueueMessage) -> QueueResult<()> {
        let mut conn = self.manager.clone();
        let mut pipeline = redis::pipe();
        pipeline
            .atomic()
            .cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&message.id)
            .ignore()
            .cmd("XDEL")
            .arg(&self.stream)
            .arg(&message.id)
            .ignore();

        Ok(bounded("ack", self.op_timeout, async move {
            let _: () = pipeline.query_async(&mut conn).await?;
            Ok(())
        })
        .await?)
    }

    async fn nak(&self, message: &QueueMessage) -> QueueResult<()> {
        let mut conn = self.manager.clone();
        let mut claim = redis::cmd("XCLAIM");
        // backdated so the entry turns stale once `redelivery_delay` has passed
        claim
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(0)
            .arg(&message.id)
            .arg("IDLE")
            .arg(nak_idle_millis(self.ack_wait, self.redelivery_delay))
            .arg("JUSTID");

        Ok(bounded("nak", self.op_timeout, async move {
            let _: redis::Value = claim.query_async(&mut conn).await?;
            Ok(())
        })
        .await?)
    }

    #[instrument(skip(self, message), fields(id = %message.id))]
    async fn term(&self, message: &QueueMessage, reason: &str) -> QueueResult<()> {
        let mut conn = self.manager.clone();
        let mut pipeline = redis::pipe();
        pipeline
            .atomic()
            .cmd("XADD")
            .arg(self.dead_letter_stream())
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(&message.payload)
            .arg(REASON_FIELD)
            .arg(reason)
            .arg(SOURCE_ID_FIELD)
            .arg(&message.id)
            .ignore()
            .cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&message.id)
            .ignore()
            .cmd("XDEL")
            .arg(&self.stream)
            .arg(&message.id)
            .ignore();

        bounded("term", self.op_timeout, async move {
            let _: () = pipeline.query_async(&mut conn).await?;
            Ok(())
        })
        .await?;

        tracing::warn!(reason, "message dead-lettered");
        Ok(())
    }

    async fn info(&self) -> QueueResult<ConsumerInfo> {
        let mut conn = self.manager.clone();
        let (stream, group) = (&self.stream, &self.group);

        Ok(bounded("info", self.op_timeout, async move {
            let length: u64 = redis::cmd("XLEN").arg(stream).query_async(&mut conn).await?;

            let summary: StreamPendingReply = redis::cmd("XPENDING")
                .arg(stream)
                .arg(group)
                .query_async(&mut conn)
                .await?;

            let entries: StreamPendingCountReply = redis::cmd("XPENDING")
                .arg(stream)
                .arg(group)
                .arg("-")
                .arg("+")
                .arg(METRICS_SCAN)
                .query_async(&mut conn)
                .await?;

            let consumers: StreamInfoConsumersReply = redis::cmd("XINFO")
                .arg("CONSUMERS")
                .arg(stream)
                .arg(group)
                .query_async(&mut conn)
                .await?;

            let ack_pending = summary.count() as u64;
            Ok(ConsumerInfo {
                pending: length.saturating_sub(ack_pending),
                ack_pending,
                redelivered: entries
                    .ids
                    .iter()
                    .filter(|pending| pending.times_delivered > 1)
                    .count() as u64,
                waiting: consumers.consumers.len() as u64,
            })
        })
        .await?)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::info!(stream = %self.stream, consumer = %self.consumer, "consumer closed");
        }
    }
}

/// Idle time to stamp on a nak'd entry: `ack_wait - delay`, so the reclaim pass (which takes
/// entries idle for `ack_wait`) sees it after `delay`.
fn nak_idle_millis(ack_wait: Duration, delay: Duration) -> u64 {
    ack_wait.saturating_sub(delay).as_millis() as u64
}

#[async_trait]
impl EventPublisher for RedisStream {
    #[instrument(skip(self, payload), fields(stream = %self.stream))]
    async fn publish(&self, payload: &str) -> QueueResult<String> {
        let mut conn = self.manager.clone();
        let stream = &self.stream;

        Ok(bounded("publish", self.op_timeout, async move {
            let id: String = redis::cmd("XADD")
                .arg(stream)
                .arg("*")
                .arg(PAYLOAD_FIELD)
                .arg(payload)
                .query_async(&mut conn)
                .await?;
            Ok(id)
        })
        .await?)
    }
}
