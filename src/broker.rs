use crate::envelope::BatchMessage;
use crate::error::{IngestError, Result};
use async_trait::async_trait;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Producer side of the broker: append one record per accepted HTTP call.
/// Failures surface synchronously so the endpoint can report a server error
/// instead of a false accept.
#[async_trait]
pub trait BatchProducer: Send + Sync {
    async fn enqueue(&self, batch: &BatchMessage) -> Result<String>;
}

/// One claimed broker record, still owned by the consumer until acked.
#[derive(Debug, Clone)]
pub struct BatchRecord {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// Consumer side of the broker, under a shared consumer group.
///
/// `claim` blocks up to a fixed interval for new records; `ack` acknowledges
/// and deletes the record, bounding log growth. A claimed-but-unacked record
/// is redelivered once its claim window lapses.
#[async_trait]
pub trait BatchStream: Send + Sync {
    async fn ensure_group(&self) -> Result<()>;
    async fn claim(&self, consumer: &str, max: usize) -> Result<Vec<BatchRecord>>;
    async fn ack(&self, record_id: &str) -> Result<()>;
}

/// Redis Streams broker; the production implementation.
pub struct RedisBroker {
    client: redis::Client,
    stream_key: String,
    group: String,
    block_ms: u64,
}

impl RedisBroker {
    pub fn new(redis_url: &str, stream_key: &str, group: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            stream_key: stream_key.to_string(),
            group: group.to_string(),
            block_ms: crate::constants::CONSUMER_BLOCK_MS,
        })
    }
}

#[async_trait]
impl BatchProducer for RedisBroker {
    async fn enqueue(&self, batch: &BatchMessage) -> Result<String> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let fields = batch.to_fields()?;
        let record_id: String = conn.xadd(&self.stream_key, "*", &fields).await?;
        crate::metrics::broker::enqueued();
        info!(
            request_id = %batch.request_id,
            client_request_id = %batch.client_request_id,
            mb_ip = %batch.mb_ip,
            item_count = batch.items.len(),
            record_id = %record_id,
            "Enqueued batch"
        );
        Ok(record_id)
    }
}

#[async_trait]
impl BatchStream for RedisBroker {
    async fn ensure_group(&self) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(&self.stream_key, &self.group, "$")
            .await;
        match created {
            Ok(()) => Ok(()),
            // A second worker creating the same group is normal.
            Err(e) if e.code() == Some("BUSYGROUP") => {
                warn!(group = %self.group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn claim(&self, consumer: &str, max: usize) -> Result<Vec<BatchRecord>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let opts = StreamReadOptions::default()
            .group(&self.group, consumer)
            .count(max)
            .block(self.block_ms as usize);
        let reply: StreamReadReply = conn
            .xread_options(&[&self.stream_key], &[">"], &opts)
            .await?;
        let mut records = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                let mut fields = HashMap::new();
                for (name, value) in entry.map.iter() {
                    let text: String = redis::from_redis_value(value).map_err(|e| {
                        IngestError::Envelope(format!(
                            "record {} field '{}' not a string: {}",
                            entry.id, name, e
                        ))
                    })?;
                    fields.insert(name.clone(), text);
                }
                records.push(BatchRecord {
                    id: entry.id.clone(),
                    fields,
                });
            }
        }
        Ok(records)
    }

    async fn ack(&self, record_id: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: i64 = conn
            .xack(&self.stream_key, &self.group, &[record_id])
            .await?;
        let _: i64 = conn.xdel(&self.stream_key, &[record_id]).await?;
        Ok(())
    }
}

struct PendingRecord {
    fields: HashMap<String, String>,
    claimed_at: Instant,
}

struct InMemoryState {
    next_id: u64,
    queue: VecDeque<BatchRecord>,
    pending: HashMap<String, PendingRecord>,
}

/// In-memory broker with the same consumer-group semantics, for tests and
/// the single-process `run` mode. Claimed records that are not acked within
/// the claim window are redelivered on a later claim.
pub struct InMemoryBroker {
    state: Arc<Mutex<InMemoryState>>,
    block: Duration,
    claim_timeout: Duration,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryState {
                next_id: 1,
                queue: VecDeque::new(),
                pending: HashMap::new(),
            })),
            block: Duration::from_millis(100),
            claim_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    /// Records currently in the log (unclaimed plus claimed-but-unacked).
    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.queue.len() + state.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_ready(&self, max: usize) -> Vec<BatchRecord> {
        let mut state = self.state.lock().unwrap();
        // Expired claims go back to the front of the queue for redelivery.
        let now = Instant::now();
        let expired: Vec<String> = state
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.claimed_at) >= self.claim_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(p) = state.pending.remove(&id) {
                state.queue.push_front(BatchRecord {
                    id,
                    fields: p.fields,
                });
            }
        }
        let mut out = Vec::new();
        while out.len() < max {
            match state.queue.pop_front() {
                Some(record) => {
                    state.pending.insert(
                        record.id.clone(),
                        PendingRecord {
                            fields: record.fields.clone(),
                            claimed_at: now,
                        },
                    );
                    out.push(record);
                }
                None => break,
            }
        }
        out
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BatchProducer for InMemoryBroker {
    async fn enqueue(&self, batch: &BatchMessage) -> Result<String> {
        let fields: HashMap<String, String> = batch.to_fields()?.into_iter().collect();
        let mut state = self.state.lock().unwrap();
        let id = format!("{}-0", state.next_id);
        state.next_id += 1;
        state.queue.push_back(BatchRecord {
            id: id.clone(),
            fields,
        });
        crate::metrics::broker::enqueued();
        Ok(id)
    }
}

#[async_trait]
impl BatchStream for InMemoryBroker {
    async fn ensure_group(&self) -> Result<()> {
        Ok(())
    }

    async fn claim(&self, _consumer: &str, max: usize) -> Result<Vec<BatchRecord>> {
        let deadline = Instant::now() + self.block;
        loop {
            let records = self.take_ready(max);
            if !records.is_empty() || Instant::now() >= deadline {
                return Ok(records);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn ack(&self, record_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.pending.remove(record_id);
        Ok(())
    }
}
