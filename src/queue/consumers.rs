use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{ConsumerError, StoreError};
use crate::queue::{
    Delivery, EvaluationBatch, JobQueue, SnapshotJob, EVALUATION_QUEUE, SNAPSHOT_QUEUE,
};
use crate::snapshot::{snapshot_key, validate_snapshot, Snapshot};
use crate::store::KvStore;

/// Where rebuilt snapshots come from. The production implementation calls
/// the control plane's internal build RPC; tests substitute their own.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn build(&self, job: &SnapshotJob) -> Result<Snapshot, ConsumerError>;
}

/// Durable sink receiving forwarded evaluation batches. At-least-once: the
/// sink may see the same batch more than once after a partial failure.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn forward(&self, batches: &[EvaluationBatch]) -> Result<(), ConsumerError>;
}

/// HTTP client for the control plane's internal snapshot-build RPC.
pub struct ControlPlaneClient {
    base_url: String,
    http: reqwest::Client,
}

impl ControlPlaneClient {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SnapshotSource for ControlPlaneClient {
    async fn build(&self, job: &SnapshotJob) -> Result<Snapshot, ConsumerError> {
        let url = format!("{}/internal/build-snapshot", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(job)
            .send()
            .await
            .map_err(|e| ConsumerError::Upstream(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ConsumerError::Upstream(format!(
                "control plane returned {}",
                response.status()
            )));
        }
        response
            .json::<Snapshot>()
            .await
            .map_err(|e| ConsumerError::Upstream(e.to_string()))
    }
}

/// Forwards batches to the analytics sink in one HTTP call.
pub struct HttpEventSink {
    url: String,
    http: reqwest::Client,
}

impl HttpEventSink {
    pub fn new(url: String) -> Self {
        Self {
            url,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EventSink for HttpEventSink {
    async fn forward(&self, batches: &[EvaluationBatch]) -> Result<(), ConsumerError> {
        let response = self
            .http
            .post(&self.url)
            .json(&serde_json::json!({ "batches": batches }))
            .send()
            .await
            .map_err(|e| ConsumerError::Upstream(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ConsumerError::Upstream(format!(
                "sink returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// One pass of the snapshot consumer. Messages are processed one at a time
/// to keep KV writes ordered per key; each is acked only after its snapshot
/// landed in the store, and nacked for redelivery otherwise.
pub async fn snapshot_consumer_tick(
    queue: &dyn JobQueue,
    kv: &dyn KvStore,
    source: &dyn SnapshotSource,
    max: usize,
) -> Result<usize, StoreError> {
    let deliveries = queue.dequeue(SNAPSHOT_QUEUE, max).await?;
    let mut published = 0;
    for delivery in deliveries {
        match process_snapshot_job(&delivery, kv, source).await {
            Ok(key) => {
                queue.ack(SNAPSHOT_QUEUE, &[delivery.id]).await?;
                tracing::info!(%key, "published snapshot");
                published += 1;
            }
            Err(err) => {
                tracing::warn!(
                    id = %delivery.id,
                    attempts = delivery.attempts,
                    error = %err,
                    "snapshot job failed, leaving for redelivery"
                );
                queue.nack(SNAPSHOT_QUEUE, &[delivery.id]).await?;
            }
        }
    }
    Ok(published)
}

async fn process_snapshot_job(
    delivery: &Delivery,
    kv: &dyn KvStore,
    source: &dyn SnapshotSource,
) -> Result<String, ConsumerError> {
    let job: SnapshotJob = serde_json::from_value(delivery.payload.clone())
        .map_err(|e| ConsumerError::Upstream(format!("malformed snapshot job: {}", e)))?;
    let snapshot = source.build(&job).await?;
    validate_snapshot(&snapshot).map_err(ConsumerError::Upstream)?;
    let key = snapshot_key(&job.org_id, &job.project_id, &job.environment_slug);
    let document = serde_json::to_value(&snapshot).map_err(StoreError::from)?;
    kv.put(&key, document).await?;
    Ok(key)
}

/// One pass of the ingestion consumer: drain up to `max` queued batches and
/// forward them to the durable sink in one call. On failure the entire
/// batch of messages is nacked, so already-stored sub-batches may be
/// delivered to the sink again. Duplication is accepted for analytics.
pub async fn ingestion_consumer_tick(
    queue: &dyn JobQueue,
    sink: &dyn EventSink,
    max: usize,
) -> Result<usize, StoreError> {
    let deliveries = queue.dequeue(EVALUATION_QUEUE, max).await?;
    if deliveries.is_empty() {
        return Ok(0);
    }

    let ids: Vec<Uuid> = deliveries.iter().map(|d| d.id).collect();
    let mut batches = Vec::with_capacity(deliveries.len());
    for delivery in &deliveries {
        match serde_json::from_value::<EvaluationBatch>(delivery.payload.clone()) {
            Ok(batch) => batches.push(batch),
            Err(err) => {
                // Malformed payloads can never succeed; forwarding skips
                // them but they are still acked with the batch.
                tracing::warn!(id = %delivery.id, error = %err, "skipping malformed evaluation batch");
            }
        }
    }

    match sink.forward(&batches).await {
        Ok(()) => {
            queue.ack(EVALUATION_QUEUE, &ids).await?;
            Ok(deliveries.len())
        }
        Err(err) => {
            tracing::warn!(count = ids.len(), error = %err, "sink forward failed, retrying whole batch");
            queue.nack(EVALUATION_QUEUE, &ids).await?;
            Ok(0)
        }
    }
}

/// Long-running snapshot consumer loop.
pub async fn run_snapshot_consumer(
    queue: Arc<dyn JobQueue>,
    kv: Arc<dyn KvStore>,
    source: Arc<dyn SnapshotSource>,
    poll_interval: Duration,
) {
    loop {
        match snapshot_consumer_tick(queue.as_ref(), kv.as_ref(), source.as_ref(), 10).await {
            Ok(0) | Err(_) => tokio::time::sleep(poll_interval).await,
            Ok(_) => {}
        }
    }
}

/// Long-running ingestion consumer loop.
pub async fn run_ingestion_consumer(
    queue: Arc<dyn JobQueue>,
    sink: Arc<dyn EventSink>,
    poll_interval: Duration,
) {
    loop {
        match ingestion_consumer_tick(queue.as_ref(), sink.as_ref(), 25).await {
            Ok(0) | Err(_) => tokio::time::sleep(poll_interval).await,
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BatchMeta;
    use crate::queue::MemoryQueue;
    use crate::snapshot::SnapshotMeta;
    use crate::store::MemoryKv;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_snapshot(slug: &str) -> Snapshot {
        Snapshot {
            version: 1,
            generated_at: Utc::now(),
            meta: SnapshotMeta {
                project_id: "p1".to_string(),
                organization_id: "o1".to_string(),
                environment_id: "e1".to_string(),
                environment_slug: slug.to_string(),
            },
            flags: HashMap::new(),
            segments: HashMap::new(),
        }
    }

    struct FixedSource;

    #[async_trait]
    impl SnapshotSource for FixedSource {
        async fn build(&self, job: &SnapshotJob) -> Result<Snapshot, ConsumerError> {
            Ok(sample_snapshot(&job.environment_slug))
        }
    }

    struct FailingSource;

    #[async_trait]
    impl SnapshotSource for FailingSource {
        async fn build(&self, _job: &SnapshotJob) -> Result<Snapshot, ConsumerError> {
            Err(ConsumerError::Upstream("control plane down".to_string()))
        }
    }

    struct CountingSink {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl EventSink for CountingSink {
        async fn forward(&self, _batches: &[EvaluationBatch]) -> Result<(), ConsumerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ConsumerError::Upstream("sink down".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn sample_batch() -> EvaluationBatch {
        EvaluationBatch {
            meta: BatchMeta {
                project_id: Some("p1".to_string()),
                organization_id: Some("o1".to_string()),
                environment_id: None,
                sdk_version: "0.1.0".to_string(),
                sdk_key: "k".to_string(),
                user_agent: "test".to_string(),
                sdk_platform: None,
            },
            events: vec![],
        }
    }

    #[tokio::test]
    async fn snapshot_job_publishes_and_acks() {
        let queue = MemoryQueue::new();
        let kv = MemoryKv::new();
        let job = SnapshotJob {
            org_id: "o1".to_string(),
            project_id: "p1".to_string(),
            environment_slug: "production".to_string(),
        };
        queue
            .enqueue(SNAPSHOT_QUEUE, serde_json::to_value(&job).unwrap())
            .await
            .unwrap();

        let published = snapshot_consumer_tick(&queue, &kv, &FixedSource, 10)
            .await
            .unwrap();
        assert_eq!(published, 1);

        let stored = kv
            .get("snapshot:o1:p1:production")
            .await
            .unwrap()
            .expect("snapshot should be in the KV store");
        assert_eq!(stored["version"], json!(1));
        // Acked: nothing left to redeliver.
        assert!(queue.dequeue(SNAPSHOT_QUEUE, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_snapshot_build_is_redelivered() {
        let queue = MemoryQueue::new();
        let kv = MemoryKv::new();
        let job = SnapshotJob {
            org_id: "o1".to_string(),
            project_id: "p1".to_string(),
            environment_slug: "production".to_string(),
        };
        queue
            .enqueue(SNAPSHOT_QUEUE, serde_json::to_value(&job).unwrap())
            .await
            .unwrap();

        let published = snapshot_consumer_tick(&queue, &kv, &FailingSource, 10)
            .await
            .unwrap();
        assert_eq!(published, 0);
        assert!(kv.get("snapshot:o1:p1:production").await.unwrap().is_none());

        let redelivered = queue.dequeue(SNAPSHOT_QUEUE, 10).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].attempts, 1);
    }

    #[tokio::test]
    async fn ingestion_forwards_messages_as_one_call() {
        let queue = MemoryQueue::new();
        for _ in 0..3 {
            queue
                .enqueue(
                    EVALUATION_QUEUE,
                    serde_json::to_value(sample_batch()).unwrap(),
                )
                .await
                .unwrap();
        }
        let sink = CountingSink {
            calls: AtomicUsize::new(0),
            fail: false,
        };

        let forwarded = ingestion_consumer_tick(&queue, &sink, 25).await.unwrap();
        assert_eq!(forwarded, 3);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
        assert!(queue.dequeue(EVALUATION_QUEUE, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_forward_retries_entire_batch() {
        let queue = MemoryQueue::new();
        for _ in 0..2 {
            queue
                .enqueue(
                    EVALUATION_QUEUE,
                    serde_json::to_value(sample_batch()).unwrap(),
                )
                .await
                .unwrap();
        }
        let sink = CountingSink {
            calls: AtomicUsize::new(0),
            fail: true,
        };

        let forwarded = ingestion_consumer_tick(&queue, &sink, 25).await.unwrap();
        assert_eq!(forwarded, 0);

        // Both messages come back as one redeliverable batch.
        let redelivered = queue.dequeue(EVALUATION_QUEUE, 10).await.unwrap();
        assert_eq!(redelivered.len(), 2);
    }
}
