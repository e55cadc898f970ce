pub mod consumers;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::StoreError;
use crate::events::{BatchMeta, EvaluationEvent};

pub const SNAPSHOT_QUEUE: &str = "snapshots";
pub const EVALUATION_QUEUE: &str = "evaluations";

/// How long a dequeued delivery stays invisible before it is assumed
/// abandoned (consumer crashed between dequeue and ack) and reclaimed.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);

/// One snapshot rebuild request: rebuild and publish the snapshot for a
/// single (org, project, environment).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotJob {
    pub org_id: String,
    pub project_id: String,
    pub environment_slug: String,
}

/// One ingested batch of evaluation telemetry, as accepted by
/// `POST /sdk/evaluations` and forwarded to the durable sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationBatch {
    pub meta: BatchMeta,
    pub events: Vec<EvaluationEvent>,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: Uuid,
    pub payload: Value,
    pub attempts: i32,
}

/// At-least-once job queue. A dequeued delivery stays invisible until it is
/// acked (side effect succeeded) or nacked (returned for redelivery).
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, queue: &str, payload: Value) -> Result<(), StoreError>;
    async fn dequeue(&self, queue: &str, max: usize) -> Result<Vec<Delivery>, StoreError>;
    async fn ack(&self, queue: &str, ids: &[Uuid]) -> Result<(), StoreError>;
    async fn nack(&self, queue: &str, ids: &[Uuid]) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryQueueState {
    ready: VecDeque<Delivery>,
    in_flight: HashMap<Uuid, (Instant, Delivery)>,
}

/// In-memory backend for tests and local runs. Redelivery order after a
/// nack is front-of-queue so retries happen promptly. Deliveries held past
/// the visibility timeout are reclaimed on the next dequeue, with their
/// attempt count bumped like a nack.
pub struct MemoryQueue {
    queues: Mutex<HashMap<String, MemoryQueueState>>,
    visibility_timeout: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            visibility_timeout,
        }
    }

    pub fn depth(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .unwrap()
            .get(queue)
            .map(|state| state.ready.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, queue: &str, payload: Value) -> Result<(), StoreError> {
        let mut queues = self.queues.lock().unwrap();
        queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(Delivery {
                id: Uuid::new_v4(),
                payload,
                attempts: 0,
            });
        Ok(())
    }

    async fn dequeue(&self, queue: &str, max: usize) -> Result<Vec<Delivery>, StoreError> {
        let now = Instant::now();
        let mut queues = self.queues.lock().unwrap();
        let state = queues.entry(queue.to_string()).or_default();

        // Reclaim abandoned deliveries before handing out new ones.
        let stale: Vec<Uuid> = state
            .in_flight
            .iter()
            .filter(|(_, (claimed_at, _))| now.duration_since(*claimed_at) >= self.visibility_timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some((_, mut delivery)) = state.in_flight.remove(&id) {
                delivery.attempts += 1;
                state.ready.push_front(delivery);
            }
        }

        let take = state.ready.len().min(max);
        let mut deliveries = Vec::with_capacity(take);
        for _ in 0..take {
            if let Some(delivery) = state.ready.pop_front() {
                state.in_flight.insert(delivery.id, (now, delivery.clone()));
                deliveries.push(delivery);
            }
        }
        Ok(deliveries)
    }

    async fn ack(&self, queue: &str, ids: &[Uuid]) -> Result<(), StoreError> {
        let mut queues = self.queues.lock().unwrap();
        if let Some(state) = queues.get_mut(queue) {
            for id in ids {
                state.in_flight.remove(id);
            }
        }
        Ok(())
    }

    async fn nack(&self, queue: &str, ids: &[Uuid]) -> Result<(), StoreError> {
        let mut queues = self.queues.lock().unwrap();
        if let Some(state) = queues.get_mut(queue) {
            for id in ids.iter().rev() {
                if let Some((_, mut delivery)) = state.in_flight.remove(id) {
                    delivery.attempts += 1;
                    state.ready.push_front(delivery);
                }
            }
        }
        Ok(())
    }
}

/// Postgres-backed queue over a lockable job table (see migrations).
/// Dequeue claims rows with `FOR UPDATE SKIP LOCKED` so concurrent
/// consumers never double-claim a job. Rows locked longer than the
/// visibility timeout are treated as abandoned and claimed again, so a
/// consumer crash between dequeue and ack cannot strand a job.
pub struct PgQueue {
    pool: PgPool,
    visibility_timeout: Duration,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self::with_visibility_timeout(pool, DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(pool: PgPool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
        }
    }
}

#[async_trait]
impl JobQueue for PgQueue {
    async fn enqueue(&self, queue: &str, payload: Value) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO queue_jobs (id, queue, payload) VALUES ($1, $2, $3)")
            .bind(Uuid::new_v4())
            .bind(queue)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn dequeue(&self, queue: &str, max: usize) -> Result<Vec<Delivery>, StoreError> {
        let rows: Vec<(Uuid, Value, i32)> = sqlx::query_as(
            r#"
            UPDATE queue_jobs
            SET locked_at = NOW(),
                attempts = attempts + CASE WHEN locked_at IS NULL THEN 0 ELSE 1 END
            WHERE id IN (
                SELECT id FROM queue_jobs
                WHERE queue = $1
                  AND (locked_at IS NULL OR locked_at < NOW() - make_interval(secs => $3))
                ORDER BY created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, attempts
            "#,
        )
        .bind(queue)
        .bind(max as i64)
        .bind(self.visibility_timeout.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, payload, attempts)| Delivery {
                id,
                payload,
                attempts,
            })
            .collect())
    }

    async fn ack(&self, _queue: &str, ids: &[Uuid]) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM queue_jobs WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn nack(&self, _queue: &str, ids: &[Uuid]) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE queue_jobs SET locked_at = NULL, attempts = attempts + 1 WHERE id = ANY($1)",
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn ack_removes_delivery_permanently() {
        let queue = MemoryQueue::new();
        queue.enqueue(SNAPSHOT_QUEUE, json!({"n": 1})).await.unwrap();

        let deliveries = queue.dequeue(SNAPSHOT_QUEUE, 10).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        queue
            .ack(SNAPSHOT_QUEUE, &[deliveries[0].id])
            .await
            .unwrap();

        assert!(queue.dequeue(SNAPSHOT_QUEUE, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn nack_redelivers_with_bumped_attempts() {
        let queue = MemoryQueue::new();
        queue.enqueue(EVALUATION_QUEUE, json!({"n": 1})).await.unwrap();

        let first = queue.dequeue(EVALUATION_QUEUE, 10).await.unwrap();
        queue.nack(EVALUATION_QUEUE, &[first[0].id]).await.unwrap();

        let second = queue.dequeue(EVALUATION_QUEUE, 10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, first[0].id);
        assert_eq!(second[0].attempts, 1);
    }

    #[tokio::test]
    async fn dequeue_respects_max_and_order() {
        let queue = MemoryQueue::new();
        for i in 0..5 {
            queue.enqueue(SNAPSHOT_QUEUE, json!({"n": i})).await.unwrap();
        }
        let batch = queue.dequeue(SNAPSHOT_QUEUE, 3).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].payload["n"], json!(0));
        assert_eq!(queue.depth(SNAPSHOT_QUEUE), 2);
    }

    #[tokio::test]
    async fn in_flight_deliveries_are_invisible_within_timeout() {
        let queue = MemoryQueue::new();
        queue.enqueue(SNAPSHOT_QUEUE, json!({})).await.unwrap();
        let _held = queue.dequeue(SNAPSHOT_QUEUE, 10).await.unwrap();
        assert!(queue.dequeue(SNAPSHOT_QUEUE, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn abandoned_deliveries_are_reclaimed_after_timeout() {
        let queue = MemoryQueue::with_visibility_timeout(Duration::ZERO);
        queue.enqueue(SNAPSHOT_QUEUE, json!({"n": 1})).await.unwrap();

        // A consumer claims the delivery and then dies without ack or nack.
        let held = queue.dequeue(SNAPSHOT_QUEUE, 10).await.unwrap();
        assert_eq!(held.len(), 1);

        let reclaimed = queue.dequeue(SNAPSHOT_QUEUE, 10).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, held[0].id);
        assert_eq!(reclaimed[0].attempts, 1);
    }
}
