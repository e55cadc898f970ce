use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::evaluation::{EvaluationContext, EvaluationDetail, Reason};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// One telemetry record per evaluation. Created once, owned by the buffer
/// until flushed, never mutated. Carries attribute key names only; no
/// attribute values leave the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationEvent {
    pub flag_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variation_key: Option<String>,
    pub value: Value,
    pub reason: Reason,
    pub context_kinds: Vec<String>,
    pub context_keys: Vec<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_target_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flag_config_version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation_duration_us: Option<u64>,
    pub is_anonymous: bool,
}

impl EvaluationEvent {
    pub fn from_detail(
        flag_key: &str,
        detail: &EvaluationDetail,
        context: &EvaluationContext,
        flag_config_version: Option<u64>,
        evaluation_duration_us: Option<u64>,
    ) -> Self {
        Self {
            flag_key: flag_key.to_string(),
            variation_key: detail.variation_key.clone(),
            value: detail.value.clone(),
            reason: detail.reason,
            context_kinds: context.kinds(),
            context_keys: context.attribute_keys(),
            timestamp: Utc::now(),
            matched_target_name: detail.matched_target_name.clone(),
            flag_config_version,
            error_detail: detail.error_detail.clone(),
            evaluation_duration_us,
            is_anonymous: context.is_anonymous(),
        }
    }
}

/// Platform/SDK metadata attached to every flushed batch. Matches the
/// ingestion queue's `EvaluationBatch.meta` schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<String>,
    pub sdk_version: String,
    pub sdk_key: String,
    pub user_agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdk_platform: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EventBufferConfig {
    /// Full URL of the gateway's `/sdk/evaluations` endpoint.
    pub endpoint: String,
    pub api_key: String,
    pub flush_interval: Duration,
    pub max_batch_size: usize,
    pub meta: BatchMeta,
}

/// In-process batching of evaluation telemetry. A periodic timer and a
/// max-batch threshold both trigger flushes; whichever trips first wins.
/// Delivery is best-effort at-most-once: a failed send drops that batch
/// permanently to bound memory.
#[derive(Clone)]
pub struct EventBuffer {
    inner: Arc<BufferInner>,
}

struct BufferInner {
    config: EventBufferConfig,
    queue: Mutex<VecDeque<EvaluationEvent>>,
    http: reqwest::Client,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl EventBuffer {
    pub fn new(config: EventBufferConfig) -> Self {
        let buffer = Self {
            inner: Arc::new(BufferInner {
                config,
                queue: Mutex::new(VecDeque::new()),
                http: reqwest::Client::new(),
                timer: Mutex::new(None),
            }),
        };
        buffer.start_timer();
        buffer
    }

    fn start_timer(&self) {
        // Off-runtime construction (plain unit tests) just skips the timer.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let interval = self.inner.config.flush_interval;
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick is immediate
            loop {
                ticker.tick().await;
                flush(&inner).await;
            }
        });
        *self.inner.timer.lock().unwrap() = Some(handle);
    }

    /// Hand one event to the buffer. Triggers an immediate flush once the
    /// batch threshold is reached.
    pub fn push(&self, event: EvaluationEvent) {
        let should_flush = {
            let mut queue = self.inner.queue.lock().unwrap();
            queue.push_back(event);
            queue.len() >= self.inner.config.max_batch_size
        };
        if should_flush {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let inner = Arc::clone(&self.inner);
                handle.spawn(async move {
                    flush(&inner).await;
                });
            }
            // Without a runtime the periodic timer picks the batch up.
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    /// Send whatever is queued right now.
    pub async fn flush_now(&self) {
        flush(&self.inner).await;
    }

    /// Stop the timer and flush anything still pending.
    pub async fn close(&self) {
        if let Some(handle) = self.inner.timer.lock().unwrap().take() {
            handle.abort();
        }
        // Drain fully on shutdown, not just one batch.
        while self.pending() > 0 {
            let before = self.pending();
            flush(&self.inner).await;
            if self.pending() >= before {
                break; // nothing was sent; drop semantics already applied
            }
        }
    }
}

fn drain_batch(queue: &Mutex<VecDeque<EvaluationEvent>>, max: usize) -> Vec<EvaluationEvent> {
    let mut queue = queue.lock().unwrap();
    let take = queue.len().min(max);
    queue.drain(..take).collect()
}

fn batch_payload(meta: &BatchMeta, events: &[EvaluationEvent]) -> Value {
    serde_json::json!({
        "meta": meta,
        "events": events,
    })
}

async fn flush(inner: &BufferInner) {
    let events = drain_batch(&inner.queue, inner.config.max_batch_size);
    if events.is_empty() {
        return;
    }
    let count = events.len();
    let payload = batch_payload(&inner.config.meta, &events);
    let result = inner
        .http
        .post(&inner.config.endpoint)
        .bearer_auth(&inner.config.api_key)
        .json(&payload)
        .send()
        .await;
    match result {
        Ok(response) if response.status().is_success() => {
            tracing::debug!(count, "flushed evaluation events");
        }
        Ok(response) => {
            // Batch is gone; telemetry is at-most-once by design.
            tracing::warn!(count, status = %response.status(), "event flush rejected, dropping batch");
        }
        Err(err) => {
            tracing::warn!(count, error = %err, "event flush failed, dropping batch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::EvaluationDetail;
    use serde_json::json;

    fn sample_event(flag_key: &str) -> EvaluationEvent {
        let detail = EvaluationDetail {
            value: json!(true),
            variation_key: Some("on".to_string()),
            reason: Reason::DefaultVariation,
            matched_target_name: None,
            error_detail: None,
        };
        let ctx = EvaluationContext::new().with("user", "plan", json!("pro"));
        EvaluationEvent::from_detail(flag_key, &detail, &ctx, Some(3), Some(12))
    }

    fn test_config(endpoint: &str) -> EventBufferConfig {
        EventBufferConfig {
            endpoint: endpoint.to_string(),
            api_key: "sdk-key".to_string(),
            flush_interval: Duration::from_secs(3600),
            max_batch_size: 3,
            meta: BatchMeta {
                project_id: Some("proj-1".to_string()),
                organization_id: Some("org-1".to_string()),
                environment_id: None,
                sdk_version: "0.1.0".to_string(),
                sdk_key: "sdk-key".to_string(),
                user_agent: "flagsnap-test".to_string(),
                sdk_platform: Some("server".to_string()),
            },
        }
    }

    #[test]
    fn event_records_key_names_not_values() {
        let event = sample_event("my_flag");
        assert_eq!(event.context_kinds, vec!["user".to_string()]);
        assert_eq!(event.context_keys, vec!["plan".to_string()]);
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("pro"));
    }

    #[test]
    fn drain_batch_takes_oldest_first() {
        let queue = Mutex::new(VecDeque::new());
        for i in 0..5 {
            queue
                .lock()
                .unwrap()
                .push_back(sample_event(&format!("flag_{}", i)));
        }
        let batch = drain_batch(&queue, 3);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].flag_key, "flag_0");
        assert_eq!(batch[2].flag_key, "flag_2");
        assert_eq!(queue.lock().unwrap().len(), 2);
    }

    #[test]
    fn batch_payload_wraps_meta_and_events() {
        let config = test_config("http://unused");
        let payload = batch_payload(&config.meta, &[sample_event("f")]);
        assert_eq!(payload["meta"]["sdkVersion"], json!("0.1.0"));
        assert_eq!(payload["events"].as_array().unwrap().len(), 1);
        assert_eq!(payload["events"][0]["flagKey"], json!("f"));
    }

    #[tokio::test]
    async fn failed_flush_drops_the_batch() {
        // Nothing listens on this port; the send fails and the batch is gone.
        let buffer = EventBuffer::new(test_config("http://127.0.0.1:1/sdk/evaluations"));
        buffer.push(sample_event("a"));
        buffer.push(sample_event("b"));
        buffer.flush_now().await;
        assert_eq!(buffer.pending(), 0);
        buffer.close().await;
    }

    #[tokio::test]
    async fn threshold_push_schedules_a_flush() {
        let buffer = EventBuffer::new(test_config("http://127.0.0.1:1/sdk/evaluations"));
        for i in 0..3 {
            buffer.push(sample_event(&format!("flag_{}", i)));
        }
        // The threshold flush runs as a spawned task; give it a moment.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(buffer.pending(), 0);
        buffer.close().await;
    }
}
