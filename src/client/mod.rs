use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::error::ClientError;
use crate::evaluation::{evaluate, EvaluationContext, EvaluationDetail, Reason};
use crate::events::{
    BatchMeta, EvaluationEvent, EventBuffer, EventBufferConfig, DEFAULT_FLUSH_INTERVAL,
    DEFAULT_MAX_BATCH_SIZE,
};
use crate::snapshot::Snapshot;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Where this client is embedded. Injected at construction; never inferred
/// from ambient globals.
#[derive(Debug, Clone)]
pub struct Platform {
    pub name: String,
    pub sdk_version: String,
    pub user_agent: String,
}

impl Platform {
    pub fn server() -> Self {
        Self {
            name: "server".to_string(),
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
            user_agent: format!("flagsnap-rust/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn edge() -> Self {
        Self {
            name: "edge".to_string(),
            ..Self::server()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub environment: String,
    pub platform: Platform,
    /// `None` disables background polling.
    pub poll_interval: Option<Duration>,
    pub telemetry: bool,
    pub flush_interval: Duration,
    pub max_batch_size: usize,
}

pub struct FlagClientBuilder {
    config: ClientConfig,
}

impl FlagClientBuilder {
    pub fn new(base_url: &str, api_key: &str, environment: &str) -> Self {
        Self {
            config: ClientConfig {
                base_url: base_url.trim_end_matches('/').to_string(),
                api_key: api_key.to_string(),
                environment: environment.to_string(),
                platform: Platform::server(),
                poll_interval: Some(DEFAULT_POLL_INTERVAL),
                telemetry: true,
                flush_interval: DEFAULT_FLUSH_INTERVAL,
                max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            },
        }
    }

    pub fn platform(mut self, platform: Platform) -> Self {
        self.config.platform = platform;
        self
    }

    pub fn poll_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn telemetry(mut self, enabled: bool) -> Self {
        self.config.telemetry = enabled;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.config.max_batch_size = size;
        self
    }

    pub fn build(self) -> FlagClient {
        FlagClient::new(self.config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Uninitialized,
    Initializing,
    Ready,
    /// Init failed; the instance is permanently unusable and callers retry
    /// by constructing a new client.
    Failed,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitResponse {
    valid: bool,
    org_id: Option<String>,
    project_id: Option<String>,
    error: Option<String>,
}

type UpdateHook = Arc<dyn Fn(u64) + Send + Sync>;

struct ClientInner {
    config: ClientConfig,
    http: reqwest::Client,
    state: RwLock<ClientState>,
    // Swapped wholesale; readers always see a complete snapshot.
    snapshot: RwLock<Option<Arc<Snapshot>>>,
    context: RwLock<EvaluationContext>,
    events: Mutex<Option<EventBuffer>>,
    update_hooks: Mutex<Vec<UpdateHook>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    init_gate: tokio::sync::Mutex<()>,
}

/// Embeddable client runtime wrapping the evaluator with lifecycle,
/// context identification and typed accessors.
#[derive(Clone)]
pub struct FlagClient {
    inner: Arc<ClientInner>,
}

impl FlagClient {
    pub fn builder(base_url: &str, api_key: &str, environment: &str) -> FlagClientBuilder {
        FlagClientBuilder::new(base_url, api_key, environment)
    }

    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                http: reqwest::Client::new(),
                state: RwLock::new(ClientState::Uninitialized),
                snapshot: RwLock::new(None),
                context: RwLock::new(EvaluationContext::new()),
                events: Mutex::new(None),
                update_hooks: Mutex::new(Vec::new()),
                poll_task: Mutex::new(None),
                init_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> ClientState {
        *self.inner.state.read().unwrap()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ClientState::Ready
    }

    /// Drive initialization: validate the API key, then fetch the first
    /// snapshot. Idempotent once ready; a failed init is terminal.
    pub async fn ready(&self) -> Result<(), ClientError> {
        let _gate = self.inner.init_gate.lock().await;
        match self.state() {
            ClientState::Ready => return Ok(()),
            ClientState::Failed => return Err(ClientError::InitFailed),
            ClientState::Uninitialized | ClientState::Initializing => {}
        }
        *self.inner.state.write().unwrap() = ClientState::Initializing;

        match self.initialize().await {
            Ok(()) => {
                *self.inner.state.write().unwrap() = ClientState::Ready;
                self.start_polling();
                Ok(())
            }
            Err(err) => {
                *self.inner.state.write().unwrap() = ClientState::Failed;
                Err(err)
            }
        }
    }

    async fn initialize(&self) -> Result<(), ClientError> {
        let init = self.validate_api_key().await?;
        let snapshot = self.fetch_snapshot().await?;

        if self.inner.config.telemetry {
            let platform = &self.inner.config.platform;
            let meta = BatchMeta {
                project_id: init.project_id.clone(),
                organization_id: init.org_id.clone(),
                environment_id: Some(snapshot.meta.environment_id.clone()),
                sdk_version: platform.sdk_version.clone(),
                sdk_key: self.inner.config.api_key.clone(),
                user_agent: platform.user_agent.clone(),
                sdk_platform: Some(platform.name.clone()),
            };
            let buffer = EventBuffer::new(EventBufferConfig {
                endpoint: format!("{}/sdk/evaluations", self.inner.config.base_url),
                api_key: self.inner.config.api_key.clone(),
                flush_interval: self.inner.config.flush_interval,
                max_batch_size: self.inner.config.max_batch_size,
                meta,
            });
            *self.inner.events.lock().unwrap() = Some(buffer);
        }

        self.apply_snapshot(snapshot);
        Ok(())
    }

    async fn validate_api_key(&self) -> Result<InitResponse, ClientError> {
        let url = format!("{}/sdk/init", self.inner.config.base_url);
        let response = self
            .inner
            .http
            .post(&url)
            .json(&serde_json::json!({ "apiKey": self.inner.config.api_key }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ClientError::Protocol(format!(
                "init returned {}",
                response.status()
            )));
        }
        let init: InitResponse = response.json().await?;
        if !init.valid {
            return Err(ClientError::InvalidApiKey(
                init.error.unwrap_or_else(|| "invalid API key".to_string()),
            ));
        }
        Ok(init)
    }

    async fn fetch_snapshot(&self) -> Result<Snapshot, ClientError> {
        let url = format!(
            "{}/sdk/snapshot?environment={}",
            self.inner.config.base_url, self.inner.config.environment
        );
        let response = self
            .inner
            .http
            .get(&url)
            .bearer_auth(&self.inner.config.api_key)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ClientError::SnapshotUnavailable(
                self.inner.config.environment.clone(),
            ));
        }
        if !response.status().is_success() {
            return Err(ClientError::Protocol(format!(
                "snapshot fetch returned {}",
                response.status()
            )));
        }
        Ok(response.json::<Snapshot>().await?)
    }

    /// Swap in a new snapshot. Returns true (and fires update hooks) only
    /// when the version actually changed.
    fn apply_snapshot(&self, snapshot: Snapshot) -> bool {
        let new_version = snapshot.version;
        let previous = {
            let mut slot = self.inner.snapshot.write().unwrap();
            let previous = slot.as_ref().map(|s| s.version);
            *slot = Some(Arc::new(snapshot));
            previous
        };
        let changed = previous != Some(new_version);
        if changed && previous.is_some() {
            // Invoke outside the lock; a hook may register further hooks.
            let hooks: Vec<UpdateHook> =
                self.inner.update_hooks.lock().unwrap().clone();
            for hook in hooks {
                hook(new_version);
            }
        }
        changed
    }

    /// Force-fetch a new snapshot. Racing refreshes are last-writer-wins;
    /// both only replace the snapshot pointer.
    pub async fn refresh(&self) -> Result<bool, ClientError> {
        if !self.is_ready() {
            return Err(ClientError::NotReady);
        }
        let snapshot = self.fetch_snapshot().await?;
        Ok(self.apply_snapshot(snapshot))
    }

    fn start_polling(&self) {
        let Some(interval) = self.inner.config.poll_interval else {
            return;
        };
        let client = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                // Poll failures are logged and swallowed; polling never
                // throws into caller code.
                if let Err(err) = client.refresh().await {
                    tracing::warn!(error = %err, "snapshot poll failed");
                }
            }
        });
        *self.inner.poll_task.lock().unwrap() = Some(handle);
    }

    /// Register a callback fired when a refresh lands a different snapshot
    /// version than the one previously held.
    pub fn on_update(&self, callback: impl Fn(u64) + Send + Sync + 'static) {
        self.inner
            .update_hooks
            .lock()
            .unwrap()
            .push(Arc::new(callback));
    }

    /// Replace the persisted evaluation context.
    pub fn identify(&self, context: EvaluationContext) {
        *self.inner.context.write().unwrap() = context;
    }

    /// Clear the persisted context.
    pub fn reset(&self) {
        *self.inner.context.write().unwrap() = EvaluationContext::new();
    }

    /// Evaluate a flag against the currently held snapshot. Pure over the
    /// snapshot pointer; never blocks on network I/O. Always produces one
    /// telemetry event, including for `FLAG_NOT_FOUND`.
    pub fn evaluate_detail(
        &self,
        flag_key: &str,
        call_context: Option<&EvaluationContext>,
    ) -> EvaluationDetail {
        let started = Instant::now();
        let snapshot = self.inner.snapshot.read().unwrap().clone();
        let base = self.inner.context.read().unwrap().clone();
        let context = match call_context {
            Some(overlay) => base.merge(overlay),
            None => base,
        };

        let (detail, version) = match &snapshot {
            Some(snapshot) => match snapshot.flags.get(flag_key) {
                Some(flag) => (
                    evaluate(flag, &context, &snapshot.segments),
                    Some(snapshot.version),
                ),
                None => (
                    EvaluationDetail {
                        value: Value::Null,
                        variation_key: None,
                        reason: Reason::FlagNotFound,
                        matched_target_name: None,
                        error_detail: Some(format!("flag '{}' is not in the snapshot", flag_key)),
                    },
                    Some(snapshot.version),
                ),
            },
            None => (
                EvaluationDetail {
                    value: Value::Null,
                    variation_key: None,
                    reason: Reason::Error,
                    matched_target_name: None,
                    error_detail: Some("no snapshot held".to_string()),
                },
                None,
            ),
        };

        let duration_us = started.elapsed().as_micros().min(u128::from(u64::MAX)) as u64;
        self.record(flag_key, &detail, &context, version, duration_us);
        detail
    }

    fn record(
        &self,
        flag_key: &str,
        detail: &EvaluationDetail,
        context: &EvaluationContext,
        version: Option<u64>,
        duration_us: u64,
    ) {
        if let Some(buffer) = self.inner.events.lock().unwrap().as_ref() {
            buffer.push(EvaluationEvent::from_detail(
                flag_key,
                detail,
                context,
                version,
                Some(duration_us),
            ));
        }
    }

    pub async fn is_enabled(
        &self,
        flag_key: &str,
        context: Option<&EvaluationContext>,
    ) -> Result<bool, ClientError> {
        self.ready().await?;
        Ok(self
            .evaluate_detail(flag_key, context)
            .value
            .as_bool()
            .unwrap_or(false))
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        flag_key: &str,
        fallback: T,
        context: Option<&EvaluationContext>,
    ) -> Result<T, ClientError> {
        self.ready().await?;
        Ok(self.get_sync(flag_key, fallback, context))
    }

    /// Synchronous accessor; panics when called before the client is ready.
    pub fn is_enabled_sync(&self, flag_key: &str, context: Option<&EvaluationContext>) -> bool {
        self.assert_ready();
        self.evaluate_detail(flag_key, context)
            .value
            .as_bool()
            .unwrap_or(false)
    }

    /// Synchronous accessor; panics when called before the client is ready.
    pub fn get_sync<T: DeserializeOwned>(
        &self,
        flag_key: &str,
        fallback: T,
        context: Option<&EvaluationContext>,
    ) -> T {
        self.assert_ready();
        let detail = self.evaluate_detail(flag_key, context);
        if detail.value.is_null() {
            return fallback;
        }
        serde_json::from_value(detail.value).unwrap_or(fallback)
    }

    fn assert_ready(&self) {
        if !self.is_ready() {
            panic!("FlagClient used before ready(); await ready() or use the async accessors");
        }
    }

    /// Stop background timers and flush pending telemetry. In-flight
    /// fetches are not aborted.
    pub async fn close(&self) {
        if let Some(handle) = self.inner.poll_task.lock().unwrap().take() {
            handle.abort();
        }
        let buffer = self.inner.events.lock().unwrap().clone();
        if let Some(buffer) = buffer {
            buffer.close().await;
        }
    }

    #[cfg(test)]
    pub(crate) fn seed_ready(&self, snapshot: Snapshot) {
        *self.inner.snapshot.write().unwrap() = Some(Arc::new(snapshot));
        *self.inner.state.write().unwrap() = ClientState::Ready;
    }
}
