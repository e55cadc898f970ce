use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiError;
use crate::events::{BatchMeta, EvaluationEvent};
use crate::queue::{EvaluationBatch, EVALUATION_QUEUE};
use crate::routes::sdk_auth::SdkKey;
use crate::snapshot::{api_key_key, snapshot_key};
use crate::state::AppState;

/// Hard cap on events accepted per ingest request.
pub const MAX_INGEST_EVENTS: usize = 500;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    pub api_key: String,
}

/// Validate an API key at SDK startup.
pub async fn init(
    State(state): State<AppState>,
    Json(request): Json<InitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let metadata = state.kv.get(&api_key_key(&request.api_key)).await?;
    let body = match metadata {
        Some(value) => json!({
            "valid": true,
            "orgId": value["orgId"],
            "projectId": value["projectId"],
        }),
        None => json!({
            "valid": false,
            "error": "invalid API key",
        }),
    };
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
pub struct SnapshotQuery {
    pub environment: String,
}

/// Serve the published snapshot for the caller's project + environment.
pub async fn snapshot(
    State(state): State<AppState>,
    SdkKey(metadata): SdkKey,
    Query(query): Query<SnapshotQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let key = snapshot_key(&metadata.org_id, &metadata.project_id, &query.environment);
    match state.kv.get(&key).await? {
        Some(document) => Ok(Json(document)),
        None => Err(ApiError::not_found(format!(
            "no snapshot published for environment '{}'",
            query.environment
        ))),
    }
}

#[derive(Debug, Deserialize)]
pub struct EvaluationsRequest {
    pub meta: Option<BatchMeta>,
    pub events: Vec<EvaluationEvent>,
}

/// Accept a batch of evaluation events and enqueue it for the ingestion
/// consumer. Responds 202 without waiting for downstream processing.
pub async fn evaluations(
    State(state): State<AppState>,
    SdkKey(metadata): SdkKey,
    Json(request): Json<EvaluationsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.events.is_empty() {
        return Err(ApiError::bad_request("events must not be empty"));
    }
    if request.events.len() > MAX_INGEST_EVENTS {
        return Err(ApiError::bad_request(format!(
            "too many events (max {})",
            MAX_INGEST_EVENTS
        )));
    }

    let mut meta = request.meta.unwrap_or(BatchMeta {
        project_id: None,
        organization_id: None,
        environment_id: None,
        sdk_version: "unknown".to_string(),
        sdk_key: String::new(),
        user_agent: "unknown".to_string(),
        sdk_platform: None,
    });
    // The authenticated key decides project/org, whatever the client sent.
    meta.project_id = Some(metadata.project_id.clone());
    meta.organization_id = Some(metadata.org_id.clone());

    let batch = EvaluationBatch {
        meta,
        events: request.events,
    };
    let payload = serde_json::to_value(&batch)
        .map_err(|e| ApiError::internal(format!("failed to encode batch: {}", e)))?;
    state.queue.enqueue(EVALUATION_QUEUE, payload).await?;

    Ok(StatusCode::ACCEPTED)
}
