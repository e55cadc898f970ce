use axum::{
    extract::{FromRequestParts, Query, State},
    http::request::Parts,
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;

use crate::error::ApiError;
use crate::queue::{SnapshotJob, SNAPSHOT_QUEUE};
use crate::routes::sdk_auth::ApiKeyMetadata;
use crate::snapshot::{api_key_key, snapshot_key, validate_snapshot, Snapshot};
use crate::state::AppState;

/// Extractor gating every admin handler behind the shared admin secret.
/// All failures are a uniform 401; missing and wrong credentials are not
/// distinguished.
pub struct Admin;

impl FromRequestParts<AppState> for Admin {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or("");
        let expected = state.admin_secret.as_bytes();
        if !state.admin_secret.is_empty()
            && bool::from(token.as_bytes().ct_eq(expected))
        {
            Ok(Admin)
        } else {
            Err(ApiError::unauthorized("unauthorized"))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RawSnapshotQuery {
    pub key: String,
}

/// Read a raw snapshot document straight from the KV store.
pub async fn get_snapshot(
    _admin: Admin,
    State(state): State<AppState>,
    Query(query): Query<RawSnapshotQuery>,
) -> Result<impl IntoResponse, ApiError> {
    match state.kv.get(&query.key).await? {
        Some(document) => Ok(Json(document)),
        None => Err(ApiError::not_found(format!(
            "no snapshot stored under '{}'",
            query.key
        ))),
    }
}

/// Enqueue an asynchronous snapshot rebuild.
pub async fn queue_snapshot(
    _admin: Admin,
    State(state): State<AppState>,
    Json(job): Json<SnapshotJob>,
) -> Result<impl IntoResponse, ApiError> {
    let payload = serde_json::to_value(&job)
        .map_err(|e| ApiError::internal(format!("failed to encode job: {}", e)))?;
    state.queue.enqueue(SNAPSHOT_QUEUE, payload).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "queued": true }))))
}

#[derive(Debug, Deserialize)]
pub struct PublishSnapshotRequest {
    pub key: String,
    pub snapshot: Snapshot,
}

/// Publish a snapshot document directly under the given KV key.
pub async fn publish_snapshot(
    _admin: Admin,
    State(state): State<AppState>,
    Json(request): Json<PublishSnapshotRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_snapshot(&request.snapshot).map_err(ApiError::bad_request)?;
    let document = serde_json::to_value(&request.snapshot)
        .map_err(|e| ApiError::internal(format!("failed to encode snapshot: {}", e)))?;
    state.kv.put(&request.key, document).await?;
    Ok(Json(json!({ "published": true, "version": request.snapshot.version })))
}

/// Build a snapshot synchronously via the control plane's internal RPC and
/// publish it under its canonical key.
pub async fn build_snapshot_sync(
    _admin: Admin,
    State(state): State<AppState>,
    Json(job): Json<SnapshotJob>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state
        .snapshot_source
        .build(&job)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    validate_snapshot(&snapshot).map_err(ApiError::bad_request)?;
    let key = snapshot_key(&job.org_id, &job.project_id, &job.environment_slug);
    let document = serde_json::to_value(&snapshot)
        .map_err(|e| ApiError::internal(format!("failed to encode snapshot: {}", e)))?;
    state.kv.put(&key, document.clone()).await?;
    Ok(Json(document))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitApiKeyRequest {
    pub api_key: String,
    pub project_id: String,
    pub org_id: String,
}

/// Register an API key with its project metadata.
pub async fn submit_api_key(
    _admin: Admin,
    State(state): State<AppState>,
    Json(request): Json<SubmitApiKeyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let metadata = ApiKeyMetadata {
        org_id: request.org_id,
        project_id: request.project_id,
    };
    let value = serde_json::to_value(&metadata)
        .map_err(|e| ApiError::internal(format!("failed to encode metadata: {}", e)))?;
    state.kv.put(&api_key_key(&request.api_key), value).await?;
    Ok(Json(json!({ "submitted": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRequest {
    pub api_key: String,
}

/// Look up whether an API key is currently registered.
pub async fn verify_api_key(
    _admin: Admin,
    State(state): State<AppState>,
    Json(request): Json<ApiKeyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let body = match state.kv.get(&api_key_key(&request.api_key)).await? {
        Some(value) => json!({
            "valid": true,
            "orgId": value["orgId"],
            "projectId": value["projectId"],
        }),
        None => json!({ "valid": false }),
    };
    Ok(Json(body))
}

/// Delete an API key; subsequent SDK requests with it are rejected.
pub async fn revoke_api_key(
    _admin: Admin,
    State(state): State<AppState>,
    Json(request): Json<ApiKeyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.kv.delete(&api_key_key(&request.api_key)).await?;
    Ok(Json(json!({ "revoked": true })))
}
