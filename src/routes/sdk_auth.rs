use axum::{
    extract::{FromRequestParts, Query},
    http::request::Parts,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::ApiError;
use crate::snapshot::api_key_key;
use crate::state::AppState;

/// Project metadata stored against a raw API key. Created by the admin
/// submit call, read on every SDK request, deleted on revoke.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyMetadata {
    pub org_id: String,
    pub project_id: String,
}

/// Extractor for SDK authentication: resolves the caller's API key to its
/// project metadata. Accepts `Authorization: Bearer <key>` with a `?key=`
/// query fallback for callers that cannot set headers.
pub struct SdkKey(pub ApiKeyMetadata);

impl FromRequestParts<AppState> for SdkKey {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let bearer = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string);

        let api_key = match bearer {
            Some(key) => key,
            None => Query::<HashMap<String, String>>::from_request_parts(parts, state)
                .await
                .ok()
                .and_then(|Query(params)| params.get("key").cloned())
                .ok_or_else(|| ApiError::unauthorized("missing API key"))?,
        };

        let metadata = state.kv.get(&api_key_key(&api_key)).await?;
        match metadata {
            Some(value) => {
                let parsed: ApiKeyMetadata = serde_json::from_value(value)
                    .map_err(|_| ApiError::internal("corrupt API key record"))?;
                Ok(SdkKey(parsed))
            }
            None => Err(ApiError::unauthorized("invalid API key")),
        }
    }
}
