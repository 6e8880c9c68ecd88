pub mod ingest;

use std::collections::HashMap;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;

use crate::oai;
use crate::server::AppState;
use crate::storage::MatchKeyConfig;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/shared-index/oai", get(oai_request))
        .route(
            "/shared-index/records",
            put(ingest::put_records).get(ingest::get_records),
        )
        .route(
            "/shared-index/config/matchkeys",
            post(post_match_key).get(get_match_keys),
        )
        .route(
            "/shared-index/config/matchkeys/:id",
            get(get_match_key).delete(delete_match_key),
        )
        .route("/_/tenant", post(post_tenant))
}

async fn oai_request(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response<Body> {
    oai::handle(state, params).await
}

async fn post_match_key(
    State(state): State<AppState>,
    Json(config): Json<MatchKeyConfig>,
) -> impl IntoResponse {
    match state.storage.insert_match_key_config(&config).await {
        Ok(()) => (StatusCode::CREATED, Json(config)).into_response(),
        Err(e) => ingest::fail(e),
    }
}

async fn get_match_keys(State(state): State<AppState>) -> impl IntoResponse {
    match state.storage.match_key_configs().await {
        Ok(configs) => Json(serde_json::json!({ "matchKeys": configs })).into_response(),
        Err(e) => ingest::fail(e),
    }
}

async fn get_match_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.storage.select_match_key_config(&id).await {
        Ok(Some(config)) => Json(config).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => ingest::fail(e),
    }
}

async fn delete_match_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.storage.delete_match_key_config(&id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => ingest::fail(e),
    }
}

#[derive(Deserialize)]
struct TenantAttributes {
    #[serde(default)]
    module_to: Option<String>,
    #[serde(default)]
    purge: bool,
}

/// Tenant provisioning in the module-management style the ingest client
/// speaks: plain init creates the schema, purge drops it. Both complete
/// synchronously, so the response is 204 and no job polling is needed.
async fn post_tenant(
    State(state): State<AppState>,
    Json(attributes): Json<TenantAttributes>,
) -> impl IntoResponse {
    let result = if attributes.purge {
        state.storage.purge().await
    } else {
        state.storage.init().await
    };
    match result {
        Ok(()) => {
            tracing::info!(
                module = attributes.module_to.as_deref().unwrap_or(""),
                purge = attributes.purge,
                "tenant operation complete"
            );
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => ingest::fail(e),
    }
}
