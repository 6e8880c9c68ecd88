//! Record ingestion and listing endpoints.

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Error;
use crate::server::AppState;
use crate::storage::{BibRecordRow, BibStream, IngestEnvelope};

/// `PUT /shared-index/records`. One envelope per request; the client holds
/// back the next chunk until this one is answered.
pub async fn put_records(
    State(state): State<AppState>,
    Json(envelope): Json<IngestEnvelope>,
) -> Response {
    match state.storage.upsert_ingest_records(&envelope).await {
        Ok(()) => {
            tracing::debug!(
                source = %envelope.source_id,
                records = envelope.records.len(),
                "ingested chunk"
            );
            Json(Value::Array(Vec::new())).into_response()
        }
        Err(e) => fail(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordsQuery {
    #[serde(default)]
    pub source_id: Option<Uuid>,
    #[serde(default)]
    pub local_id: Option<String>,
}

/// `GET /shared-index/records`. Streams stored rows as `{"items": [...]}`,
/// optionally filtered by `sourceId` and `localId`, without buffering the
/// result set.
pub async fn get_records(
    State(state): State<AppState>,
    Query(query): Query<RecordsQuery>,
) -> Response {
    let stream = match state
        .storage
        .bib_record_stream(query.source_id, query.local_id)
        .await
    {
        Ok(stream) => stream,
        Err(e) => return fail(e),
    };
    let (tx, rx) = mpsc::channel::<String>(1);
    tokio::spawn(produce_records(stream, tx));
    let body = Body::from_stream(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok::<_, Infallible>(chunk), rx))
    }));
    let mut response = Response::new(body);
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

async fn produce_records(mut stream: BibStream, tx: mpsc::Sender<String>) {
    if tx.send("{\"items\":[".to_string()).await.is_ok() {
        let mut first = true;
        loop {
            match stream.next_row().await {
                Ok(Some(row)) => {
                    let mut chunk = if first { String::new() } else { ",".to_string() };
                    first = false;
                    chunk.push_str(&record_item(&row).to_string());
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    let _ = tx.send("]}".to_string()).await;
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "record page fetch failed");
                    let _ = tx.send("]}".to_string()).await;
                    break;
                }
            }
        }
    }
    if let Err(e) = stream.finish().await {
        tracing::error!(error = %e, "record cursor release failed");
    }
}

/// Null payloads are omitted rather than serialized.
fn record_item(row: &BibRecordRow) -> Value {
    let mut item = Map::new();
    item.insert("globalId".to_string(), Value::String(row.id.to_string()));
    item.insert(
        "localId".to_string(),
        Value::String(row.local_identifier.clone()),
    );
    item.insert(
        "sourceId".to_string(),
        Value::String(row.source_id.to_string()),
    );
    if let Some(marc) = &row.marc_payload {
        item.insert("marcPayload".to_string(), marc.clone());
    }
    if let Some(inventory) = &row.inventory_payload {
        item.insert("inventoryPayload".to_string(), inventory.clone());
    }
    Value::Object(item)
}

/// Map a failure to a plain-text response: caller mistakes are 400,
/// everything infrastructural is 500.
pub fn fail(error: Error) -> Response {
    let status = match error {
        Error::Storage(_) | Error::Io(_) | Error::Http(_) => {
            tracing::error!(error = %error, "request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
        _ => StatusCode::BAD_REQUEST,
    };
    (status, error.to_string()).into_response()
}
