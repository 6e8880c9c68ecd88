//! OAI-PMH style harvest endpoint.
//!
//! Serves `ListRecords`, `ListIdentifiers` and `GetRecord` over record
//! clusters. List responses stream: a producer task walks a paged cursor on
//! one database transaction and hands chunks to the response body through a
//! bounded channel, so an idle consumer pauses the database read.

use std::collections::HashMap;
use std::convert::Infallible;

use axum::body::Body;
use axum::http::{header, HeaderValue, Response, StatusCode};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::marc::xml::{encode_xml_text, record_to_marcxml};
use crate::marc::{assembler, CanonicalRecord};
use crate::server::AppState;
use crate::storage::{ClusterMember, ClusterRow, ClusterStream};

const OAI_HEADER: &str = concat!(
    "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n",
    "<OAI-PMH xmlns=\"http://www.openarchives.org/OAI/2.0/\"\n",
    "         xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\"\n",
    "         xsi:schemaLocation=\"http://www.openarchives.org/OAI/2.0/\n",
    "         http://www.openarchives.org/OAI/2.0/OAI-PMH.xsd\">\n"
);
const OAI_FOOTER: &str = "</OAI-PMH>\n";
const METADATA_PREFIX: &str = "marcxml";

/// Protocol-level failures, mapped to OAI error codes. Everything else is
/// `internal` and the only case reported as a server error.
#[derive(Debug)]
pub enum OaiError {
    BadVerb(String),
    BadArgument(String),
    CannotDisseminateFormat(String),
    IdDoesNotExist(String),
    Internal(Error),
}

impl From<Error> for OaiError {
    fn from(e: Error) -> Self {
        OaiError::Internal(e)
    }
}

impl OaiError {
    fn code(&self) -> &'static str {
        match self {
            OaiError::BadVerb(_) => "badVerb",
            OaiError::BadArgument(_) => "badArgument",
            OaiError::CannotDisseminateFormat(_) => "cannotDisseminateFormat",
            OaiError::IdDoesNotExist(_) => "idDoesNotExist",
            OaiError::Internal(_) => "internal",
        }
    }

    fn message(&self) -> String {
        match self {
            OaiError::BadVerb(verb) => format!("bad verb \"{}\"", verb),
            OaiError::BadArgument(msg) => msg.clone(),
            OaiError::CannotDisseminateFormat(prefix) => {
                format!("can not disseminate format \"{}\"", prefix)
            }
            OaiError::IdDoesNotExist(id) => format!("id \"{}\" does not exist", id),
            OaiError::Internal(e) => e.to_string(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            OaiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

pub fn encode_oai_identifier(cluster_id: Uuid) -> String {
    format!("oai:{}", cluster_id)
}

/// Inverse of [`encode_oai_identifier`]: everything up to the first colon is
/// the prefix, the remainder must be the cluster UUID. Anything else is a bad
/// argument, not a missing id.
pub fn decode_oai_identifier(identifier: &str) -> std::result::Result<Uuid, OaiError> {
    identifier
        .split_once(':')
        .and_then(|(_, rest)| Uuid::parse_str(rest).ok())
        .ok_or_else(|| OaiError::BadArgument(format!("malformed identifier \"{}\"", identifier)))
}

fn timestamp(dt: NaiveDateTime) -> String {
    dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn parse_datestamp(value: &str) -> std::result::Result<NaiveDateTime, OaiError> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%SZ")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S"))
        .or_else(|_| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .map(|d| d.and_hms_opt(0, 0, 0).unwrap_or_default())
        })
        .map_err(|_| OaiError::BadArgument(format!("bad datestamp \"{}\"", value)))
}

fn envelope_open(base_url: &str, verb: Option<&str>) -> String {
    let verb_attr = verb
        .map(|v| format!(" verb=\"{}\"", v))
        .unwrap_or_default();
    format!(
        "{}  <responseDate>{}</responseDate>\n  <request{}>{}/shared-index/oai</request>\n",
        OAI_HEADER,
        timestamp(Utc::now().naive_utc()),
        verb_attr,
        encode_xml_text(base_url)
    )
}

fn xml_response(status: StatusCode, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/xml"));
    response
}

fn error_response(base_url: &str, verb: Option<&str>, error: OaiError) -> Response<Body> {
    let body = format!(
        "{}  <error code=\"{}\">{}</error>\n{}",
        envelope_open(base_url, verb),
        error.code(),
        encode_xml_text(&error.message()),
        OAI_FOOTER
    );
    xml_response(error.status(), Body::from(body))
}

/// Dispatch one OAI request. Validation failures surface here as error
/// envelopes with their proper status; once a list response body has begun
/// streaming the status can no longer change.
pub async fn handle(state: AppState, params: HashMap<String, String>) -> Response<Body> {
    let verb = params.get("verb").cloned().unwrap_or_default();
    let known = matches!(
        verb.as_str(),
        "ListRecords" | "ListIdentifiers" | "GetRecord"
    );
    let result = match verb.as_str() {
        "ListRecords" => list(&state, &params, true).await,
        "ListIdentifiers" => list(&state, &params, false).await,
        "GetRecord" => get_record(&state, &params).await,
        _ => Err(OaiError::BadVerb(verb.clone())),
    };
    result.unwrap_or_else(|error| {
        if matches!(error, OaiError::Internal(_)) {
            tracing::error!(verb = %verb, error = %error.message(), "oai request failed");
        }
        error_response(&state.config.base_url, known.then_some(verb.as_str()), error)
    })
}

fn check_metadata_prefix(params: &HashMap<String, String>) -> std::result::Result<(), OaiError> {
    match params.get("metadataPrefix") {
        Some(prefix) if prefix != METADATA_PREFIX => {
            Err(OaiError::CannotDisseminateFormat(prefix.clone()))
        }
        _ => Ok(()),
    }
}

async fn list(
    state: &AppState,
    params: &HashMap<String, String>,
    with_metadata: bool,
) -> std::result::Result<Response<Body>, OaiError> {
    let set = params
        .get("set")
        .ok_or_else(|| OaiError::BadArgument("set is a required argument".into()))?
        .clone();
    check_metadata_prefix(params)?;
    let from = params
        .get("from")
        .map(|v| parse_datestamp(v))
        .transpose()?;
    let until = params
        .get("until")
        .map(|v| parse_datestamp(v))
        .transpose()?;
    if state.storage.select_match_key_config(&set).await?.is_none() {
        return Err(OaiError::BadArgument(format!("set \"{}\" not found", set)));
    }
    let stream = state.storage.cluster_stream(&set, from, until).await?;

    let verb = if with_metadata {
        "ListRecords"
    } else {
        "ListIdentifiers"
    };
    let open = format!(
        "{}  <{}>\n",
        envelope_open(&state.config.base_url, Some(verb)),
        verb
    );
    // Capacity one: the producer blocks on send until the consumer has taken
    // the previous chunk, which is what pauses the database read.
    let (tx, rx) = mpsc::channel::<String>(1);
    tokio::spawn(produce(stream, tx, open, verb, set, with_metadata));
    let body = Body::from_stream(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok::<_, Infallible>(chunk), rx))
    }));
    Ok(xml_response(StatusCode::OK, body))
}

async fn produce(
    mut stream: ClusterStream,
    tx: mpsc::Sender<String>,
    open: String,
    verb: &'static str,
    set: String,
    with_metadata: bool,
) {
    let close = format!("  </{}>\n{}", verb, OAI_FOOTER);
    // A failed send means the consumer went away; stop producing but still
    // run the cursor cleanup below. After a mid-stream failure the status is
    // already sent, so the envelope is closed best-effort instead.
    if tx.send(open).await.is_ok() {
        loop {
            match stream.next_row().await {
                Ok(Some(row)) => {
                    let entry = match list_entry(&mut stream, &row, with_metadata).await {
                        Ok(entry) => entry,
                        Err(e) => {
                            tracing::error!(cluster = %row.cluster_id, error = %e, "list entry failed");
                            let _ = tx.send(close).await;
                            break;
                        }
                    };
                    if tx.send(entry).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    let _ = tx.send(close).await;
                    break;
                }
                Err(e) => {
                    tracing::error!(set = %set, error = %e, "cluster page fetch failed");
                    let _ = tx.send(close).await;
                    break;
                }
            }
        }
    }
    if let Err(e) = stream.finish().await {
        tracing::error!(set = %set, error = %e, "cursor release failed");
    }
}

async fn list_entry(
    stream: &mut ClusterStream,
    row: &ClusterRow,
    with_metadata: bool,
) -> Result<String> {
    let members = stream.cluster_members(row.cluster_id).await?;
    let values = if with_metadata {
        stream.cluster_values(row.cluster_id).await?
    } else {
        Vec::new()
    };
    render_entry(row, &members, &values, with_metadata)
}

/// Render one cluster as a list or GetRecord entry. A cluster whose members
/// all lack a MARC payload is a tombstone: its header carries
/// `status="deleted"` and no metadata follows.
fn render_entry(
    row: &ClusterRow,
    members: &[ClusterMember],
    values: &[String],
    with_metadata: bool,
) -> Result<String> {
    let identifier = encode_oai_identifier(row.cluster_id);
    let representative = members.iter().find_map(|m| m.marc_payload.as_ref());
    let deleted = representative.is_none();

    let mut out = String::new();
    let indent = if with_metadata {
        out.push_str("    <record>\n");
        "  "
    } else {
        ""
    };
    if deleted {
        out.push_str(&format!("{}    <header status=\"deleted\">\n", indent));
    } else {
        out.push_str(&format!("{}    <header>\n", indent));
    }
    out.push_str(&format!(
        "{}      <identifier>{}</identifier>\n",
        indent, identifier
    ));
    out.push_str(&format!(
        "{}      <datestamp>{}</datestamp>\n",
        indent,
        timestamp(row.datestamp)
    ));
    out.push_str(&format!(
        "{}      <setSpec>{}</setSpec>\n",
        indent,
        encode_xml_text(&row.match_key_config_id)
    ));
    out.push_str(&format!("{}    </header>\n", indent));

    if with_metadata {
        if let Some(payload) = representative {
            let mut record = CanonicalRecord::from_json(payload)?;
            assembler::add_identifier(&mut record, &identifier);
            assembler::add_match_values(&mut record, values);
            let inventories: Vec<&Value> = members
                .iter()
                .filter_map(|m| m.inventory_payload.as_ref())
                .collect();
            if !inventories.is_empty() {
                assembler::set_holdings(&mut record, &inventories);
            }
            out.push_str("      <metadata>\n");
            out.push_str(&record_to_marcxml(&record));
            out.push_str("      </metadata>\n");
        }
        out.push_str("    </record>\n");
    }
    Ok(out)
}

async fn get_record(
    state: &AppState,
    params: &HashMap<String, String>,
) -> std::result::Result<Response<Body>, OaiError> {
    let identifier = params
        .get("identifier")
        .ok_or_else(|| OaiError::BadArgument("identifier is a required argument".into()))?;
    check_metadata_prefix(params)?;
    let cluster_id = decode_oai_identifier(identifier)?;
    let row = state
        .storage
        .cluster_meta(cluster_id)
        .await?
        .ok_or_else(|| OaiError::IdDoesNotExist(identifier.clone()))?;
    let members = state.storage.cluster_members(cluster_id).await?;
    let values = state.storage.cluster_values(cluster_id).await?;
    let entry = render_entry(&row, &members, &values, true)?;
    let body = format!(
        "{}  <GetRecord>\n{}  </GetRecord>\n{}",
        envelope_open(&state.config.base_url, Some("GetRecord")),
        entry,
        OAI_FOOTER
    );
    Ok(xml_response(StatusCode::OK, Body::from(body)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row() -> ClusterRow {
        ClusterRow {
            cluster_id: Uuid::parse_str("3ff5a002-7a31-4045-9c92-fbbb2aff2d5f").unwrap(),
            datestamp: NaiveDate::from_ymd_opt(2023, 4, 1)
                .unwrap()
                .and_hms_opt(10, 30, 0)
                .unwrap(),
            match_key_config_id: "isbn".into(),
        }
    }

    #[test]
    fn identifier_round_trip_and_rejection() {
        let id = Uuid::new_v4();
        let encoded = encode_oai_identifier(id);
        assert!(encoded.starts_with("oai:"));
        assert_eq!(decode_oai_identifier(&encoded).unwrap(), id);
        assert!(matches!(
            decode_oai_identifier("oai:not-a-uuid"),
            Err(OaiError::BadArgument(_))
        ));
        assert!(matches!(
            decode_oai_identifier("3ff5a002-7a31-4045-9c92-fbbb2aff2d5f"),
            Err(OaiError::BadArgument(_))
        ));
    }

    #[test]
    fn datestamp_forms() {
        assert!(parse_datestamp("2023-04-01T10:30:00Z").is_ok());
        assert!(parse_datestamp("2023-04-01T10:30:00").is_ok());
        assert_eq!(
            timestamp(parse_datestamp("2023-04-01").unwrap()),
            "2023-04-01T00:00:00Z"
        );
        assert!(parse_datestamp("April first").is_err());
    }

    #[test]
    fn internal_errors_alone_are_server_errors() {
        assert_eq!(OaiError::BadVerb("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            OaiError::IdDoesNotExist("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            OaiError::Internal(Error::Xml("boom".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn tombstone_cluster_renders_deleted_header_without_metadata() {
        let members = vec![ClusterMember {
            marc_payload: None,
            inventory_payload: Some(json!({})),
        }];
        let entry = render_entry(&row(), &members, &[], true).unwrap();
        assert!(entry.contains("<header status=\"deleted\">"));
        assert!(!entry.contains("<metadata>"));
        assert!(entry.contains("<datestamp>2023-04-01T10:30:00Z</datestamp>"));
        assert!(entry.contains("<setSpec>isbn</setSpec>"));
    }

    #[test]
    fn live_cluster_metadata_carries_annotations() {
        let members = vec![
            ClusterMember {
                marc_payload: None,
                inventory_payload: None,
            },
            ClusterMember {
                marc_payload: Some(json!({
                    "leader": "01234nam a2200000 a 4500",
                    "fields": [{"001": "r1"}]
                })),
                inventory_payload: Some(json!({"holdingsRecords": [
                    {"permanentLocationDeref": "MAIN"}
                ]})),
            },
        ];
        let entry = render_entry(&row(), &members, &["k1".into()], true).unwrap();
        assert!(entry.contains("<header>"));
        assert!(entry.contains("<metadata>"));
        assert!(entry.contains("oai:3ff5a002-7a31-4045-9c92-fbbb2aff2d5f"));
        // 999$i identifier, 99X$a match value, 852$b location
        assert!(entry.contains("tag=\"999\""));
        assert!(entry.contains("tag=\"99X\""));
        assert!(entry.contains(">k1</subfield>"));
        assert!(entry.contains(">MAIN</subfield>"));
    }

    #[test]
    fn identifiers_entry_has_no_record_wrapper() {
        let members = vec![ClusterMember {
            marc_payload: Some(json!({"leader": "l"})),
            inventory_payload: None,
        }];
        let entry = render_entry(&row(), &members, &[], false).unwrap();
        assert!(!entry.contains("<record>"));
        assert!(entry.trim_start().starts_with("<header>"));
    }
}
