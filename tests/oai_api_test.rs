use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use tower::util::ServiceExt; // for `oneshot`

use sharedindex::config::Config;
use sharedindex::server::{build_router, AppState};
use sharedindex::storage::Storage;

// Protocol-level validation happens before any query is issued, so a lazy
// pool that never connects is enough for these tests.
fn test_app() -> Router {
    let pool = PgPoolOptions::new()
        .connect_lazy("postgres://localhost/sharedindex_test")
        .expect("lazy pool");
    build_router(AppState {
        storage: Storage::new(pool),
        config: Config {
            database_url: "postgres://localhost/sharedindex_test".to_string(),
            port: 0,
            base_url: "http://test.example.com".to_string(),
        },
    })
}

async fn oai(query: &str) -> (StatusCode, String, String) {
    let app = test_app();
    let req = Request::builder()
        .uri(format!("/shared-index/oai?{}", query))
        .method("GET")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(req).await.expect("response");
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    (status, content_type, String::from_utf8_lossy(&body).into_owned())
}

#[tokio::test]
async fn missing_verb_is_bad_verb() {
    let (status, content_type, body) = oai("x=y").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(content_type, "text/xml");
    assert!(body.contains("<OAI-PMH"));
    assert!(body.contains("<error code=\"badVerb\">"));
    // Unknown verb is not echoed in the request element
    assert!(!body.contains("verb="));
}

#[tokio::test]
async fn unknown_verb_is_bad_verb() {
    let (status, _, body) = oai("verb=ListSets").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("<error code=\"badVerb\">"));
}

#[tokio::test]
async fn list_records_requires_set() {
    let (status, _, body) = oai("verb=ListRecords").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("<error code=\"badArgument\">"));
    assert!(body.contains("<request verb=\"ListRecords\">"));
}

#[tokio::test]
async fn bad_datestamp_is_bad_argument() {
    let (status, _, body) = oai("verb=ListIdentifiers&set=isbn&from=yesterday").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("<error code=\"badArgument\">"));
}

#[tokio::test]
async fn only_marcxml_can_be_disseminated() {
    let query = "verb=GetRecord&identifier=oai:3ff5a002-7a31-4045-9c92-fbbb2aff2d5f\
                 &metadataPrefix=oai_dc";
    let (status, _, body) = oai(query).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("<error code=\"cannotDisseminateFormat\">"));
}

#[tokio::test]
async fn malformed_identifier_is_bad_argument_not_missing_id() {
    let (status, _, body) = oai("verb=GetRecord&identifier=oai:not-a-uuid").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("<error code=\"badArgument\">"));
    assert!(!body.contains("idDoesNotExist"));
}

#[tokio::test]
async fn get_record_requires_identifier() {
    let (status, _, body) = oai("verb=GetRecord").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("<error code=\"badArgument\">"));
}

#[tokio::test]
async fn base_url_is_echoed_in_request_element() {
    let (_, _, body) = oai("verb=ListRecords").await;
    assert!(body.contains("http://test.example.com/shared-index/oai</request>"));
}
