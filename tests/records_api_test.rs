use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use tower::util::ServiceExt; // for `oneshot`

use sharedindex::config::Config;
use sharedindex::server::{build_router, AppState};
use sharedindex::storage::Storage;

// Port 1 never answers, so every storage call fails deterministically. The
// routes must still be wired and map the failure to a status.
fn test_app() -> Router {
    let pool = PgPoolOptions::new()
        .connect_lazy("postgres://localhost:1/sharedindex_test")
        .expect("lazy pool");
    build_router(AppState {
        storage: Storage::new(pool),
        config: Config {
            database_url: "postgres://localhost:1/sharedindex_test".to_string(),
            port: 0,
            base_url: "http://test.example.com".to_string(),
        },
    })
}

async fn get(uri: &str) -> StatusCode {
    let app = test_app();
    let req = Request::builder()
        .uri(uri)
        .method("GET")
        .body(Body::empty())
        .expect("request");
    app.oneshot(req).await.expect("response").status()
}

#[tokio::test]
async fn bad_source_id_filter_is_rejected() {
    assert_eq!(
        get("/shared-index/records?sourceId=not-a-uuid").await,
        StatusCode::BAD_REQUEST
    );
}

#[tokio::test]
async fn records_listing_maps_storage_failure() {
    assert_eq!(
        get("/shared-index/records").await,
        StatusCode::INTERNAL_SERVER_ERROR
    );
}

#[tokio::test]
async fn match_key_collection_maps_storage_failure() {
    assert_eq!(
        get("/shared-index/config/matchkeys").await,
        StatusCode::INTERNAL_SERVER_ERROR
    );
}
