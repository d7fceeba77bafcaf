use axum::Router;
use byte_unit::Byte;
use chestd::api::{create_api_router, AppState};
use chestd::blob::{BlobStore, FsBlobStore};
use chestd::chest::ChestEngine;
use chestd::config::{AuthConfig, Config, ReaperConfig, ServerConfig, StorageConfig};
use chestd::db::MetadataStore;
use chestd::token::TokenService;
use std::sync::Arc;
use tempfile::TempDir;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub const TEST_JWT_SECRET: &str = "test-signing-secret-at-least-32-characters-long!!";

pub async fn setup_test_app() -> Router {
    setup_test_app_with_totp(false, "").await
}

pub async fn setup_test_app_with_totp(require_totp: bool, totp_secrets: &str) -> Router {
    let temp_dir = TempDir::new().unwrap();
    let data_path = temp_dir.path().to_path_buf();
    // leaked so the directory outlives the test
    std::mem::forget(temp_dir);

    let db = MetadataStore::connect_in_memory().await.unwrap();
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(&data_path));
    let tokens = TokenService::new(TEST_JWT_SECRET);
    let parsed_secrets = chestd::totp::parse_secrets(totp_secrets);
    let engine = ChestEngine::new(db, blobs, tokens, require_totp, parsed_secrets);

    let config = Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_payload_size: Byte::from_u64_with_unit(512, byte_unit::Unit::MiB).unwrap(),
        },
        storage: StorageConfig {
            data_path,
            database_url: "sqlite::memory:".to_string(),
        },
        auth: AuthConfig {
            jwt_secret: TEST_JWT_SECRET.to_string(),
            require_totp,
            totp_secrets: totp_secrets.to_string(),
        },
        reaper: ReaperConfig::default(),
    };

    let state = Arc::new(AppState { engine, config });
    let (api_router, _api_doc) = create_api_router(state.clone()).split_for_parts();

    Router::new()
        .nest("/api", api_router)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Builds a `multipart/form-data` body with one `files` part and, optionally,
/// one `textItems` JSON part — the shape `uploadFiles` expects.
pub fn build_upload_multipart_body(
    boundary: &str,
    file_name: &str,
    file_mime: &str,
    file_content: &[u8],
    text_item_json: Option<&str>,
) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"files\"; filename=\"{file_name}\"\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(format!("Content-Type: {file_mime}\r\n\r\n").as_bytes());
    body.extend_from_slice(file_content);
    body.extend_from_slice(b"\r\n");

    if let Some(text_item) = text_item_json {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"textItems\"\r\n\r\n",
        );
        body.extend_from_slice(text_item.as_bytes());
        body.extend_from_slice(b"\r\n");
    }

    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    body
}
