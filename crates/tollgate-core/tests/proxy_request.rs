use std::io::Write;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::post;
use axum::Router;
use tollgate_common::AppConfig;
use tollgate_core::AppState;
use tower::ServiceExt;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn write_config(body: String) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(body.as_bytes()).unwrap();
    file
}

fn write_keys() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"[{{"key":"user-key-1","name":"Ada","email":"ada@example.test"}}]"#
    )
    .unwrap();
    file
}

async fn build_state(upstream_base: &str, key_file: &tempfile::NamedTempFile) -> Arc<AppState> {
    let staging_dir = tempfile::tempdir().unwrap();
    let usage_db = tempfile::NamedTempFile::new().unwrap();
    let config_file = write_config(format!(
        r#"{{
            "OPENAI_API_KEY": "sk-upstream-secret",
            "ALLOWLIST": {{
                "enabled": true,
                "endpoints": ["/v1/chat/completions"],
                "models": ["gpt-4o-mini"],
                "default_model": "gpt-4o-mini"
            }},
            "HTTP_CLIENT": {{
                "base_url": "{upstream_base}",
                "max_retries": 1
            }},
            "key_file": "{key_path}",
            "staging_dir": "{staging_path}",
            "usage_db_path": "{usage_path}"
        }}"#,
        upstream_base = upstream_base,
        key_path = key_file.path().display(),
        staging_path = staging_dir.path().display(),
        usage_path = usage_db.path().display(),
    ));
    let config = AppConfig::load(config_file.path()).unwrap();
    AppState::bootstrap(config).await.unwrap()
}

#[tokio::test]
async fn authenticated_chat_completion_is_proxied() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-upstream-secret"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "gpt-4o-mini",
                "choices": [],
                "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
            })),
        )
        .mount(&upstream)
        .await;

    let keys = write_keys();
    let state = build_state(&upstream.uri(), &keys).await;
    let app = Router::new()
        .route("/{*path}", post(tollgate_core::proxy_handler))
        .with_state(state);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("api-key", "user-key-1")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({"model": "gpt-4o-mini", "messages": []}).to_string(),
        ))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn missing_api_key_is_rejected() {
    let upstream = MockServer::start().await;
    let keys = write_keys();
    let state = build_state(&upstream.uri(), &keys).await;
    let app = Router::new()
        .route("/{*path}", post(tollgate_core::proxy_handler))
        .with_state(state);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::json!({"messages": []}).to_string()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn disallowed_endpoint_is_rejected() {
    let upstream = MockServer::start().await;
    let keys = write_keys();
    let state = build_state(&upstream.uri(), &keys).await;
    let app = Router::new()
        .route("/{*path}", post(tollgate_core::proxy_handler))
        .with_state(state);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/embeddings")
        .header("api-key", "user-key-1")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::json!({}).to_string()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn disallowed_model_is_rejected() {
    let upstream = MockServer::start().await;
    let keys = write_keys();
    let state = build_state(&upstream.uri(), &keys).await;
    let app = Router::new()
        .route("/{*path}", post(tollgate_core::proxy_handler))
        .with_state(state);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("api-key", "user-key-1")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({"model": "gpt-4-not-allowed", "messages": []}).to_string(),
        ))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
