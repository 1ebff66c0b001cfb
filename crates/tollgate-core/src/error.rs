use axum::body::Body;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Every way the request pipeline can refuse or fail a request.
///
/// Each variant carries exactly what it needs to render a response; the
/// mapping to status code and body shape lives in `IntoResponse` below so
/// callers can propagate with `?` and let the handler turn it into HTTP.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid api key")]
    InvalidKey,
    #[error("endpoint not allowed: {0}")]
    EndpointNotAllowed(String),
    #[error("model not allowed: {0}")]
    ModelNotAllowed(String),
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("queue overflow")]
    QueueOverflow,
    #[error("upload quota exceeded")]
    UploadQuotaExceeded,
    #[error("upstream returned an error status")]
    UpstreamStatusError(Box<UpstreamStatus>),
    #[error("upstream transport error: {0}")]
    UpstreamTransportError(String),
    #[error("upstream request timed out")]
    UpstreamTimeout,
    #[error("shutdown in progress")]
    ShutdownInProgress,
}

#[derive(Debug)]
pub struct UpstreamStatus {
    pub status: StatusCode,
    pub headers: axum::http::HeaderMap,
    pub body: bytes::Bytes,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    message: String,
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'a str>,
}

fn json_error(status: StatusCode, message: String, kind: &str, code: Option<&str>) -> Response {
    let body = ErrorBody {
        error: ErrorDetail { message, kind, code },
    };
    let payload = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());
    let mut resp = Response::new(Body::from(payload));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    resp
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        match self {
            PipelineError::InvalidKey => json_error(
                StatusCode::FORBIDDEN,
                "invalid api key".to_string(),
                "invalid_key",
                None,
            ),
            PipelineError::EndpointNotAllowed(path) => json_error(
                StatusCode::FORBIDDEN,
                format!("endpoint not allowed: {path}"),
                "endpoint_not_allowed",
                None,
            ),
            PipelineError::ModelNotAllowed(model) => json_error(
                StatusCode::FORBIDDEN,
                format!("model not allowed: {model}"),
                "model_not_allowed",
                None,
            ),
            PipelineError::MalformedRequest(message) => json_error(
                StatusCode::BAD_REQUEST,
                message,
                "malformed_request",
                None,
            ),
            PipelineError::QueueOverflow => {
                let mut resp = json_error(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "too many requests queued, try again shortly".to_string(),
                    "queue_overflow",
                    None,
                );
                resp.headers_mut()
                    .insert("retry-after", HeaderValue::from_static("30"));
                resp
            }
            PipelineError::UploadQuotaExceeded => json_error(
                StatusCode::TOO_MANY_REQUESTS,
                "too many concurrent uploads for this principal".to_string(),
                "upload_quota_exceeded",
                None,
            ),
            PipelineError::UpstreamStatusError(upstream) => {
                let mut resp = Response::new(Body::from(upstream.body));
                *resp.status_mut() = upstream.status;
                resp.headers_mut().extend(upstream.headers);
                resp
            }
            PipelineError::UpstreamTransportError(message) => json_error(
                StatusCode::BAD_GATEWAY,
                message,
                "upstream_transport_error",
                None,
            ),
            PipelineError::UpstreamTimeout => json_error(
                StatusCode::GATEWAY_TIMEOUT,
                "upstream request timed out".to_string(),
                "upstream_timeout",
                None,
            ),
            PipelineError::ShutdownInProgress => json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "server is shutting down".to_string(),
                "shutdown_in_progress",
                None,
            ),
        }
    }
}
