use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Response};
use futures_util::stream;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use tollgate_common::Principal;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::scheduler::ScheduleError;
use crate::state::AppState;
use crate::upload::StagedUpload;
use crate::upstream::{TransportError, TransportErrorKind, UpstreamRequest, UpstreamResponse};
use crate::usage::{today_utc, UsageRecord};

use super::classify::{classify_body, BodyClass};
use super::redact::redact_for_log;
use super::streaming::{build_sse_response, stream_and_relay};

const ACCESS_LOG_TARGET: &str = "tollgate::access";
const MAX_MULTIPART_PARTS: usize = 5;
const MAX_MULTIPART_PART_BYTES: u64 = 50 * 1024 * 1024;

pub async fn proxy_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let trace_id = Uuid::new_v4().to_string();
    let started = Instant::now();
    let (parts, body) = request.into_parts();
    let method = parts.method.clone();
    let headers = parts.headers.clone();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(|q| q.to_string());
    let client_ip = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.to_string())
        .unwrap_or_default();

    let body_bytes = match axum::body::to_bytes(body, 50 * 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return finish(
                &state,
                &path,
                started,
                PipelineError::MalformedRequest(format!("reading request body: {err}")).into_response(),
            );
        }
    };

    let Some(api_key) = extract_api_key(&headers) else {
        return finish(&state, &path, started, PipelineError::InvalidKey.into_response());
    };
    let Some(principal) = state.key_store.lookup(&api_key) else {
        return finish(&state, &path, started, PipelineError::InvalidKey.into_response());
    };

    if !state.allowlist.endpoint_allowed(&path) {
        return finish(
            &state,
            &path,
            started,
            PipelineError::EndpointNotAllowed(path.clone()).into_response(),
        );
    }

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let class = classify_body(&method, content_type.as_deref(), &path);

    let state_for_work = state.clone();
    let principal_for_work = principal.clone();
    let headers_for_work = headers.clone();
    let path_for_work = path.clone();
    let trace_for_work = trace_id.clone();
    let client_ip_for_work = client_ip.clone();

    let schedule_result = state
        .scheduler
        .schedule(&principal.key, move || {
            dispatch(
                state_for_work,
                principal_for_work,
                method,
                headers_for_work,
                path_for_work,
                query,
                body_bytes,
                class,
                trace_for_work,
                client_ip_for_work,
            )
        })
        .await;

    let response = match schedule_result {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            warn!(
                target: ACCESS_LOG_TARGET,
                trace_id = %trace_id,
                principal = %principal.name,
                error = %err,
                "request failed"
            );
            err.into_response()
        }
        Err(ScheduleError::QueueOverflow { limiter }) => {
            state.metrics.record_queue_overflow(limiter);
            PipelineError::QueueOverflow.into_response()
        }
        Err(ScheduleError::Draining) => PipelineError::ShutdownInProgress.into_response(),
    };

    finish(&state, &path, started, response)
}

fn finish(state: &Arc<AppState>, path: &str, started: Instant, response: Response) -> Response {
    state
        .metrics
        .record_request(path, response.status().as_u16(), started.elapsed());
    response
}

#[allow(clippy::too_many_arguments)]
async fn dispatch(
    state: Arc<AppState>,
    principal: Principal,
    method: Method,
    headers: HeaderMap,
    path: String,
    query: Option<String>,
    body: Bytes,
    class: BodyClass,
    trace_id: String,
    client_ip: String,
) -> Result<Response, PipelineError> {
    match class {
        BodyClass::Json => {
            handle_json(state, principal, method, path, query, body, trace_id, client_ip).await
        }
        BodyClass::Multipart => {
            handle_multipart(state, principal, method, headers, path, body, trace_id, client_ip)
                .await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_json(
    state: Arc<AppState>,
    principal: Principal,
    method: Method,
    path: String,
    query: Option<String>,
    body: Bytes,
    trace_id: String,
    client_ip: String,
) -> Result<Response, PipelineError> {
    let parsed: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| PipelineError::MalformedRequest(format!("invalid json body: {e}")))?;

    let normalized = state.allowlist.normalize(parsed, &path)?;
    log_access(&principal, &method, &path, query.as_deref(), &client_ip, &normalized);

    let is_stream = normalized
        .get("stream")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    let outgoing = serde_json::to_vec(&normalized)
        .map_err(|e| PipelineError::MalformedRequest(format!("re-serializing body: {e}")))?;

    let mut upstream_req = UpstreamRequest::json(method, path.clone(), Bytes::from(outgoing));
    upstream_req.headers.insert(
        "content-type".to_string(),
        "application/json".to_string(),
    );
    upstream_req.headers.insert(
        "authorization".to_string(),
        format!("Bearer {}", state.config.openai_api_key),
    );

    if is_stream {
        return handle_streaming(&state, &principal, &path, upstream_req, &trace_id).await;
    }

    let response = state.transport.send_json(upstream_req).await;
    translate_buffered(&state, &principal, &path, response)
}

async fn handle_streaming(
    state: &Arc<AppState>,
    principal: &Principal,
    path: &str,
    upstream_req: UpstreamRequest,
    trace_id: &str,
) -> Result<Response, PipelineError> {
    match state.transport.send_streaming(upstream_req).await {
        Ok(UpstreamResponse::Stream {
            status,
            headers,
            chunks,
        }) => {
            if !status.is_success() {
                // Pre-headers failure path never produces a stream for a
                // non-success status (the transport buffers those), so
                // reaching here with a non-2xx status only happens if the
                // upstream itself claims success headers then fails later;
                // treat it as an opaque pass-through.
            }
            let (body, usage_rx) = stream_and_relay(chunks);
            let principal = principal.clone();
            let path = path.to_string();
            let state = state.clone();
            tokio::spawn(async move {
                if let Some(usage) = usage_rx.await.ok().flatten() {
                    state.usage.record(UsageRecord {
                        principal_key: principal.key.clone(),
                        date: today_utc(),
                        model: usage.model,
                        endpoint: path,
                        prompt_tokens: usage.prompt_tokens,
                        completion_tokens: usage.completion_tokens,
                        total_tokens: usage.total_tokens,
                    });
                }
            });
            info!(target: "tollgate::upstream", trace_id, status = status.as_u16(), "streaming response started");
            Ok(build_sse_response(status, &headers, body))
        }
        Ok(UpstreamResponse::Buffered { status, headers, body }) => {
            Ok(raw_response(status, &headers, body))
        }
        Err(err) => Err(translate_transport_error(err)),
    }
}

fn translate_buffered(
    state: &Arc<AppState>,
    principal: &Principal,
    path: &str,
    result: Result<UpstreamResponse, TransportError>,
) -> Result<Response, PipelineError> {
    match result {
        Ok(UpstreamResponse::Buffered { status, headers, body }) => {
            record_buffered_usage(state, principal, path, &headers, &body);
            Ok(raw_response(status, &headers, body))
        }
        Ok(UpstreamResponse::Stream { status, headers, .. }) => {
            // Buffered call paths never return a stream; guard defensively.
            Ok(raw_response(status, &headers, Bytes::new()))
        }
        Err(err) => Err(translate_transport_error(err)),
    }
}

fn translate_transport_error(err: TransportError) -> PipelineError {
    match err {
        TransportError::Status { status, headers, body } => {
            PipelineError::UpstreamStatusError(Box::new(crate::error::UpstreamStatus {
                status,
                headers,
                body,
            }))
        }
        TransportError::Transport { kind, message } => match kind {
            TransportErrorKind::Timeout | TransportErrorKind::ReadTimeout => {
                PipelineError::UpstreamTimeout
            }
            _ => PipelineError::UpstreamTransportError(message),
        },
    }
}

fn record_buffered_usage(
    state: &Arc<AppState>,
    principal: &Principal,
    path: &str,
    headers: &http::HeaderMap,
    body: &Bytes,
) {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !(content_type.starts_with("application/json") || content_type.starts_with("text/")) {
        return;
    }
    let Ok(parsed) = serde_json::from_slice::<serde_json::Value>(body) else {
        return;
    };
    let model = parsed
        .get("model")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();
    let prompt_tokens = parsed
        .get("usage")
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0);
    let completion_tokens = parsed
        .get("usage")
        .and_then(|u| u.get("completion_tokens"))
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0);
    let total_tokens = parsed
        .get("usage")
        .and_then(|u| u.get("total_tokens"))
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(prompt_tokens + completion_tokens);

    state.usage.record(UsageRecord {
        principal_key: principal.key.clone(),
        date: today_utc(),
        model,
        endpoint: path.to_string(),
        prompt_tokens,
        completion_tokens,
        total_tokens,
    });
}

#[allow(clippy::too_many_arguments)]
async fn handle_multipart(
    state: Arc<AppState>,
    principal: Principal,
    method: Method,
    headers: HeaderMap,
    path: String,
    body: Bytes,
    _trace_id: String,
    client_ip: String,
) -> Result<Response, PipelineError> {
    let guard = state
        .upload_slots
        .try_acquire(&principal.key)
        .await
        .ok_or(PipelineError::UploadQuotaExceeded)?;

    let boundary = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|ct| multer::parse_boundary(ct).ok())
        .ok_or_else(|| PipelineError::MalformedRequest("missing multipart boundary".to_string()))?;

    let staging_dir = std::path::PathBuf::from(&state.config.staging_dir);
    let (text_fields, staged_files) =
        parse_multipart(body, &boundary, &staging_dir, &path, &state.allowlist).await?;

    // Dropping `guard` here would release the slot before the upstream call
    // completes; keep it alive for the whole request.
    let (outgoing_body, fresh_boundary) = rebuild_multipart(&text_fields, &staged_files)
        .map_err(|e| PipelineError::MalformedRequest(format!("rebuilding multipart body: {e}")))?;

    log_access(
        &principal,
        &method,
        &path,
        None,
        &client_ip,
        &serde_json::json!({"fields": text_fields}),
    );

    let mut upstream_req =
        UpstreamRequest::multipart(method, path.clone(), outgoing_body, fresh_boundary);
    upstream_req.headers.insert(
        "authorization".to_string(),
        format!("Bearer {}", state.config.openai_api_key),
    );
    let result = state.transport.send_multipart(upstream_req).await;
    drop(guard);
    drop(staged_files);

    translate_buffered(&state, &principal, &path, result)
}

async fn parse_multipart(
    body: Bytes,
    boundary: &str,
    staging_dir: &std::path::Path,
    path: &str,
    allowlist: &crate::allowlist::AllowlistPolicy,
) -> Result<(std::collections::HashMap<String, String>, Vec<StagedUpload>), PipelineError> {
    // Only `classify_body` routes here, and it only does so for `/audio/`
    // paths -- every file part on this path must declare an audio MIME type.
    let is_audio_path = path.contains("/audio/");

    let stream = stream::once(async move { Ok::<Bytes, Infallible>(body) });
    let constraints = multer::Constraints::new()
        .size_limit(multer::SizeLimit::new().per_field(MAX_MULTIPART_PART_BYTES));
    let mut multipart = multer::Multipart::with_constraints(stream, boundary, constraints);
    let mut fields = std::collections::HashMap::new();
    let mut staged = Vec::new();
    let mut part_count = 0usize;

    while let Ok(Some(field)) = multipart.next_field().await {
        part_count += 1;
        if part_count > MAX_MULTIPART_PARTS {
            return Err(PipelineError::MalformedRequest(format!(
                "multipart body exceeds the {MAX_MULTIPART_PARTS}-part limit"
            )));
        }

        let field_name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().unwrap_or_default().to_string();
        let content_type = field
            .content_type()
            .map(|m| m.to_string())
            .unwrap_or_default();

        if file_name.is_empty() {
            let text = field
                .text()
                .await
                .map_err(|e| PipelineError::MalformedRequest(format!("reading multipart field: {e}")))?;
            fields.insert(field_name, text);
        } else {
            if is_audio_path && !content_type.starts_with("audio/") {
                return Err(PipelineError::MalformedRequest(format!(
                    "unsupported content type for multipart file part: {content_type}"
                )));
            }
            let bytes = field
                .bytes()
                .await
                .map_err(|e| PipelineError::MalformedRequest(format!("reading multipart file: {e}")))?;
            let entry = crate::upload::stage(staging_dir, &field_name, &file_name, &content_type, &bytes)
                .map_err(|e| PipelineError::MalformedRequest(format!("staging upload: {e}")))?;
            staged.push(entry);
        }
    }

    if let Some(model) = fields.get("model") {
        if !allowlist.model_allowed(model) {
            return Err(PipelineError::ModelNotAllowed(model.clone()));
        }
    }
    Ok((fields, staged))
}

fn rebuild_multipart(
    fields: &std::collections::HashMap<String, String>,
    files: &[StagedUpload],
) -> std::io::Result<(Bytes, String)> {
    let boundary = format!("tollgate-{}", Uuid::new_v4().simple());
    let mut out = Vec::new();
    for (name, value) in fields {
        out.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        out.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
        );
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    for file in files {
        out.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        out.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                file.field_name, file.declared_filename
            )
            .as_bytes(),
        );
        out.extend_from_slice(format!("Content-Type: {}\r\n\r\n", file.declared_mime).as_bytes());
        out.extend_from_slice(&std::fs::read(file.path())?);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    Ok((Bytes::from(out), boundary))
}

fn raw_response(status: StatusCode, headers: &http::HeaderMap, body: Bytes) -> Response {
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    resp.headers_mut().extend(headers.clone());
    resp
}

fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    for name in ["api-key", "x-api-key", "apikey", "authorization"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

fn log_access(
    principal: &Principal,
    method: &Method,
    path: &str,
    query: Option<&str>,
    client_ip: &str,
    body: &serde_json::Value,
) {
    let redacted = redact_for_log(body);
    info!(
        target: ACCESS_LOG_TARGET,
        principal = %principal.name,
        email = %principal.email,
        ip = %client_ip,
        method = %method,
        path = %path,
        query = query.unwrap_or(""),
        body = %redacted,
        "proxied request"
    );
}

pub fn cors_preflight_response() -> Response {
    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = StatusCode::NO_CONTENT;
    let headers = resp.headers_mut();
    headers.insert("access-control-allow-origin", HeaderValue::from_static("*"));
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("Content-Type, Api-Key, User-Agent"),
    );
    resp
}
