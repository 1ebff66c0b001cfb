use axum::body::{Body, Bytes};
use axum::response::Response;
use http::{HeaderMap, StatusCode};
use tokio::sync::{mpsc, oneshot};

/// Usage numbers opportunistically scraped out of an SSE stream's final
/// `data:` events, for recording once the stream is fully relayed.
pub struct StreamUsage {
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Wraps an upstream chunk channel in a response body, forwarding every
/// chunk to the client unchanged while scanning `data: {...}` lines for a
/// trailing `usage` object (most SSE APIs emit one on the final event).
/// The usage result is delivered once the stream ends or the receiver is
/// dropped without ever finding one.
pub fn stream_and_relay(
    mut chunks: mpsc::Receiver<Bytes>,
) -> (Body, oneshot::Receiver<Option<StreamUsage>>) {
    let (usage_tx, usage_rx) = oneshot::channel();
    let (out_tx, out_rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);

    tokio::spawn(async move {
        let mut carry = String::new();
        let mut found: Option<StreamUsage> = None;

        while let Some(chunk) = chunks.recv().await {
            if found.is_none() {
                if let Ok(text) = std::str::from_utf8(&chunk) {
                    carry.push_str(text);
                    found = scan_for_usage(&carry);
                }
            }
            if out_tx.send(Ok(chunk)).await.is_err() {
                break;
            }
        }
        let _ = usage_tx.send(found);
    });

    let stream = tokio_stream::wrappers::ReceiverStream::new(out_rx);
    (Body::from_stream(stream), usage_rx)
}

fn scan_for_usage(buffer: &str) -> Option<StreamUsage> {
    for line in buffer.lines().rev() {
        let Some(payload) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) else {
            continue;
        };
        let payload = payload.trim();
        if payload == "[DONE]" || payload.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
            continue;
        };
        let Some(usage) = value.get("usage") else { continue };
        if usage.is_null() {
            continue;
        }
        let model = value
            .get("model")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        let prompt_tokens = usage
            .get("prompt_tokens")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        let completion_tokens = usage
            .get("completion_tokens")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        let total_tokens = usage
            .get("total_tokens")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(prompt_tokens + completion_tokens);
        return Some(StreamUsage {
            model,
            prompt_tokens,
            completion_tokens,
            total_tokens,
        });
    }
    None
}

pub fn build_sse_response(status: StatusCode, headers: &HeaderMap, body: Body) -> Response {
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    resp.headers_mut().extend(headers.clone());
    let out = resp.headers_mut();
    out.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/event-stream"),
    );
    out.insert(
        http::header::CACHE_CONTROL,
        http::HeaderValue::from_static("no-cache"),
    );
    out.insert(
        http::header::CONNECTION,
        http::HeaderValue::from_static("keep-alive"),
    );
    // Disables response buffering in nginx-style reverse proxies sitting in
    // front of this service, so SSE chunks reach the client as they arrive.
    out.insert("x-accel-buffering", http::HeaderValue::from_static("no"));
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_final_usage_event() {
        let buffer = "data: {\"model\":\"gpt-4o-mini\"}\n\ndata: {\"model\":\"gpt-4o-mini\",\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":7}}\n\ndata: [DONE]\n";
        let usage = scan_for_usage(buffer).unwrap();
        assert_eq!(usage.prompt_tokens, 3);
        assert_eq!(usage.completion_tokens, 7);
        assert_eq!(usage.total_tokens, 10);
    }

    #[test]
    fn no_usage_event_returns_none() {
        let buffer = "data: {\"model\":\"gpt-4o-mini\"}\n\ndata: [DONE]\n";
        assert!(scan_for_usage(buffer).is_none());
    }
}
