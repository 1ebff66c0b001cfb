use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use http::{HeaderMap, Method, StatusCode};
use rand::Rng;
use reqwest::Client;
use tokio::sync::mpsc;
use tollgate_common::HttpClientConfig;
use tracing::{info, warn};

use super::retry::{backoff_delay, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyShape {
    Json,
    Multipart,
}

/// A fully-prepared outbound request; ownership moves into the transport
/// and it is never mutated once submitted (retries reuse the same bytes).
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    pub shape: BodyShape,
    pub multipart_boundary: Option<String>,
    pub idempotency_key: Option<String>,
}

impl UpstreamRequest {
    pub fn json(method: Method, path: impl Into<String>, body: Bytes) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HashMap::new(),
            body,
            shape: BodyShape::Json,
            multipart_boundary: None,
            idempotency_key: None,
        }
    }

    pub fn multipart(
        method: Method,
        path: impl Into<String>,
        body: Bytes,
        boundary: impl Into<String>,
    ) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HashMap::new(),
            body,
            shape: BodyShape::Multipart,
            multipart_boundary: Some(boundary.into()),
            idempotency_key: None,
        }
    }

    fn is_mutating(&self) -> bool {
        matches!(self.method, Method::POST | Method::PUT | Method::PATCH)
    }

    fn ensure_idempotency_key(&mut self) {
        if self.is_mutating() && self.idempotency_key.is_none() {
            self.idempotency_key = Some(generate_idempotency_key());
        }
    }
}

fn generate_idempotency_key() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let random: u64 = rand::thread_rng().gen();
    format!("req_{millis}_{random:x}")
}

#[derive(Debug)]
pub enum UpstreamResponse {
    Buffered {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    Stream {
        status: StatusCode,
        headers: HeaderMap,
        chunks: mpsc::Receiver<Bytes>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    ReadTimeout,
    Dns,
    Tls,
    Connect,
    Other,
}

#[derive(Debug)]
pub enum TransportError {
    Status {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    Transport {
        kind: TransportErrorKind,
        message: String,
    },
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_json(&self, req: UpstreamRequest) -> Result<UpstreamResponse, TransportError>;
    async fn send_streaming(
        &self,
        req: UpstreamRequest,
    ) -> Result<UpstreamResponse, TransportError>;
    async fn send_multipart(
        &self,
        req: UpstreamRequest,
    ) -> Result<UpstreamResponse, TransportError>;
}

pub struct ReqwestTransport {
    client: Client,
    base_url: String,
    retry: RetryPolicy,
    timeout_json: Duration,
    timeout_multipart: Duration,
}

impl ReqwestTransport {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            // IPv4 only, per the outbound-interface contract.
            .local_address(Some(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy::from_config(config),
            timeout_json: Duration::from_secs(config.timeout_json_secs),
            timeout_multipart: Duration::from_secs(config.timeout_multipart_secs),
        })
    }

    async fn execute_once(
        &self,
        req: &UpstreamRequest,
        timeout: Duration,
        want_stream: bool,
    ) -> Result<UpstreamResponse, TransportError> {
        let url = format!("{}{}", self.base_url, req.path);
        let mut builder = self
            .client
            .request(req.method.clone(), &url)
            .timeout(timeout)
            .body(req.body.clone());

        for (k, v) in &req.headers {
            builder = builder.header(k, v);
        }
        if let Some(key) = &req.idempotency_key {
            builder = builder.header("idempotency-key", key);
        }
        if let Some(boundary) = &req.multipart_boundary {
            builder = builder.header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            );
        }

        let resp = builder.send().await.map_err(map_reqwest_error)?;
        let status = resp.status();
        let headers = resp.headers().clone();

        if !status.is_success() || !want_stream {
            let body = resp.bytes().await.map_err(map_reqwest_error)?;
            if !status.is_success() {
                return Err(TransportError::Status {
                    status,
                    headers,
                    body,
                });
            }
            return Ok(UpstreamResponse::Buffered {
                status,
                headers,
                body,
            });
        }

        let (tx, rx) = mpsc::channel::<Bytes>(16);
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            while let Some(item) = stream.next().await {
                let Ok(chunk) = item else { break };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });
        Ok(UpstreamResponse::Stream {
            status,
            headers,
            chunks: rx,
        })
    }

    async fn send_with_retry(
        &self,
        mut req: UpstreamRequest,
        timeout: Duration,
        want_stream: bool,
    ) -> Result<UpstreamResponse, TransportError> {
        req.ensure_idempotency_key();
        let mut retry_after: Option<u64> = None;

        for attempt in 0..self.retry.max_attempts() {
            if attempt > 0 {
                let delay = backoff_delay(&self.retry, attempt - 1, retry_after.take());
                tokio::time::sleep(delay).await;
            }

            match self.execute_once(&req, timeout, want_stream).await {
                Ok(response) => return Ok(response),
                Err(TransportError::Status {
                    status,
                    headers,
                    body,
                }) => {
                    let retryable = self.retry.is_retryable_status(status.as_u16());
                    if !retryable || attempt + 1 == self.retry.max_attempts() {
                        return Err(TransportError::Status {
                            status,
                            headers,
                            body,
                        });
                    }
                    retry_after = headers
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok());
                    warn!(
                        target: "tollgate::upstream",
                        status = status.as_u16(),
                        attempt,
                        "retrying after retryable upstream status"
                    );
                }
                Err(TransportError::Transport { kind, message }) => {
                    let retryable = !matches!(kind, TransportErrorKind::Dns);
                    if !retryable || attempt + 1 == self.retry.max_attempts() {
                        return Err(TransportError::Transport { kind, message });
                    }
                    info!(
                        target: "tollgate::upstream",
                        ?kind,
                        attempt,
                        "retrying after transport error"
                    );
                }
            }
        }
        unreachable!("loop always returns on its final iteration")
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send_json(&self, req: UpstreamRequest) -> Result<UpstreamResponse, TransportError> {
        self.send_with_retry(req, self.timeout_json, false).await
    }

    async fn send_streaming(
        &self,
        req: UpstreamRequest,
    ) -> Result<UpstreamResponse, TransportError> {
        // Retries only cover the pre-headers phase: `execute_once` itself
        // does not retry, and `send_with_retry`'s loop only re-executes on
        // failures that happen before a stream has been handed back.
        self.send_with_retry(req, self.timeout_json, true).await
    }

    async fn send_multipart(
        &self,
        req: UpstreamRequest,
    ) -> Result<UpstreamResponse, TransportError> {
        self.send_with_retry(req, self.timeout_multipart, false)
            .await
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    TransportError::Transport {
        kind: classify_reqwest_error(&err),
        message: err.to_string(),
    }
}

fn classify_reqwest_error(err: &reqwest::Error) -> TransportErrorKind {
    let message = err.to_string().to_ascii_lowercase();
    if err.is_timeout() {
        if message.contains("read") || message.contains("idle") {
            return TransportErrorKind::ReadTimeout;
        }
        return TransportErrorKind::Timeout;
    }
    if err.is_connect() {
        if message.contains("dns") || message.contains("resolve") || message.contains("lookup") {
            return TransportErrorKind::Dns;
        }
        if message.contains("tls") || message.contains("ssl") || message.contains("certificate") {
            return TransportErrorKind::Tls;
        }
        return TransportErrorKind::Connect;
    }
    if message.contains("tls") || message.contains("ssl") {
        return TransportErrorKind::Tls;
    }
    TransportErrorKind::Other
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn http_client_config(base_url: String) -> HttpClientConfig {
        HttpClientConfig {
            base_url,
            timeout_json_secs: 5,
            timeout_multipart_secs: 5,
            connect_timeout_secs: 5,
            max_retries: 3,
            retryable_statuses: [429, 500, 502, 503, 504].into_iter().collect(),
            base_delay_ms: 10,
            max_delay_ms: 200,
        }
    }

    #[tokio::test]
    async fn retries_retryable_status_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(&http_client_config(server.uri())).unwrap();
        let req = UpstreamRequest::json(
            Method::POST,
            "/v1/chat/completions",
            Bytes::from_static(b"{}"),
        );
        let response = transport.send_json(req).await.unwrap();
        match response {
            UpstreamResponse::Buffered { status, body, .. } => {
                assert_eq!(status, StatusCode::OK);
                assert_eq!(&body[..], b"ok");
            }
            _ => panic!("expected buffered response"),
        }
    }

    #[tokio::test]
    async fn non_retryable_status_fails_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(&http_client_config(server.uri())).unwrap();
        let req = UpstreamRequest::json(
            Method::POST,
            "/v1/chat/completions",
            Bytes::from_static(b"{}"),
        );
        let err = transport.send_json(req).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Status { status, .. } if status == StatusCode::BAD_REQUEST
        ));
    }

    #[tokio::test]
    async fn idempotency_key_is_stable_across_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(&http_client_config(server.uri())).unwrap();
        let req = UpstreamRequest::json(Method::POST, "/v1/chat/completions", Bytes::from_static(b"{}"));
        transport.send_json(req.clone()).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let keys: std::collections::HashSet<_> = requests
            .iter()
            .map(|r| r.headers.get("idempotency-key").unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(keys.len(), 1, "all retries must carry the same idempotency key");
    }
}
