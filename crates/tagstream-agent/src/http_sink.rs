//! Telemetry sink that POSTs records to an HTTP collector.
//!
//! Log records go to `<endpoint>/logs` and events to `<endpoint>/events`,
//! both as JSON with an optional bearer token.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tagstream_core::config::TelemetryConfig;
use tagstream_core::error::PublishError;
use tagstream_core::telemetry::{LogRecord, TelemetryEvent, TelemetrySink};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

/// Longest response body kept in a [`PublishError::Rejected`].
const MAX_ERROR_BODY: usize = 512;

/// Errors building an [`HttpSink`].
#[derive(Debug, Error)]
pub enum SinkError {
    /// No endpoint was configured.
    #[error("telemetry.endpoint is not set")]
    MissingEndpoint,

    /// The endpoint is not a usable base URL.
    #[error("Invalid telemetry endpoint '{0}'")]
    InvalidEndpoint(String),

    /// The HTTP client could not be created.
    #[error("Failed to create HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// HTTP publish sink.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    logs_url: Url,
    events_url: Url,
    token: Option<String>,
}

impl HttpSink {
    /// Create a sink rooted at `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if `endpoint` cannot be a base URL or the client
    /// cannot be built.
    pub fn new(endpoint: &str, token: Option<String>, timeout: Duration) -> Result<Self, SinkError> {
        let mut base =
            Url::parse(endpoint).map_err(|_| SinkError::InvalidEndpoint(endpoint.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(SinkError::InvalidEndpoint(endpoint.to_string()));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let join = |segment: &str| {
            base.join(segment)
                .map_err(|_| SinkError::InvalidEndpoint(endpoint.to_string()))
        };

        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            logs_url: join("logs")?,
            events_url: join("events")?,
            token,
        })
    }

    /// Create a sink from the telemetry section of the config.
    ///
    /// The bearer token is read from the variable named by `token_env`;
    /// requests go out unauthenticated when it is unset.
    ///
    /// # Errors
    ///
    /// Returns an error if no valid endpoint is configured.
    pub fn from_config(config: &TelemetryConfig) -> Result<Self, SinkError> {
        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or(SinkError::MissingEndpoint)?;
        let token = std::env::var(&config.token_env).ok();
        if token.is_none() {
            warn!(var = %config.token_env, "No telemetry token set; publishing without auth");
        }
        Self::new(endpoint, token, Duration::from_secs(config.timeout_secs))
    }

    /// URL log records are posted to.
    #[must_use]
    pub const fn logs_url(&self) -> &Url {
        &self.logs_url
    }

    /// URL events are posted to.
    #[must_use]
    pub const fn events_url(&self) -> &Url {
        &self.events_url
    }

    async fn post<T: Serialize + Sync>(&self, url: &Url, body: &T) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(body)?;
        let mut request = self
            .client
            .post(url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PublishError::Unreachable(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            debug!(%url, %status, "Published");
            return Ok(());
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(PublishError::Rejected {
            status: status.as_u16(),
            body: if body.is_empty() {
                status.canonical_reason().unwrap_or_default().to_string()
            } else {
                body
            },
        })
    }
}

#[async_trait]
impl TelemetrySink for HttpSink {
    async fn publish_log(&self, record: &LogRecord) -> Result<(), PublishError> {
        self.post(&self.logs_url, record).await
    }

    async fn publish_event(&self, event: &TelemetryEvent) -> Result<(), PublishError> {
        self.post(&self.events_url, event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept one request, answer with `status_line` and return the raw
    /// request text.
    async fn one_shot_server(status_line: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-length: 4\r\nconnection: close\r\n\r\nnope"
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });
        (format!("http://{addr}/api/v1"), handle)
    }

    #[test]
    fn test_urls_are_joined_under_endpoint() {
        let sink = HttpSink::new("https://collector.example.com/api/v1", None, Duration::from_secs(1))
            .unwrap();
        assert_eq!(
            sink.logs_url().as_str(),
            "https://collector.example.com/api/v1/logs"
        );
        assert_eq!(
            sink.events_url().as_str(),
            "https://collector.example.com/api/v1/events"
        );

        let sink =
            HttpSink::new("https://collector.example.com/", None, Duration::from_secs(1)).unwrap();
        assert_eq!(sink.events_url().as_str(), "https://collector.example.com/events");
    }

    #[test]
    fn test_invalid_endpoint_is_rejected() {
        assert!(matches!(
            HttpSink::new("not a url", None, Duration::from_secs(1)),
            Err(SinkError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            HttpSink::new("mailto:ops@example.com", None, Duration::from_secs(1)),
            Err(SinkError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_from_config_requires_endpoint() {
        let config = TelemetryConfig::default();
        assert!(matches!(
            HttpSink::from_config(&config),
            Err(SinkError::MissingEndpoint)
        ));
    }

    #[tokio::test]
    async fn test_event_is_posted_with_token() {
        let (endpoint, server) = one_shot_server("200 OK").await;
        let sink = HttpSink::new(&endpoint, Some("secret".into()), Duration::from_secs(5)).unwrap();

        sink.publish_event(&TelemetryEvent::status(true))
            .await
            .unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/v1/events HTTP/1.1"));
        assert!(request
            .to_ascii_lowercase()
            .contains("authorization: bearer secret"));
        assert!(request.contains(r#""name":"sensorTagStatus""#));
        assert!(request.contains(r#""data":{"connected":true}"#));
    }

    #[tokio::test]
    async fn test_rejected_log_reports_status() {
        let (endpoint, server) = one_shot_server("503 Service Unavailable").await;
        let sink = HttpSink::new(&endpoint, None, Duration::from_secs(5)).unwrap();

        let err = sink
            .publish_log(&LogRecord::info("Sensortag discovered."))
            .await
            .unwrap_err();
        match err {
            PublishError::Rejected { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "nope");
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/v1/logs HTTP/1.1"));
        assert!(!request.to_ascii_lowercase().contains("authorization:"));
    }

    #[tokio::test]
    async fn test_unreachable_collector() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sink = HttpSink::new(&format!("http://{addr}/"), None, Duration::from_secs(2)).unwrap();
        let err = sink
            .publish_log(&LogRecord::info("hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Unreachable(_)));
    }
}
