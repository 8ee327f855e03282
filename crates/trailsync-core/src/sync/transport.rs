//! Collector transport

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::models::EventId;
use crate::util::{compact_text, is_http_url, normalize_text_option};

/// Protocol version header sent with every request
pub const XAPI_VERSION_HEADER: &str = "X-Experience-API-Version";
pub const XAPI_VERSION: &str = "1.0.3";
/// Header carrying the partition (tenant) of a batch
pub const TENANT_HEADER: &str = "X-Tenant-Id";

#[derive(Debug, Error)]
pub enum TransmitError {
    #[error("Invalid transport configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Collector rejected request: {message} (HTTP {status})")]
    Http { status: u16, message: String },
    #[error("Invalid collector response: {0}")]
    InvalidPayload(String),
}

impl From<reqwest::Error> for TransmitError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            Self::InvalidPayload(error.to_string())
        } else {
            Self::Network(error.to_string())
        }
    }
}

pub type TransmitResult<T> = Result<T, TransmitError>;

/// One request worth of resolved statements
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingBatch {
    pub partition_key: Option<String>,
    pub payloads: Vec<Value>,
}

/// Network boundary of the sync service
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver the whole batch. `Ok` means the collector accepted every statement.
    async fn send_batch(&self, batch: &OutgoingBatch) -> TransmitResult<()>;

    /// Whether [`Transport::fetch_remote`] consults the collector
    fn supports_remote_lookup(&self) -> bool {
        false
    }

    /// Server copy of a statement within `partition_key`, if the collector has one
    async fn fetch_remote(
        &self,
        _id: &EventId,
        _partition_key: Option<&str>,
    ) -> TransmitResult<Option<Value>> {
        Ok(None)
    }
}

/// Settings for [`HttpTransport`]
#[derive(Clone, PartialEq, Eq)]
pub struct HttpTransportConfig {
    pub endpoint: String,
    pub auth_token: Option<String>,
    /// Tenant sent for batches without a partition key
    pub tenant_id: Option<String>,
    pub request_timeout: Duration,
    pub remote_lookup: bool,
}

impl std::fmt::Debug for HttpTransportConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpTransportConfig")
            .field("endpoint", &self.endpoint)
            .field(
                "auth_token",
                &self.auth_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("tenant_id", &self.tenant_id)
            .field("request_timeout", &self.request_timeout)
            .field("remote_lookup", &self.remote_lookup)
            .finish()
    }
}

/// `reqwest`-backed transport posting statement arrays to the collector
#[derive(Clone)]
pub struct HttpTransport {
    endpoint: String,
    auth_token: Option<String>,
    tenant_id: Option<String>,
    remote_lookup: bool,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> TransmitResult<Self> {
        let endpoint = normalize_endpoint(config.endpoint)?;
        Ok(Self {
            endpoint,
            auth_token: normalize_text_option(config.auth_token),
            tenant_id: normalize_text_option(config.tenant_id),
            remote_lookup: config.remote_lookup,
            client: reqwest::Client::builder()
                .timeout(config.request_timeout)
                .build()?,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request(&self, builder: reqwest::RequestBuilder, partition_key: Option<&str>) -> reqwest::RequestBuilder {
        let mut builder = builder
            .header(XAPI_VERSION_HEADER, XAPI_VERSION)
            .header("Accept", "application/json");
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(tenant) = partition_key.or(self.tenant_id.as_deref()) {
            builder = builder.header(TENANT_HEADER, tenant);
        }
        builder
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_batch(&self, batch: &OutgoingBatch) -> TransmitResult<()> {
        let response = self
            .request(
                self.client.post(&self.endpoint).json(&batch.payloads),
                batch.partition_key.as_deref(),
            )
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TransmitError::Http {
                status: status.as_u16(),
                message: parse_api_error(status, &body),
            });
        }
        Ok(())
    }

    fn supports_remote_lookup(&self) -> bool {
        self.remote_lookup
    }

    async fn fetch_remote(
        &self,
        id: &EventId,
        partition_key: Option<&str>,
    ) -> TransmitResult<Option<Value>> {
        if !self.remote_lookup {
            return Ok(None);
        }

        let response = self
            .request(
                self.client
                    .get(&self.endpoint)
                    .query(&[("statementId", id.as_str())]),
                partition_key,
            )
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json::<Value>().await?)),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(TransmitError::Http {
                    status: status.as_u16(),
                    message: parse_api_error(status, &body),
                })
            }
        }
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpTransport")
            .field("endpoint", &self.endpoint)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .field("tenant_id", &self.tenant_id)
            .field("remote_lookup", &self.remote_lookup)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct CollectorErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<CollectorErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return compact_text(&message);
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        trimmed
    }
}

fn normalize_endpoint(raw: String) -> TransmitResult<String> {
    let endpoint = normalize_text_option(Some(raw)).ok_or_else(|| {
        TransmitError::InvalidConfiguration("collector endpoint must not be empty".to_string())
    })?;
    if is_http_url(&endpoint) {
        Ok(endpoint.trim_end_matches('/').to_string())
    } else {
        Err(TransmitError::InvalidConfiguration(
            "collector endpoint must include http:// or https://".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Query, State};
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Json, Router};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Collector {
        received: Arc<Mutex<Vec<(HeaderMap, Value)>>>,
        reject: bool,
    }

    async fn receive(
        State(collector): State<Collector>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (axum::http::StatusCode, Json<Value>) {
        collector.received.lock().unwrap().push((headers, body));
        if collector.reject {
            (
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "message": "collector overloaded" })),
            )
        } else {
            (axum::http::StatusCode::OK, Json(json!(["ok"])))
        }
    }

    async fn lookup(
        headers: HeaderMap,
        Query(params): Query<HashMap<String, String>>,
    ) -> axum::response::Response {
        use axum::response::IntoResponse;
        let tenant = headers
            .get(TENANT_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        match params.get("statementId").map(String::as_str) {
            Some("org-a-only") if tenant == "org-a" => {
                Json(json!({ "id": "org-a-only", "timestamp": "2024-01-01T00:00:00Z" }))
                    .into_response()
            }
            Some("known") => Json(json!({ "id": "known", "timestamp": "2024-01-01T00:00:00Z" }))
                .into_response(),
            Some("broken") => axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            _ => axum::http::StatusCode::NOT_FOUND.into_response(),
        }
    }

    async fn serve(collector: Collector) -> String {
        let app = Router::new()
            .route("/statements", post(receive).get(lookup))
            .with_state(collector);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/statements")
    }

    fn config(endpoint: String) -> HttpTransportConfig {
        HttpTransportConfig {
            endpoint,
            auth_token: Some("secret-token".to_string()),
            tenant_id: Some("default-tenant".to_string()),
            request_timeout: Duration::from_secs(5),
            remote_lookup: true,
        }
    }

    #[tokio::test]
    async fn test_send_batch_posts_statements_with_headers() {
        let collector = Collector::default();
        let transport = HttpTransport::new(config(serve(collector.clone()).await)).unwrap();

        transport
            .send_batch(&OutgoingBatch {
                partition_key: Some("org-7".to_string()),
                payloads: vec![json!({ "id": "a" }), json!({ "id": "b" })],
            })
            .await
            .unwrap();

        let received = collector.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        let (headers, body) = &received[0];
        assert_eq!(body, &json!([{ "id": "a" }, { "id": "b" }]));
        assert_eq!(headers[XAPI_VERSION_HEADER], XAPI_VERSION);
        assert_eq!(headers["authorization"], "Bearer secret-token");
        assert_eq!(headers[TENANT_HEADER], "org-7");
    }

    #[tokio::test]
    async fn test_default_tenant_used_without_partition() {
        let collector = Collector::default();
        let transport = HttpTransport::new(config(serve(collector.clone()).await)).unwrap();

        transport
            .send_batch(&OutgoingBatch {
                partition_key: None,
                payloads: vec![json!({ "id": "a" })],
            })
            .await
            .unwrap();

        let received = collector.received.lock().unwrap();
        assert_eq!(received[0].0[TENANT_HEADER], "default-tenant");
    }

    #[tokio::test]
    async fn test_non_success_status_is_http_error() {
        let collector = Collector {
            reject: true,
            ..Collector::default()
        };
        let transport = HttpTransport::new(config(serve(collector).await)).unwrap();

        let error = transport
            .send_batch(&OutgoingBatch {
                partition_key: None,
                payloads: vec![json!({ "id": "a" })],
            })
            .await
            .unwrap_err();
        match error {
            TransmitError::Http { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "collector overloaded");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_collector_is_network_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport =
            HttpTransport::new(config(format!("http://{addr}/statements"))).unwrap();
        let error = transport
            .send_batch(&OutgoingBatch {
                partition_key: None,
                payloads: vec![json!({ "id": "a" })],
            })
            .await
            .unwrap_err();
        assert!(matches!(error, TransmitError::Network(_)));
    }

    #[tokio::test]
    async fn test_fetch_remote() {
        let transport = HttpTransport::new(config(serve(Collector::default()).await)).unwrap();

        let known = transport.fetch_remote(&EventId::from("known"), None).await.unwrap();
        assert_eq!(known.unwrap()["id"], "known");
        assert!(transport
            .fetch_remote(&EventId::from("unknown"), None)
            .await
            .unwrap()
            .is_none());
        assert!(matches!(
            transport.fetch_remote(&EventId::from("broken"), None).await,
            Err(TransmitError::Http { status: 500, .. })
        ));
    }

    #[tokio::test]
    async fn test_fetch_remote_scoped_to_partition() {
        let transport = HttpTransport::new(config(serve(Collector::default()).await)).unwrap();
        let id = EventId::from("org-a-only");

        let found = transport.fetch_remote(&id, Some("org-a")).await.unwrap();
        assert_eq!(found.unwrap()["id"], "org-a-only");
        assert!(transport
            .fetch_remote(&id, Some("org-b"))
            .await
            .unwrap()
            .is_none());
        assert!(transport.fetch_remote(&id, None).await.unwrap().is_none());
    }

    #[test]
    fn test_endpoint_validation() {
        let mut bad = config(String::new());
        assert!(HttpTransport::new(bad.clone()).is_err());
        bad.endpoint = "collector.example.com".to_string();
        assert!(HttpTransport::new(bad).is_err());

        let transport =
            HttpTransport::new(config("https://lrs.example.com/xapi/statements/".to_string()))
                .unwrap();
        assert_eq!(transport.endpoint(), "https://lrs.example.com/xapi/statements");
    }

    #[test]
    fn test_debug_redacts_token() {
        let debug = format!("{:?}", config("https://lrs.example.com".to_string()));
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("[REDACTED]"));
    }
}
