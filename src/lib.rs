//! Relaygate - a token-gated proxy for AI completion APIs
//!
//! Every request must name an allow-listed route, carry a valid signed token, and (for JSON
//! routes) satisfy that route's strict body schema. Only then is it forwarded upstream, with the
//! caller's credential replaced by the server's own API key and the response streamed back as is.

use axum::Router;
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{info, instrument};

pub mod auth;
pub mod authz;
pub mod client;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod routes;
pub mod schema;
pub mod upstream;

use client::{HttpClient, HyperClient, PoolConfig};
use config::GatewaySecrets;
use handlers::gateway_handler;

pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// The main application state: the upstream client and the process-wide secrets
#[derive(Clone, Debug)]
pub struct AppState<T: HttpClient> {
    pub http_client: T,
    /// `None` when the gateway was started without its credentials; every request is refused.
    pub secrets: Option<Arc<GatewaySecrets>>,
    pub max_body_bytes: usize,
}

impl AppState<HyperClient> {
    /// Create a new AppState with the default Hyper client
    pub fn new(secrets: Option<GatewaySecrets>, pool: PoolConfig) -> Self {
        Self::with_client(secrets, client::create_hyper_client(pool))
    }
}

impl<T: HttpClient> AppState<T> {
    /// Create a new AppState with a custom HTTP client (useful for testing)
    pub fn with_client(secrets: Option<GatewaySecrets>, http_client: T) -> Self {
        Self {
            http_client,
            secrets: secrets.map(Arc::new),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }
}

/// Build the main router for the gateway.
///
/// There is a single handler for every path and method; paths outside the allowlist are refused
/// by the handler itself rather than by routing, so they get the same error shape as any other
/// rejection.
#[instrument(skip(state))]
pub fn build_router<T: HttpClient + Clone + Send + Sync + 'static>(state: AppState<T>) -> Router {
    info!("Building router");
    Router::new()
        .fallback(gateway_handler::<T>)
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// `prefix` is prepended to every metric name.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}

#[doc(hidden)]
pub mod test_utils {
    use super::*;
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use std::sync::Mutex;

    type ResponseBuilder = dyn Fn() -> Result<axum::response::Response, String> + Send + Sync;

    pub struct MockHttpClient {
        pub requests: Arc<Mutex<Vec<MockRequest>>>,
        response_builder: Arc<ResponseBuilder>,
    }

    #[derive(Debug, Clone)]
    pub struct MockRequest {
        pub method: String,
        pub uri: String,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    impl MockRequest {
        pub fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str())
        }
    }

    impl MockHttpClient {
        pub fn new(status: StatusCode, body: &str) -> Self {
            let body = body.to_string();
            Self::from_builder(move || {
                Ok(axum::response::Response::builder()
                    .status(status)
                    .header("content-type", "application/json")
                    .header("x-request-id", "req-mock")
                    .body(axum::body::Body::from(body.clone()))
                    .unwrap())
            })
        }

        pub fn new_streaming(status: StatusCode, chunks: Vec<String>) -> Self {
            Self::from_builder(move || {
                use axum::body::Body;
                use futures_util::stream;

                let stream = stream::iter(
                    chunks
                        .clone()
                        .into_iter()
                        .map(|chunk| Ok::<_, std::io::Error>(chunk.into_bytes())),
                );

                Ok(axum::response::Response::builder()
                    .status(status)
                    .header("content-type", "text/event-stream")
                    .header("cache-control", "no-cache")
                    .header("connection", "keep-alive")
                    .body(Body::from_stream(stream))
                    .unwrap())
            })
        }

        /// A client whose every request fails before a response arrives.
        pub fn failing(reason: &str) -> Self {
            let reason = reason.to_string();
            Self::from_builder(move || Err(reason.clone()))
        }

        fn from_builder(
            builder: impl Fn() -> Result<axum::response::Response, String> + Send + Sync + 'static,
        ) -> Self {
            Self {
                requests: Arc::new(Mutex::new(Vec::new())),
                response_builder: Arc::new(builder),
            }
        }

        pub fn get_requests(&self) -> Vec<MockRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl std::fmt::Debug for MockHttpClient {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MockHttpClient")
                .field("requests", &self.requests)
                .field("response_builder", &"<closure>")
                .finish()
        }
    }

    impl Clone for MockHttpClient {
        fn clone(&self) -> Self {
            Self {
                requests: Arc::clone(&self.requests),
                response_builder: Arc::clone(&self.response_builder),
            }
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn request(
            &self,
            req: axum::extract::Request,
        ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>> {
            let method = req.method().to_string();
            let uri = req.uri().to_string();
            let headers = req
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect();

            let body = axum::body::to_bytes(req.into_body(), usize::MAX)
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?
                .to_vec();

            self.requests.lock().unwrap().push(MockRequest {
                method,
                uri,
                headers,
                body,
            });

            (self.response_builder)().map_err(Into::into)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::test_tokens::{self, SECRET};
    use crate::auth::{Secret, TokenVerifier};
    use crate::upstream::{Upstream, UpstreamCredential};
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use serde_json::{Value, json};
    use test_utils::MockHttpClient;

    fn secrets() -> GatewaySecrets {
        GatewaySecrets {
            verifier: TokenVerifier::new(&Secret::from(SECRET)),
            upstream: Upstream {
                base: "https://api.example.com/".parse().unwrap(),
                credential: UpstreamCredential::builder().api_key("sk-server").build(),
            },
        }
    }

    fn server_with(client: MockHttpClient) -> TestServer {
        let app_state = AppState::with_client(Some(secrets()), client);
        TestServer::new(build_router(app_state)).unwrap()
    }

    fn chat_body() -> Value {
        json!({
            "model": "gpt-4-1106-preview",
            "temperature": 0.8,
            "top_p": 1,
            "frequency_penalty": 0,
            "presence_penalty": 0,
            "n": 1,
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}]
        })
    }

    fn bearer(token: &str) -> String {
        format!("Bearer {token}")
    }

    #[tokio::test]
    async fn test_valid_request_is_forwarded_with_server_credential() {
        let mock_response_body = r#"{"id": "cmpl-1", "object": "chat.completion"}"#;
        let mock_client = MockHttpClient::new(StatusCode::OK, mock_response_body);
        let server = server_with(mock_client.clone());

        let response = server
            .post("/v1/chat/completions")
            .add_header("authorization", bearer(&test_tokens::for_subject("user-1")))
            .json(&chat_body())
            .await;

        assert_eq!(response.status_code(), 200);
        assert_eq!(response.text(), mock_response_body);
        assert_eq!(response.header("x-request-id"), "req-mock");

        let requests = mock_client.get_requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.method, "POST");
        assert_eq!(request.uri, "https://api.example.com/v1/chat/completions");
        assert_eq!(request.header("authorization"), Some("Bearer sk-server"));
        assert_eq!(request.header("host"), Some("api.example.com"));
        assert_eq!(request.body, serde_json::to_vec(&chat_body()).unwrap());
    }

    #[tokio::test]
    async fn test_missing_configuration_rejects_everything() {
        let mock_client = MockHttpClient::new(StatusCode::OK, "{}");
        let app_state = AppState::with_client(None, mock_client.clone());
        let server = TestServer::new(build_router(app_state)).unwrap();

        let response = server
            .post("/v1/chat/completions")
            .add_header("authorization", bearer(&test_tokens::for_subject("user-1")))
            .json(&chat_body())
            .await;

        assert_eq!(response.status_code(), 400);
        let body: Value = response.json();
        assert_eq!(body["error"]["type"], "config_error");
        assert!(mock_client.get_requests().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_path_is_rejected_before_token_check() {
        let mock_client = MockHttpClient::new(StatusCode::OK, "{}");
        let server = server_with(mock_client.clone());

        for path in ["/v1/unknown", "/", "/v1/models"] {
            let response = server.get(path).await;
            assert_eq!(response.status_code(), 400);
            let body: Value = response.json();
            assert_eq!(body["error"]["type"], "invalid_route");
            assert_eq!(
                body["error"]["message"],
                format!("Bad request: Invalid path: {path}")
            );
        }
        assert!(mock_client.get_requests().is_empty());
    }

    #[tokio::test]
    async fn test_body_over_limit_is_rejected() {
        let mock_client = MockHttpClient::new(StatusCode::OK, "{}");
        let app_state =
            AppState::with_client(Some(secrets()), mock_client.clone()).max_body_bytes(16);
        let server = TestServer::new(build_router(app_state)).unwrap();

        let response = server
            .post("/v1/chat/completions")
            .add_header("authorization", bearer(&test_tokens::for_subject("user-1")))
            .json(&chat_body())
            .await;

        assert_eq!(response.status_code(), 400);
        let body: Value = response.json();
        assert_eq!(body["error"]["type"], "invalid_body");
        assert!(mock_client.get_requests().is_empty());
    }

    mod metrics {
        use super::*;
        use rstest::*;

        /// The prometheus recorder is process-global, so every metrics test shares one pair of
        /// servers.
        #[fixture]
        #[once]
        fn get_shared_metrics_servers() -> (TestServer, TestServer) {
            let (prometheus_layer, handle) = build_metrics_layer_and_handle("relaygate");

            let metrics_router = build_metrics_router(handle);
            let metrics_server = TestServer::new(metrics_router).unwrap();

            let mock_client = MockHttpClient::new(StatusCode::OK, "{}");
            let app_state = AppState::with_client(Some(secrets()), mock_client);
            let router = build_router(app_state).layer(prometheus_layer);
            let server = TestServer::new(router).unwrap();

            (server, metrics_server)
        }

        fn count(metrics_text: &str, needle: &str) -> i32 {
            metrics_text
                .lines()
                .find(|line| line.contains(needle))
                .and_then(|line| line.split_whitespace().last())
                .and_then(|s| s.parse::<i32>().ok())
                .unwrap_or(0)
        }

        #[rstest]
        #[tokio::test]
        async fn test_metrics_count_rejected_requests(
            get_shared_metrics_servers: &(TestServer, TestServer),
        ) {
            let (server, metrics_server) = get_shared_metrics_servers;
            let needle = "relaygate_http_requests_total{method=\"POST\",status=\"400\",endpoint=\"/v1/chat/completions\"}";

            let initial_count = count(&metrics_server.get("/metrics").await.text(), needle);

            for _ in 0..3 {
                let response = server.post("/v1/chat/completions").json(&chat_body()).await;
                assert_eq!(response.status_code(), 400);
            }

            let response = metrics_server.get("/metrics").await;
            assert_eq!(response.status_code(), 200);
            assert_eq!(
                count(&response.text(), needle),
                initial_count + 3,
                "Metrics should increment by 3"
            );
        }
    }
}
