//! Building and sending the outbound request.
//!
//! The outbound request keeps the caller's method, path, query, body and headers, with the
//! caller's `Authorization` swapped for the server-held API key. The upstream response comes back
//! untouched, its body still streaming.
use crate::auth::Secret;
use crate::client::HttpClient;
use crate::errors::GatewayError;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderValue, Uri, header, request};
use axum::response::Response;
use bon::Builder;
use tracing::{debug, info};
use url::Url;

pub const ORGANIZATION_HEADER: &str = "openai-organization";

pub const DEFAULT_UPSTREAM: &str = "https://api.openai.com/";

/// The server's own credential for the upstream API. Loaded once at startup.
#[derive(Clone, Builder)]
pub struct UpstreamCredential {
    #[builder(into)]
    pub api_key: Secret,
    #[builder(into)]
    pub organization: Option<String>,
}

impl std::fmt::Debug for UpstreamCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamCredential")
            .field("api_key", &self.api_key)
            .field("organization", &self.organization)
            .finish()
    }
}

/// Where requests are forwarded, and with what credential.
#[derive(Debug, Clone)]
pub struct Upstream {
    /// Base origin; the inbound path is joined onto it, so it should end in `/`.
    pub base: Url,
    pub credential: UpstreamCredential,
}

impl Upstream {
    /// The absolute upstream URL for an inbound path-and-query.
    pub fn url_for(&self, path_and_query: &str) -> Result<Url, url::ParseError> {
        self.base
            .join(path_and_query.strip_prefix('/').unwrap_or(path_and_query))
    }
}

/// Derive the outbound request from the inbound request's parts and body.
///
/// The inbound parts are consumed, so the caller's bearer token cannot leak through a shared
/// header map.
pub fn outbound_request(
    mut parts: request::Parts,
    body: Body,
    upstream: &Upstream,
) -> Result<Request, GatewayError> {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|v| v.as_str())
        .unwrap_or(parts.uri.path());
    let upstream_url = upstream
        .url_for(path_and_query)
        .map_err(|e| GatewayError::InvalidRoute(format!("{path_and_query} ({e})")))?;
    let upstream_uri = Uri::try_from(upstream_url.as_str()).map_err(|e| {
        GatewayError::Upstream(format!("invalid upstream uri {upstream_url}: {e}"))
    })?;

    if let Some(host) = upstream_uri.host() {
        let host_value = match upstream_uri.port_u16() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let host_value = HeaderValue::try_from(host_value)
            .map_err(|e| GatewayError::Upstream(format!("invalid upstream host: {e}")))?;
        parts.headers.insert(header::HOST, host_value);
    }

    let credential = &upstream.credential;
    let mut authorization =
        HeaderValue::try_from(format!("Bearer {}", credential.api_key.expose()))
            .map_err(|_| GatewayError::Config)?;
    authorization.set_sensitive(true);
    parts.headers.insert(header::AUTHORIZATION, authorization);

    // The organization billed is the server's choice, never the caller's.
    match &credential.organization {
        Some(organization) => {
            let value =
                HeaderValue::try_from(organization.as_str()).map_err(|_| GatewayError::Config)?;
            parts.headers.insert(ORGANIZATION_HEADER, value);
        }
        None => {
            parts.headers.remove(ORGANIZATION_HEADER);
        }
    }

    parts.uri = upstream_uri;
    Ok(Request::from_parts(parts, body))
}

/// Send the outbound request and hand back the upstream response as received.
///
/// Upstream error statuses are responses like any other and are relayed unchanged; only a
/// failure to get a response at all becomes a [`GatewayError::Upstream`].
pub async fn forward<T: HttpClient>(client: &T, req: Request) -> Result<Response, GatewayError> {
    let uri = req.uri().clone();
    debug!(%uri, method = %req.method(), "Forwarding request");

    let response = client
        .request(req)
        .await
        .map_err(|e| GatewayError::Upstream(format!("{uri}: {e}")))?;

    info!(%uri, status = %response.status(), "Upstream responded");
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockHttpClient;
    use axum::http::{Method, StatusCode};

    fn upstream(organization: Option<&str>) -> Upstream {
        Upstream {
            base: DEFAULT_UPSTREAM.parse().unwrap(),
            credential: UpstreamCredential::builder()
                .api_key("sk-server")
                .maybe_organization(organization)
                .build(),
        }
    }

    fn inbound(uri: &str) -> (request::Parts, Body) {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("authorization", "Bearer caller-token")
            .header("content-type", "application/json")
            .header("x-custom", "kept")
            .body(Body::from("{}"))
            .unwrap()
            .into_parts()
    }

    #[test]
    fn test_authorization_is_replaced_and_other_headers_kept() {
        let (parts, body) = inbound("/v1/chat/completions");
        let req = outbound_request(parts, body, &upstream(None)).unwrap();

        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.uri(), "https://api.openai.com/v1/chat/completions");
        assert_eq!(req.headers()["authorization"], "Bearer sk-server");
        assert_eq!(req.headers().get_all("authorization").iter().count(), 1);
        assert_eq!(req.headers()["host"], "api.openai.com");
        assert_eq!(req.headers()["x-custom"], "kept");
        assert_eq!(req.headers()["content-type"], "application/json");
        assert!(req.headers().get(ORGANIZATION_HEADER).is_none());
    }

    #[test]
    fn test_organization_header_is_added_when_configured() {
        let (parts, body) = inbound("/v1/completions");
        let req = outbound_request(parts, body, &upstream(Some("org-42"))).unwrap();
        assert_eq!(req.headers()["openai-organization"], "org-42");
    }

    #[test]
    fn test_caller_organization_header_is_never_forwarded() {
        let caller_org = |uri: &str| {
            let (mut parts, body) = inbound(uri);
            parts.headers.insert(
                ORGANIZATION_HEADER,
                HeaderValue::from_static("org-caller"),
            );
            (parts, body)
        };

        let (parts, body) = caller_org("/v1/chat/completions");
        let req = outbound_request(parts, body, &upstream(None)).unwrap();
        assert!(req.headers().get(ORGANIZATION_HEADER).is_none());

        let (parts, body) = caller_org("/v1/chat/completions");
        let req = outbound_request(parts, body, &upstream(Some("org-42"))).unwrap();
        assert_eq!(req.headers().get_all(ORGANIZATION_HEADER).iter().count(), 1);
        assert_eq!(req.headers()[ORGANIZATION_HEADER], "org-42");
    }

    #[test]
    fn test_query_string_is_preserved() {
        let (parts, body) = inbound("/v1/audio/transcriptions?foo=bar&baz=1");
        let req = outbound_request(parts, body, &upstream(None)).unwrap();
        assert_eq!(
            req.uri(),
            "https://api.openai.com/v1/audio/transcriptions?foo=bar&baz=1"
        );
    }

    #[test]
    fn test_base_with_path_prefix_and_port() {
        let upstream = Upstream {
            base: "http://localhost:8080/proxy/".parse().unwrap(),
            ..upstream(None)
        };
        let (parts, body) = inbound("/v1/completions");
        let req = outbound_request(parts, body, &upstream).unwrap();
        assert_eq!(req.uri(), "http://localhost:8080/proxy/v1/completions");
        assert_eq!(req.headers()["host"], "localhost:8080");
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let rendered = format!("{:?}", upstream(Some("org-42")));
        assert!(!rendered.contains("sk-server"));
        assert!(rendered.contains("org-42"));
    }

    #[tokio::test]
    async fn test_upstream_error_statuses_are_relayed() {
        let client =
            MockHttpClient::new(StatusCode::TOO_MANY_REQUESTS, r#"{"error":"slow down"}"#);
        let (parts, body) = inbound("/v1/chat/completions");
        let req = outbound_request(parts, body, &upstream(None)).unwrap();

        let response = forward(&client, req).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(client.get_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_is_upstream_error() {
        let client = MockHttpClient::failing("connection refused");
        let (parts, body) = inbound("/v1/chat/completions");
        let req = outbound_request(parts, body, &upstream(None)).unwrap();

        let err = forward(&client, req).await.unwrap_err();
        assert!(
            matches!(err, GatewayError::Upstream(reason) if reason.contains("connection refused"))
        );
    }
}
