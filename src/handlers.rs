//! Axum handler for the gateway
use crate::AppState;
use crate::authz::authorize;
use crate::client::HttpClient;
use crate::errors::GatewayError;
use crate::routes::{BodyKind, Route};
use crate::schema;
use crate::upstream::{forward, outbound_request};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use tracing::{Span, debug, info, instrument};

/// Run a request through the gate and, if every check passes, forward it upstream.
///
/// Checks run strictly in order and the first failure ends the request: configuration, route
/// allowlist, token, route scope, body schema, model scope. Nothing is sent upstream unless all of
/// them pass.
#[instrument(
    skip(state, req),
    fields(method = %req.method(), path = %req.uri().path(), subject)
)]
pub async fn gateway_handler<T: HttpClient + Clone + Send + Sync + 'static>(
    State(state): State<AppState<T>>,
    req: Request,
) -> Result<Response, GatewayError> {
    let secrets = state.secrets.as_deref().ok_or(GatewayError::Config)?;

    let route = Route::from_path(req.uri().path())
        .ok_or_else(|| GatewayError::InvalidRoute(req.uri().path().to_string()))?;

    let token = crate::auth::bearer_token(req.headers())?;
    let claims = secrets.verifier.verify(token)?;
    Span::current().record("subject", claims.subject.as_str());

    let grant = authorize(&claims, route)?;

    let (parts, body) = req.into_parts();
    let body = match route.body_kind() {
        BodyKind::Json => {
            // Read once into shared bytes: one view is validated, the same bytes go upstream.
            let bytes = axum::body::to_bytes(body, state.max_body_bytes)
                .await
                .map_err(|e| GatewayError::InvalidBody(e.to_string()))?;
            debug!("Received request body of size: {}", bytes.len());

            let validated = schema::validate(route, &bytes)?;
            grant.admit_model(validated.model.as_deref())?;
            Body::from(bytes)
        }
        BodyKind::Passthrough => body,
    };

    info!(%route, "Request authorised, forwarding");
    let outbound = outbound_request(parts, body, &secrets.upstream)?;
    forward(&state.http_client, outbound).await
}
