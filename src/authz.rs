//! Scope checks applied to verified claims.
//!
//! A token may narrow what it grants: `p` lists the route paths it may call and `m` names the one
//! model it may request. Omitting either claim leaves that dimension unrestricted.
use crate::auth::VerifiedClaims;
use crate::errors::GatewayError;
use crate::routes::Route;
use tracing::debug;

/// Permission to use one route, pending the model check once the body is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant<'a> {
    pub subject: &'a str,
    pub route: Route,
    permitted_model: Option<&'a str>,
}

/// Decide whether `claims` may call `route`.
pub fn authorize(claims: &VerifiedClaims, route: Route) -> Result<Grant<'_>, GatewayError> {
    if let Some(routes) = &claims.permitted_routes
        && !routes.iter().any(|p| p == route.path())
    {
        debug!(subject = %claims.subject, %route, "Route outside token scope");
        return Err(GatewayError::ScopeViolation(format!(
            "Token is not permitted to use {route}"
        )));
    }

    Ok(Grant {
        subject: &claims.subject,
        route,
        permitted_model: claims.permitted_model.as_deref(),
    })
}

impl Grant<'_> {
    /// Check the model a validated body asks for.
    ///
    /// `None` means the body carries no inspectable model (passthrough routes), which is allowed.
    pub fn admit_model(&self, model: Option<&str>) -> Result<(), GatewayError> {
        match (self.permitted_model, model) {
            (Some(permitted), Some(requested)) if permitted != requested => {
                debug!(subject = %self.subject, requested, permitted, "Model outside token scope");
                Err(GatewayError::ScopeViolation(format!(
                    "Token is not permitted to use model {requested}"
                )))
            }
            _ => Ok(()),
        }
    }
}
