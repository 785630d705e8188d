//! Configuration parsing and validation for the gateway
//!
//! Every option can be given as a flag or an environment variable. The upstream credential and
//! token signing secret are resolved once here into [`GatewaySecrets`]; if either is missing the
//! gateway still starts but refuses every request.
use crate::auth::{Secret, TokenVerifier};
use crate::client::PoolConfig;
use crate::upstream::{DEFAULT_UPSTREAM, Upstream, UpstreamCredential};
use anyhow::anyhow;
use clap::Parser;
use std::time::Duration;
use tracing::warn;
use url::Url;

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The port on which the gateway will listen.
    #[arg(short = 'p', long, default_value_t = 3000)]
    pub port: u16,

    /// The upstream API origin requests are forwarded to.
    #[arg(long, env = "UPSTREAM_URL", default_value = DEFAULT_UPSTREAM)]
    pub upstream_url: Url,

    /// API key substituted for the caller's credential on every forwarded request.
    #[arg(long, env = "OPENAI_TOKEN", hide_env_values = true)]
    pub openai_token: Option<Secret>,

    /// Shared secret used to verify caller tokens (HS256).
    #[arg(long, env = "SHARED_JWT_SECRET", hide_env_values = true)]
    pub shared_jwt_secret: Option<Secret>,

    /// Organization id sent upstream in the `OpenAI-Organization` header.
    #[arg(long, env = "OPENAI_ORGANIZATION")]
    pub openai_organization: Option<String>,

    /// Largest JSON request body, in bytes, the gateway will buffer for validation.
    #[arg(long, env = "MAX_BODY_BYTES", default_value_t = crate::DEFAULT_MAX_BODY_BYTES)]
    pub max_body_bytes: usize,

    /// The port on which the metrics server will listen.
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, default_value_t = true)]
    pub metrics: bool,

    /// The prefix to use for metrics.
    #[arg(long, default_value = "relaygate")]
    pub metrics_prefix: String,

    /// Maximum number of idle HTTP connections to keep alive to the upstream.
    #[arg(long, default_value_t = 100)]
    pub pool_max_idle_per_host: usize,

    /// How long (in seconds) to keep idle HTTP connections alive.
    #[arg(long, default_value_t = 90)]
    pub pool_idle_timeout_secs: u64,
}

/// Process-lifetime secrets, shared read-only by every request.
#[derive(Debug)]
pub struct GatewaySecrets {
    pub verifier: TokenVerifier,
    pub upstream: Upstream,
}

impl Config {
    pub fn validate(mut self) -> Result<Self, anyhow::Error> {
        if !matches!(self.upstream_url.scheme(), "http" | "https") {
            return Err(anyhow!(
                "Upstream URL '{}' must be http or https",
                self.upstream_url
            ));
        }
        // Paths are joined onto the base, which replaces its last segment unless it ends in '/'.
        if !self.upstream_url.path().ends_with('/') {
            let path = format!("{}/", self.upstream_url.path());
            self.upstream_url.set_path(&path);
        }
        if self.max_body_bytes == 0 {
            return Err(anyhow!("--max-body-bytes must be greater than zero"));
        }
        Ok(self)
    }

    pub fn pool(&self) -> PoolConfig {
        PoolConfig {
            max_idle_per_host: self.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
        }
    }

    /// Resolve the secrets, or `None` if the credential or signing secret is missing or empty.
    pub fn secrets(&self) -> Option<GatewaySecrets> {
        let present = |s: &Option<Secret>| s.clone().filter(|s| !s.is_empty());

        let (Some(api_key), Some(signing_secret)) = (
            present(&self.openai_token),
            present(&self.shared_jwt_secret),
        ) else {
            warn!(
                "OPENAI_TOKEN and SHARED_JWT_SECRET must both be set; every request will be rejected"
            );
            return None;
        };

        Some(GatewaySecrets {
            verifier: TokenVerifier::new(&signing_secret),
            upstream: Upstream {
                base: self.upstream_url.clone(),
                credential: UpstreamCredential::builder()
                    .api_key(api_key)
                    .maybe_organization(
                        self.openai_organization
                            .clone()
                            .filter(|org| !org.is_empty()),
                    )
                    .build(),
            },
        })
    }
}
