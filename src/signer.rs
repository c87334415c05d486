//! Grant Signer: HS256 tokens binding a content id to a user, embedded in a gateway URL.
//!
//! Stateless apart from the key. The download-serving side verifies the token with the same
//! secret and never calls back into the listener.
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Public IPFS gateway the URLs point at unless configured otherwise.
pub const DEFAULT_GATEWAY: &str = "https://gateway.lighthouse.storage/ipfs";

/// Lifetime of a signed URL.
pub const DEFAULT_GRANT_TTL: Duration = Duration::from_secs(30 * 60);

/// Claims carried in the `token` query parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadClaims {
    /// Content id, scheme prefix already stripped.
    pub cid: String,
    /// Lowercase user address.
    pub user: String,
    /// Signing time, milliseconds since the epoch.
    pub ts: i64,
    /// Issued-at, seconds since the epoch.
    pub iat: i64,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
}

/// Produces signed, expiring download URLs.
#[derive(Clone)]
pub struct GrantSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    gateway: String,
    ttl: Duration,
}

impl std::fmt::Debug for GrantSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrantSigner")
            .field("gateway", &self.gateway)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl GrantSigner {
    /// Signer keyed by `secret`. An empty secret is a configuration error.
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.is_empty() {
            bail!("download signing secret is empty");
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            gateway: DEFAULT_GATEWAY.to_string(),
            ttl: DEFAULT_GRANT_TTL,
        })
    }

    /// Point URLs at another gateway base (trailing slash optional).
    pub fn with_gateway(mut self, gateway: impl Into<String>) -> Self {
        self.gateway = gateway.into().trim_end_matches('/').to_string();
        self
    }

    /// Override the token lifetime.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sign a download URL for `content_id` bound to `user`, valid from `now` for the TTL.
    pub fn sign_url(
        &self,
        content_id: &str,
        user: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<String> {
        let cid = strip_scheme(content_id);
        let iat = now.timestamp();
        let exp = i64::try_from(self.ttl.as_secs())
            .ok()
            .and_then(|ttl| iat.checked_add(ttl))
            .with_context(|| format!("grant TTL {:?} overflows token expiry", self.ttl))?;
        let claims = DownloadClaims {
            cid: cid.to_string(),
            user: user.to_ascii_lowercase(),
            ts: now.timestamp_millis(),
            iat,
            exp,
        };
        let token = encode(&Header::default(), &claims, &self.encoding)
            .context("sign download token")?;
        Ok(format!("{}/{}?token={}", self.gateway, cid, token))
    }

    /// Decode and validate a token produced by [`GrantSigner::sign_url`], including expiry.
    pub fn verify(&self, token: &str) -> anyhow::Result<DownloadClaims> {
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<DownloadClaims>(token, &self.decoding, &validation)
            .context("verify download token")?;
        Ok(data.claims)
    }
}

/// Drop a `scheme://` prefix such as `ipfs://` from a content id.
pub fn strip_scheme(content_id: &str) -> &str {
    match content_id.split_once("://") {
        Some((_, rest)) => rest,
        None => content_id,
    }
}

/// Pull the `token` query parameter back out of a signed URL.
pub fn token_from_url(url: &str) -> Option<&str> {
    url.split_once("?token=").map(|(_, t)| t)
}
