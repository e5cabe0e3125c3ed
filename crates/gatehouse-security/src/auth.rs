use crate::jwt::{JwtCodec, JwtError};
use gatehouse_core::{GatewayError, SharedClock};
use http::HeaderMap;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use subtle::{Choice, ConstantTimeEq};
use tracing::{debug, warn};

/// Role required under `/admin` and `/system`.
pub const ADMIN_ROLE: &str = "admin";
/// Permission required under `/auth`.
pub const AUTH_ACCESS_PERMISSION: &str = "auth:access";
/// Subject assigned to callers authenticated by API key.
pub const API_KEY_SUBJECT: &str = "api-key";

/// Why a caller was turned away.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    /// Neither a bearer token nor an API key was presented.
    #[error("missing credentials")]
    MissingCredentials,

    /// The token is not a well-formed HS256 JWT.
    #[error("malformed token")]
    MalformedToken,

    /// Bad token signature or unknown API key.
    #[error("invalid credentials")]
    InvalidSignature,

    /// The token's `exp` is not in the future.
    #[error("token expired")]
    Expired,

    /// Authenticated, but lacking the role or permission the path needs.
    #[error("insufficient privilege: {0}")]
    InsufficientPrivilege(String),
}

impl From<AuthFailure> for GatewayError {
    fn from(failure: AuthFailure) -> Self {
        match failure {
            AuthFailure::InsufficientPrivilege(_) => GatewayError::Authorization(failure.to_string()),
            other => GatewayError::Authentication(other.to_string()),
        }
    }
}

/// Roles and permissions carried by a token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grants {
    /// Role names.
    #[serde(default, deserialize_with = "string_or_set")]
    pub roles: BTreeSet<String>,
    /// Permission names.
    #[serde(default, deserialize_with = "string_or_set")]
    pub permissions: BTreeSet<String>,
}

/// Wire shape of a token payload.
///
/// Plain JWTs carry `roles`/`permissions` at the top level. Session tokens
/// nest them under `claims` and use the session id as `jti`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPayload {
    /// Subject id.
    pub sub: String,
    /// Top-level roles.
    #[serde(default, deserialize_with = "string_or_set", skip_serializing_if = "BTreeSet::is_empty")]
    pub roles: BTreeSet<String>,
    /// Top-level permissions.
    #[serde(default, deserialize_with = "string_or_set", skip_serializing_if = "BTreeSet::is_empty")]
    pub permissions: BTreeSet<String>,
    /// Nested grants of a session token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claims: Option<Grants>,
    /// Issued-at, epoch seconds.
    #[serde(default)]
    pub iat: u64,
    /// Expiry, epoch seconds.
    pub exp: u64,
    /// Unique token id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

/// Verified caller identity.
///
/// Only ever produced after signature verification and an expiry check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthClaims {
    /// Subject id.
    pub sub: String,
    /// Role names.
    pub roles: BTreeSet<String>,
    /// Permission names.
    pub permissions: BTreeSet<String>,
    /// Expiry, epoch seconds.
    pub exp: u64,
    /// Issued-at, epoch seconds.
    pub iat: u64,
    /// Unique token id.
    pub jti: String,
    /// Set when the credential was a session token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl AuthClaims {
    /// Minimal service-level claims for an API-key caller: no roles, no expiry.
    pub fn service(now_secs: u64) -> Self {
        Self {
            sub: API_KEY_SUBJECT.to_string(),
            roles: BTreeSet::new(),
            permissions: BTreeSet::new(),
            exp: u64::MAX,
            iat: now_secs,
            jti: API_KEY_SUBJECT.to_string(),
            session_id: None,
        }
    }

    /// Whether the role is held.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Whether the permission is held.
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    /// The roles and permissions as a [`Grants`] value.
    pub fn grants(&self) -> Grants {
        Grants {
            roles: self.roles.clone(),
            permissions: self.permissions.clone(),
        }
    }
}

impl From<TokenPayload> for AuthClaims {
    fn from(payload: TokenPayload) -> Self {
        let mut roles = payload.roles;
        let mut permissions = payload.permissions;
        let session_id = match payload.claims {
            Some(grants) => {
                roles.extend(grants.roles);
                permissions.extend(grants.permissions);
                payload.jti.clone()
            }
            None => None,
        };
        Self {
            sub: payload.sub,
            roles,
            permissions,
            exp: payload.exp,
            iat: payload.iat,
            jti: payload.jti.unwrap_or_default(),
            session_id,
        }
    }
}

/// Accepts `"a,b"`, `"a b"`, `["a", "b"]` or null.
fn string_or_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        One(String),
        Many(Vec<String>),
    }

    let items: Vec<String> = match Option::<Raw>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(Raw::One(s)) => s
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(str::to_string)
            .collect(),
        Some(Raw::Many(v)) => v,
    };
    Ok(items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

/// Segment-aware prefix test: `/admin` matches `/admin` and `/admin/x`, not `/administer`.
fn under(path: &str, prefix: &str) -> bool {
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// Verifies bearer JWTs and API keys.
pub struct TokenAuthenticator {
    codec: JwtCodec,
    api_key_digests: Vec<[u8; 32]>,
    clock: SharedClock,
}

impl TokenAuthenticator {
    /// Create an authenticator for the JWT secret and the accepted API keys.
    pub fn new(secret: impl AsRef<[u8]>, api_keys: &[String], clock: SharedClock) -> Self {
        Self {
            codec: JwtCodec::new(secret),
            api_key_digests: api_keys.iter().map(|k| digest(k)).collect(),
            clock,
        }
    }

    /// Returns true if at least one API key is configured.
    pub fn api_keys_enabled(&self) -> bool {
        !self.api_key_digests.is_empty()
    }

    /// Authenticate from request headers.
    ///
    /// Checks `Authorization: Bearer <token>` first, then `X-API-Key`.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<AuthClaims, AuthFailure> {
        let bearer = headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split_once(' '))
            .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
            .map(|(_, token)| token.trim())
            .filter(|token| !token.is_empty());

        if let Some(token) = bearer {
            return self.verify_token(token);
        }

        let api_key = headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|k| !k.is_empty());

        match api_key {
            Some(key) => self.verify_api_key(key),
            None => {
                debug!("Rejected request: missing credentials");
                Err(AuthFailure::MissingCredentials)
            }
        }
    }

    /// Verify a compact JWT and its expiry.
    pub fn verify_token(&self, token: &str) -> Result<AuthClaims, AuthFailure> {
        let payload: TokenPayload = self.codec.decode(token).map_err(|e| {
            warn!(error = %e, "Rejected bearer token");
            match e {
                JwtError::InvalidSignature => AuthFailure::InvalidSignature,
                _ => AuthFailure::MalformedToken,
            }
        })?;

        if payload.exp <= self.clock.now_secs() {
            debug!(sub = %payload.sub, exp = payload.exp, "Rejected expired token");
            return Err(AuthFailure::Expired);
        }

        Ok(payload.into())
    }

    /// Check an API key against every configured key in constant time.
    pub fn verify_api_key(&self, key: &str) -> Result<AuthClaims, AuthFailure> {
        let presented = digest(key);
        let mut matched = Choice::from(0u8);
        for configured in &self.api_key_digests {
            matched |= configured[..].ct_eq(&presented[..]);
        }

        if bool::from(matched) {
            Ok(AuthClaims::service(self.clock.now_secs()))
        } else {
            warn!("Rejected request: invalid API key");
            Err(AuthFailure::InvalidSignature)
        }
    }

    /// Path-prefix policy: `/admin` and `/system` need role `admin`, `/auth`
    /// needs permission `auth:access`, everything else is open to any caller.
    pub fn authorize(claims: &AuthClaims, path: &str) -> Result<(), AuthFailure> {
        if (under(path, "/admin") || under(path, "/system")) && !claims.has_role(ADMIN_ROLE) {
            return Err(AuthFailure::InsufficientPrivilege(format!(
                "role '{ADMIN_ROLE}' required"
            )));
        }
        if under(path, "/auth") && !claims.has_permission(AUTH_ACCESS_PERMISSION) {
            return Err(AuthFailure::InsufficientPrivilege(format!(
                "permission '{AUTH_ACCESS_PERMISSION}' required"
            )));
        }
        Ok(())
    }

    /// Boolean form of [`TokenAuthenticator::authorize`].
    pub fn is_authorized(claims: &AuthClaims, path: &str) -> bool {
        Self::authorize(claims, path).is_ok()
    }

    /// The codec, for components that mint tokens under the same secret.
    pub fn codec(&self) -> &JwtCodec {
        &self.codec
    }
}
