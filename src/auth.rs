//! Short-lived bearer tokens for the registry channel.
//!
//! Every registry call carries a freshly issued HS256 JSON Web Token in the
//! `jwt` header. Tokens are signed with a shared secret obtained once from a
//! [`KeyProvider`] and expire one minute after issuance. Nothing is cached:
//! each outbound call gets a new token and each inbound call is verified
//! independently.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::warn;

use crate::error::AuthError;

/// Metadata key carrying the bearer token.
pub const TOKEN_HEADER: &str = "jwt";
/// Fixed `client` claim.
pub const CLIENT_ID: &str = "aero-client";
/// Token lifetime in seconds.
pub const TOKEN_TTL_SECS: u64 = 60;

const ALGORITHM: &str = "HS256";
const KEY_LEN: usize = 64;

type HmacSha256 = Hmac<Sha256>;

/// Source of the shared signing secret.
pub trait KeyProvider: Send + Sync {
    fn secret(&self) -> io::Result<Vec<u8>>;
}

/// Reads the secret from a file, generating and persisting a random one on
/// first use. The secret is the trimmed file content (base64 text).
pub struct FileKeyProvider {
    path: PathBuf,
}

impl FileKeyProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl KeyProvider for FileKeyProvider {
    fn secret(&self) -> io::Result<Vec<u8>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(content.trim().as_bytes().to_vec()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let mut raw = [0u8; KEY_LEN];
                rand::thread_rng().fill_bytes(&mut raw);
                let key = STANDARD.encode(raw);
                if let Some(parent) = self.path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                std::fs::write(&self.path, &key)?;
                Ok(key.into_bytes())
            }
            Err(e) => Err(e),
        }
    }
}

/// Fixed in-memory secret.
pub struct StaticKeyProvider(pub Vec<u8>);

impl KeyProvider for StaticKeyProvider {
    fn secret(&self) -> io::Result<Vec<u8>> {
        Ok(self.0.clone())
    }
}

#[derive(Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

#[derive(Serialize)]
struct Claims<'a> {
    authorized: bool,
    client: &'a str,
    exp: u64,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Issues and validates tokens for one shared secret.
#[derive(Clone)]
pub struct AuthGate {
    secret: Arc<[u8]>,
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate").finish_non_exhaustive()
    }
}

impl AuthGate {
    /// Load the secret once from `provider`.
    pub fn new(provider: &dyn KeyProvider) -> Result<Self, AuthError> {
        let secret = provider.secret().map_err(AuthError::Key)?;
        if secret.is_empty() {
            return Err(AuthError::Key(io::Error::new(
                io::ErrorKind::InvalidData,
                "empty secret",
            )));
        }
        Ok(Self {
            secret: secret.into(),
        })
    }

    /// Token expiring [`TOKEN_TTL_SECS`] from now.
    pub fn issue_token(&self) -> Result<String, AuthError> {
        self.issue_token_expiring_at(unix_now() + TOKEN_TTL_SECS)
    }

    pub(crate) fn issue_token_expiring_at(&self, exp: u64) -> Result<String, AuthError> {
        let header = serde_json::to_vec(&Header {
            alg: ALGORITHM.to_string(),
            typ: "JWT".to_string(),
        })?;
        let claims = serde_json::to_vec(&Claims {
            authorized: true,
            client: CLIENT_ID,
            exp,
        })?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header),
            URL_SAFE_NO_PAD.encode(claims)
        );
        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{signing_input}.{signature}"))
    }

    /// `true` only for a well-formed HS256 token signed with our secret whose
    /// `exp` lies in the future.
    pub fn validate_token(&self, token: &str) -> bool {
        self.check(token).is_some()
    }

    fn check(&self, token: &str) -> Option<()> {
        let mut parts = token.split('.');
        let (header_b64, claims_b64, sig_b64) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() {
            return None;
        }

        let header: Header = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(header_b64).ok()?).ok()?;
        if header.alg != ALGORITHM {
            return None;
        }

        let signature = URL_SAFE_NO_PAD.decode(sig_b64).ok()?;
        let mut mac = self.mac().ok()?;
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(claims_b64.as_bytes());
        mac.verify_slice(&signature).ok()?;

        let claims: Value = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(claims_b64).ok()?).ok()?;
        let exp = claims.get("exp")?.as_u64()?;
        (exp > unix_now()).then_some(())
    }

    fn mac(&self) -> Result<HmacSha256, AuthError> {
        HmacSha256::new_from_slice(&self.secret).map_err(|_| {
            AuthError::Key(io::Error::new(io::ErrorKind::InvalidInput, "invalid key length"))
        })
    }
}

/// Axum middleware guarding every registry route. The [`AuthGate`] is
/// injected as an extension.
///
/// # Error responses
///
/// - `401 Unauthorized`: `jwt` header missing (`UNAUTHENTICATED`)
/// - `403 Forbidden`: token present but invalid or expired (`PERMISSION_DENIED`)
/// - `500 Internal Server Error`: [`AuthGate`] extension not found
pub async fn require_token(request: Request, next: Next) -> Response {
    let Some(gate) = request.extensions().get::<AuthGate>().cloned() else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Server configuration error", "code": "INTERNAL"})),
        )
            .into_response();
    };

    let Some(raw) = request
        .headers()
        .get(TOKEN_HEADER)
        .filter(|v| !v.is_empty())
    else {
        warn!(path = %request.uri().path(), "rejected call: token empty");
        return error_response(&AuthError::Unauthenticated);
    };

    // A present but non-UTF-8 header is a bad token, not a missing one.
    if !raw.to_str().is_ok_and(|token| gate.validate_token(token)) {
        warn!(path = %request.uri().path(), "rejected call: invalid auth token");
        return error_response(&AuthError::PermissionDenied);
    }

    next.run(request).await
}

fn error_response(err: &AuthError) -> Response {
    let (status, code) = match err {
        AuthError::Unauthenticated => (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED"),
        AuthError::PermissionDenied => (StatusCode::FORBIDDEN, "PERMISSION_DENIED"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
    };
    (status, Json(json!({"error": err.to_string(), "code": code}))).into_response()
}
