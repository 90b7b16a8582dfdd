//! Connection authentication.
//!
//! Runs against the upgrade request headers before any audio processing.
//! Three ways in: a device-id allowlist bypass, a static bearer-token
//! table, or a signed token verified against the configured secret.

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use tracing::warn;

use voxbridge_core::config::AuthConfig;

/// The gateway closes the socket on any variant.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthError {
    MissingToken,
    InvalidToken,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingToken => write!(f, "missing or invalid Authorization header"),
            Self::InvalidToken => write!(f, "invalid token"),
        }
    }
}

impl std::error::Error for AuthError {}

/// The authenticated identity a session runs under.
#[derive(Debug, Clone)]
pub struct Principal {
    pub name: String,
    pub device_id: String,
}

pub struct AuthGate {
    enabled: bool,
    tokens: HashMap<String, String>,
    allowed_devices: HashSet<String>,
    signing_secret: Option<String>,
}

impl AuthGate {
    pub fn from_config(cfg: &AuthConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            tokens: cfg
                .tokens
                .iter()
                .map(|t| (t.token.clone(), t.name.clone()))
                .collect(),
            allowed_devices: cfg.allowed_devices.iter().cloned().collect(),
            signing_secret: cfg.resolve_signing_secret(),
        }
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthError> {
        let device_id = headers
            .get("device-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if !self.enabled {
            return Ok(Principal {
                name: "anonymous".into(),
                device_id,
            });
        }

        if !device_id.is_empty() && self.allowed_devices.contains(&device_id) {
            return Ok(Principal {
                name: format!("device:{device_id}"),
                device_id,
            });
        }

        let auth_header = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let Some(token) = auth_header.strip_prefix("Bearer ") else {
            return Err(AuthError::MissingToken);
        };

        if let Some(name) = self.tokens.get(token) {
            return Ok(Principal {
                name: name.clone(),
                device_id,
            });
        }

        if let Some(secret) = &self.signing_secret {
            match verify_signed_token(token, secret, unix_now()) {
                Ok(token_device) => {
                    let device_id = if device_id.is_empty() {
                        token_device
                    } else {
                        device_id
                    };
                    return Ok(Principal {
                        name: format!("signed:{device_id}"),
                        device_id,
                    });
                }
                Err(e) => warn!(error = %e, "Signed-token verification failed"),
            }
        }

        Err(AuthError::InvalidToken)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Issue a signed token: `<device_id>.<expiry_unix>.<hex sig>`.
pub fn sign_token(device_id: &str, expiry_unix: u64, secret: &str) -> String {
    let sig = signature(device_id, expiry_unix, secret);
    format!("{device_id}.{expiry_unix}.{sig}")
}

fn signature(device_id: &str, expiry_unix: u64, secret: &str) -> String {
    format!(
        "{:x}",
        Sha256::digest(format!("{device_id}.{expiry_unix}.{secret}").as_bytes())
    )
}

/// Verify a signed token; returns the embedded device id.
fn verify_signed_token(token: &str, secret: &str, now_unix: u64) -> anyhow::Result<String> {
    let mut parts = token.rsplitn(3, '.');
    let sig = parts.next().ok_or_else(|| anyhow::anyhow!("malformed token"))?;
    let expiry: u64 = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("malformed token"))?
        .parse()
        .map_err(|_| anyhow::anyhow!("malformed expiry"))?;
    let device_id = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("malformed token"))?;

    if expiry < now_unix {
        anyhow::bail!("token expired");
    }
    if !constant_time_eq(sig, &signature(device_id, expiry, secret)) {
        anyhow::bail!("signature mismatch");
    }
    Ok(device_id.to_string())
}
