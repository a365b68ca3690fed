use async_trait::async_trait;
use axum::{
    Json,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Header carrying the caller's API key.
pub const API_KEY_HEADER: &str = "apikey";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    Private,
    Public,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Private => "private",
            AccessLevel::Public => "public",
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthRejection {
    #[error("missing api key")]
    Missing,
    #[error("invalid or inactive api key")]
    Invalid,
    #[error("api key lookup failed: {0}")]
    Lookup(String),
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        // Callers never learn which check failed.
        (
            StatusCode::FORBIDDEN,
            Json(json!({ "status_code": 403, "message": "Invalid API key." })),
        )
            .into_response()
    }
}

/// Hook run before a protected request is forwarded.
#[async_trait]
pub trait ApiKeyVerifier: Send + Sync {
    async fn verify(&self, headers: &HeaderMap) -> Result<(), AuthRejection>;
}

/// Extracts the trimmed, non-empty API key header.
pub fn api_key_from_headers(headers: &HeaderMap) -> Result<&str, AuthRejection> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or(AuthRejection::Missing)
}

/// Keys are stored as base64 SHA-256 digests, never in clear text.
pub fn digest_api_key(secret: &str) -> String {
    STANDARD.encode(Sha256::digest(secret.as_bytes()))
}
