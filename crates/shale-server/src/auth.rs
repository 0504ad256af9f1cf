//! Bearer-token authentication.
//!
//! Login exchanges credentials for an HS256 JWT carrying only the
//! customer number, signed with a random per-process secret generated at
//! server construction. Every authenticated endpoint extracts
//! [`Claims`] from the `Authorization` header; a missing or malformed
//! token, a wrong signing algorithm, or an absent claim is a 401.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::routes::AppState;

/// Claims carried by the bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "CustomerNumber")]
    pub customer_number: u64,
}

/// Sign a token for the customer.
pub fn issue_token(secret: &[u8], customer_number: u64) -> Result<String, ApiError> {
    let claims = Claims { customer_number };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret),
    )
    .map_err(|e| ApiError::Internal(format!("token signing failed: {e}")))
}

/// Verify a token and recover its claims.
pub fn verify_token(secret: &[u8], token: &str) -> Result<Claims, ApiError> {
    let mut validation = Validation::new(Algorithm::HS256);
    // the token carries only the customer number
    validation.required_spec_claims.clear();
    validation.validate_exp = false;
    decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)
        .map(|data| data.claims)
        .map_err(|e| {
            tracing::info!(error = %e, "bearer token rejected");
            ApiError::InvalidToken
        })
}

impl FromRequestParts<Arc<AppState>> for Claims {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::MissingToken)?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or(ApiError::MissingToken)?;
        verify_token(&state.hmac_secret, token)
    }
}

/// Login request body, accepted as form fields or JSON.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(rename = "User")]
    pub user: String,
    #[serde(rename = "Pass")]
    pub pass: String,
}

/// Login response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    #[serde(rename = "LoginStatus")]
    pub login_status: bool,
    #[serde(rename = "Reason", default)]
    pub reason: String,
    #[serde(rename = "JWT", default)]
    pub jwt: String,
}
