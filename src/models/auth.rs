//! Token grant and revocation models

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::session::SessionKind;
use crate::error::AppError;

/// Password grant
#[derive(Debug, Clone, Deserialize)]
pub struct PasswordGrant {
    pub username: String,
    pub password: String,
    pub tenant_id: String,
}

/// Refresh token grant
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshGrant {
    pub refresh_token: String,
}

/// MFA completion grant
#[derive(Debug, Clone, Deserialize)]
pub struct MfaGrant {
    pub challenge_token: String,
    pub code: String,
}

/// A `/oauth/token` request, discriminated by `grant_type`
#[derive(Debug, Clone)]
pub enum GrantRequest {
    Password(PasswordGrant),
    RefreshToken(RefreshGrant),
    Mfa(MfaGrant),
}

impl GrantRequest {
    /// Parse a raw JSON body.
    ///
    /// An unknown or missing `grant_type` is `InvalidGrant`; a known type with bad fields is `BadRequest`.
    pub fn parse(body: serde_json::Value) -> Result<Self, AppError> {
        let grant_type = body
            .get("grant_type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::InvalidGrant("grant_type is required".to_string()))?
            .to_string();

        match grant_type.as_str() {
            "password" => Ok(GrantRequest::Password(fields(body)?)),
            "refresh_token" => Ok(GrantRequest::RefreshToken(fields(body)?)),
            "mfa" => Ok(GrantRequest::Mfa(fields(body)?)),
            other => Err(AppError::InvalidGrant(format!(
                "unsupported grant_type: {}",
                other
            ))),
        }
    }

    pub fn grant_type(&self) -> &'static str {
        match self {
            GrantRequest::Password(_) => "password",
            GrantRequest::RefreshToken(_) => "refresh_token",
            GrantRequest::Mfa(_) => "mfa",
        }
    }
}

fn fields<T: DeserializeOwned>(body: serde_json::Value) -> Result<T, AppError> {
    serde_json::from_value(body).map_err(|e| AppError::BadRequest(e.to_string()))
}

/// Issued credential pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    pub refresh_token: String,
    pub refresh_expires_in: u64,
}

/// Step-up response for MFA-enabled users
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MfaRequiredResponse {
    pub mfa_required: bool,
    pub challenge_token: String,
    pub expires_in: u64,
}

/// Outcome of a successful grant
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum GrantOutcome {
    Tokens(TokenResponse),
    MfaRequired(MfaRequiredResponse),
}

/// Revocation request (RFC 7009 shape)
#[derive(Debug, Clone, Deserialize)]
pub struct RevokeRequest {
    pub token: String,
    pub token_type_hint: Option<String>,
}

impl RevokeRequest {
    pub fn hint(&self) -> Option<SessionKind> {
        match self.token_type_hint.as_deref() {
            Some("access_token") => Some(SessionKind::Access),
            Some("refresh_token") => Some(SessionKind::Refresh),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeResponse {
    pub revoked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoutAllResponse {
    pub revoked_sessions: u64,
}

/// Caller network metadata recorded on sessions and audit entries
#[derive(Debug, Clone, Default)]
pub struct ClientContext {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}
