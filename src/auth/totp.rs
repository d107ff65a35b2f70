//! TOTP (RFC 6238) generation and verification.
//!
//! SHA-1, 6 digits, 30 second step, one step of skew either side.
//! Secrets are stored base32 encoded.

use chrono::{DateTime, Utc};
use totp_rs::{Algorithm, Secret, TOTP};

use crate::error::AppError;

const DIGITS: usize = 6;
const SKEW: u8 = 1;
const STEP_SECS: u64 = 30;

fn build(secret_b32: &str, issuer: &str, account: &str) -> Result<TOTP, AppError> {
    let secret_bytes = Secret::Encoded(secret_b32.to_string())
        .to_bytes()
        .map_err(|e| AppError::Internal(format!("TOTP secret decode: {e}")))?;

    TOTP::new(
        Algorithm::SHA1,
        DIGITS,
        SKEW,
        STEP_SECS,
        secret_bytes,
        Some(issuer.to_string()),
        account.to_string(),
    )
    .map_err(|e| AppError::Internal(format!("TOTP init: {e}")))
}

fn unix_secs(at: DateTime<Utc>) -> Result<u64, AppError> {
    u64::try_from(at.timestamp())
        .map_err(|_| AppError::Internal("clock is before the unix epoch".to_string()))
}

/// Verify a code at the given instant.
pub fn verify_code(
    secret_b32: &str,
    code: &str,
    at: DateTime<Utc>,
    issuer: &str,
    account: &str,
) -> Result<bool, AppError> {
    let code = code.trim();
    if code.len() != DIGITS || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(false);
    }

    let totp = build(secret_b32, issuer, account)?;
    Ok(totp.check(code, unix_secs(at)?))
}

/// Generate the code valid at the given instant.
pub fn generate_code(
    secret_b32: &str,
    at: DateTime<Utc>,
    issuer: &str,
    account: &str,
) -> Result<String, AppError> {
    let totp = build(secret_b32, issuer, account)?;
    Ok(totp.generate(unix_secs(at)?))
}
