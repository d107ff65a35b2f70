//! Opaque bearer token generation and hashing

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

/// Random bytes per token (256 bits)
pub const TOKEN_BYTES: usize = 32;

/// Opaque token generator
pub struct TokenGenerator;

impl TokenGenerator {
    /// Generate a new opaque token
    /// Format: 43 chars of unpadded url-safe base64
    pub fn generate() -> String {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Hash a token for storage and cache keys using SHA-256
    pub fn hash(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Short, log-safe identifier derived from the token hash
    pub fn fingerprint(token_hash: &str) -> &str {
        token_hash.get(..12).unwrap_or(token_hash)
    }
}
