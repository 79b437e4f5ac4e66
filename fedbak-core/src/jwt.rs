use crate::error::{BakError, Result};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// A block capability expires five minutes after issuance; the
/// replica owner requests a fresh one per transfer.
pub const BLOCK_TOKEN_TTL_SECS: u64 = 300;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// Hostname of the node the token was issued for.
    sub: String,
    iat: u64,
    exp: u64,
}

/// Issues and validates the short-lived bearer tokens that gate the
/// backup transfer endpoints. The signing secret is generated at
/// startup and never leaves the process, so a restart invalidates all
/// outstanding tokens.
pub struct TokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl TokenIssuer {
    pub fn new() -> Self {
        let mut secret = [0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        Self {
            encoding_key: EncodingKey::from_secret(&secret),
            decoding_key: DecodingKey::from_secret(&secret),
        }
    }

    pub fn issue(&self, hostname: &str) -> Result<String> {
        let now = now_secs();
        let claims = Claims {
            sub: hostname.to_string(),
            iat: now,
            exp: now + BLOCK_TOKEN_TTL_SECS,
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|err| BakError::Unauthorized(format!("could not sign token: {err}")))
    }

    #[cfg(test)]
    fn issue_expired(&self, hostname: &str) -> Result<String> {
        let now = now_secs();
        let claims = Claims {
            sub: hostname.to_string(),
            iat: now - 7200,
            exp: now - 3600,
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|err| BakError::Unauthorized(format!("could not sign token: {err}")))
    }

    /// Checks the signature and expiry and returns the hostname the
    /// token was issued for.
    pub fn validate(&self, token: &str) -> Result<String> {
        let data = decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map_err(|err| BakError::Unauthorized(format!("invalid token: {err}")))?;
        Ok(data.claims.sub)
    }
}

impl Default for TokenIssuer {
    fn default() -> Self {
        Self::new()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
