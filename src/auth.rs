//! Signed access tokens.
//!
//! The same verifier backs the request API (bearer header) and the realtime
//! channel (`token` query parameter), so a WebSocket session always resolves
//! to the same user identity as the HTTP surface.
//!
//! Token format: `base64url(payload_json) "." hex(hmac_sha256(payload))`.
//! The payload carries the subject user id and an expiry timestamp. The MAC
//! check uses `Mac::verify_slice`, which compares in constant time.

use anyhow::Result;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::config::AuthConfig;
use crate::error::DomainError;
use crate::models::now_ms;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    /// Subject user id.
    sub: i64,
    /// Expiry, unix milliseconds.
    exp: i64,
}

/// Mint a token for `user_id`, valid for `auth.token_ttl_secs`.
pub fn mint_token(auth: &AuthConfig, user_id: i64) -> Result<String> {
    let claims = TokenClaims {
        sub: user_id,
        exp: now_ms() + auth.token_ttl_secs * 1000,
    };
    let payload = serde_json::to_vec(&claims)?;
    let encoded = URL_SAFE_NO_PAD.encode(&payload);
    let sig = hex_hmac_sha256(auth.secret.as_bytes(), encoded.as_bytes());
    Ok(format!("{}.{}", encoded, sig))
}

/// Verify a token and return the user id it was minted for.
///
/// Fails with `Unauthenticated` on any defect: bad shape, bad signature,
/// unparsable payload, or expiry in the past.
pub fn verify_token(auth: &AuthConfig, token: &str) -> crate::error::Result<i64> {
    let (encoded, sig_hex) = token
        .split_once('.')
        .ok_or_else(|| DomainError::Unauthenticated("malformed token".into()))?;

    let sig = hex::decode(sig_hex)
        .map_err(|_| DomainError::Unauthenticated("malformed token signature".into()))?;

    let mut mac = HmacSha256::new_from_slice(auth.secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(encoded.as_bytes());
    mac.verify_slice(&sig)
        .map_err(|_| DomainError::Unauthenticated("invalid token signature".into()))?;

    let payload = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| DomainError::Unauthenticated("malformed token payload".into()))?;
    let claims: TokenClaims = serde_json::from_slice(&payload)
        .map_err(|_| DomainError::Unauthenticated("malformed token claims".into()))?;

    if claims.exp < now_ms() {
        return Err(DomainError::Unauthenticated("token expired".into()));
    }

    Ok(claims.sub)
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_auth() -> AuthConfig {
        AuthConfig {
            secret: "test-secret".to_string(),
            token_ttl_secs: 60,
        }
    }

    #[test]
    fn test_mint_verify_roundtrip() {
        let auth = test_auth();
        let token = mint_token(&auth, 42).unwrap();
        assert_eq!(verify_token(&auth, &token).unwrap(), 42);
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let auth = test_auth();
        let token = mint_token(&auth, 42).unwrap();
        let (payload, sig) = token.split_once('.').unwrap();
        let forged_claims = serde_json::json!({ "sub": 7, "exp": i64::MAX });
        let forged = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(forged_claims.to_string()),
            sig
        );
        assert!(verify_token(&auth, &forged).is_err());
        // Original payload with a truncated signature also fails.
        let truncated = format!("{}.{}", payload, &sig[..sig.len() - 2]);
        assert!(verify_token(&auth, &truncated).is_err());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let auth = test_auth();
        let token = mint_token(&auth, 42).unwrap();
        let other = AuthConfig {
            secret: "other-secret".to_string(),
            token_ttl_secs: 60,
        };
        assert!(verify_token(&other, &token).is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let auth = AuthConfig {
            secret: "test-secret".to_string(),
            token_ttl_secs: -1,
        };
        let token = mint_token(&auth, 42).unwrap();
        assert!(verify_token(&auth, &token).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        let auth = test_auth();
        assert!(verify_token(&auth, "").is_err());
        assert!(verify_token(&auth, "no-dot-here").is_err());
        assert!(verify_token(&auth, "a.b").is_err());
    }
}
