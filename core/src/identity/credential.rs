// Bearer credentials: signed, expiring subject claims
//
// Wire form:  hex(claims_json) "." hex(mac)
//   claims_json = {"sub": <user id>, "exp": <unix seconds>}
//   mac         = Blake3 keyed hash of the claims bytes
//
// The MAC key is derived from the relay's configured secret with
// Blake3::derive_key, so operators can use any secret string.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// KDF context for the credential MAC key.
/// Changing this invalidates every outstanding credential.
const KDF_CONTEXT: &str = "driftguard relay bearer credential v1";

/// Thirty days, same lifetime as the login service hands out
pub const DEFAULT_CREDENTIAL_TTL_SECS: u64 = 30 * 24 * 3600;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("Credential is not in <claims>.<mac> form")]
    Malformed,
    #[error("Credential signature mismatch")]
    BadSignature,
    #[error("Credential expired")]
    Expired,
}

/// Claims carried inside a credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the user id the credential was issued to
    pub sub: String,
    /// Expiry as Unix seconds
    pub exp: u64,
}

fn mac_key(secret: &str) -> [u8; 32] {
    blake3::derive_key(KDF_CONTEXT, secret.as_bytes())
}

pub(crate) fn unix_now() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

/// Issue a credential for `subject` valid for `ttl_secs` from now
pub fn issue_credential(secret: &str, subject: &str, ttl_secs: u64) -> String {
    let claims = Claims {
        sub: subject.to_string(),
        exp: unix_now().saturating_add(ttl_secs),
    };
    encode(secret, &claims)
}

pub(crate) fn encode(secret: &str, claims: &Claims) -> String {
    // Claims is two plain fields; serializing it cannot fail
    let payload = serde_json::to_vec(claims).unwrap_or_default();
    let mac = blake3::keyed_hash(&mac_key(secret), &payload);
    format!("{}.{}", hex::encode(&payload), mac.to_hex())
}

/// Check signature and expiry, returning the claims
pub(crate) fn decode(secret: &str, credential: &str, now: u64) -> Result<Claims, CredentialError> {
    let (payload_hex, mac_hex) = credential
        .trim()
        .split_once('.')
        .ok_or(CredentialError::Malformed)?;

    let payload = hex::decode(payload_hex).map_err(|_| CredentialError::Malformed)?;
    let presented = blake3::Hash::from_hex(mac_hex).map_err(|_| CredentialError::Malformed)?;

    // blake3::Hash equality is constant-time
    if blake3::keyed_hash(&mac_key(secret), &payload) != presented {
        return Err(CredentialError::BadSignature);
    }

    let claims: Claims = serde_json::from_slice(&payload).map_err(|_| CredentialError::Malformed)?;
    if claims.exp <= now {
        return Err(CredentialError::Expired);
    }
    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    #[test]
    fn test_issue_then_decode() {
        let credential = issue_credential(SECRET, "user-1", 60);
        let claims = decode(SECRET, &credential, unix_now()).unwrap();
        assert_eq!(claims.sub, "user-1");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let credential = issue_credential(SECRET, "user-1", 60);
        assert_eq!(
            decode("other-secret", &credential, unix_now()),
            Err(CredentialError::BadSignature)
        );
    }

    #[test]
    fn test_expired_rejected() {
        let claims = Claims {
            sub: "user-1".to_string(),
            exp: 1_000,
        };
        let credential = encode(SECRET, &claims);
        assert_eq!(decode(SECRET, &credential, 1_000), Err(CredentialError::Expired));
        assert!(decode(SECRET, &credential, 999).is_ok());
    }

    #[test]
    fn test_tampered_claims_rejected() {
        let credential = issue_credential(SECRET, "user-1", 60);
        let (_, mac) = credential.split_once('.').unwrap();
        let forged_claims = Claims {
            sub: "admin".to_string(),
            exp: u64::MAX,
        };
        let forged = format!(
            "{}.{}",
            hex::encode(serde_json::to_vec(&forged_claims).unwrap()),
            mac
        );
        assert_eq!(decode(SECRET, &forged, unix_now()), Err(CredentialError::BadSignature));
    }

    #[test]
    fn test_garbage_is_malformed() {
        for input in ["", "abc", "zz.zz", "abcd.1234", "."] {
            assert_eq!(
                decode(SECRET, input, unix_now()),
                Err(CredentialError::Malformed),
                "input {:?}",
                input
            );
        }
    }
}
