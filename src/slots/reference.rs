//! Signed, time-boxed references to staged transfer requests.
//!
//! Format: `base64url(json{request_id, expires_at}) "." hex(hmac_sha256(payload))`.

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("reference is malformed")]
    Malformed,
    #[error("reference signature does not match")]
    BadSignature,
}

/// Claims carried by a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceClaims {
    pub request_id: Uuid,
    /// Unix seconds
    pub expires_at: i64,
}

impl ReferenceClaims {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.expires_at, 0).single()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at()
            .is_none_or(|expires_at| now >= expires_at)
    }
}

#[derive(Clone)]
pub struct TransferReferenceSigner {
    key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for TransferReferenceSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferReferenceSigner").finish_non_exhaustive()
    }
}

impl TransferReferenceSigner {
    pub fn new(key: Vec<u8>) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    fn mac(&self) -> Result<HmacSha256, ReferenceError> {
        // HMAC accepts keys of any length
        HmacSha256::new_from_slice(&self.key).map_err(|_| ReferenceError::Malformed)
    }

    pub fn sign(&self, request_id: Uuid, expires_at: DateTime<Utc>) -> Result<String, ReferenceError> {
        let claims = ReferenceClaims {
            request_id,
            expires_at: expires_at.timestamp(),
        };
        let json = serde_json::to_vec(&claims).map_err(|_| ReferenceError::Malformed)?;
        let payload = base64_url::encode(&json);

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(format!("{payload}.{signature}"))
    }

    /// Checks the signature and decodes the claims. Expiry is left to the caller.
    pub fn verify(&self, reference: &str) -> Result<ReferenceClaims, ReferenceError> {
        let (payload, signature_hex) = reference
            .trim()
            .split_once('.')
            .ok_or(ReferenceError::Malformed)?;

        let provided = hex::decode(signature_hex).map_err(|_| ReferenceError::Malformed)?;

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let expected = mac.finalize().into_bytes();

        let expected: &[u8] = expected.as_ref();
        if !bool::from(subtle::ConstantTimeEq::ct_eq(expected, &provided[..])) {
            return Err(ReferenceError::BadSignature);
        }

        let json = base64_url::decode(payload).map_err(|_| ReferenceError::Malformed)?;
        serde_json::from_slice(&json).map_err(|_| ReferenceError::Malformed)
    }
}
