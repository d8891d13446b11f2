use crate::error::{AppError, Result};
use hmac::{Hmac, Mac};
use sha2::Sha512;

type HmacSha512 = Hmac<Sha512>;

/// Header carrying the hex HMAC-SHA512 of the raw request body.
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Checks provider signatures over the exact bytes received.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Vec<u8>,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier").finish_non_exhaustive()
    }
}

impl SignatureVerifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(AppError::Validation("webhook secret must not be empty".to_string()));
        }
        Ok(Self {
            secret: secret.to_vec(),
        })
    }

    fn mac(&self) -> Result<HmacSha512> {
        HmacSha512::new_from_slice(&self.secret)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("invalid HMAC key: {}", e)))
    }

    /// Hex signature for `raw_body`.
    pub fn sign(&self, raw_body: &[u8]) -> Result<String> {
        let mut mac = self.mac()?;
        mac.update(raw_body);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Constant-time check of `signature` (hex, optionally `sha512=`-prefixed).
    /// A missing, undecodable or wrong signature is `SignatureInvalid`.
    pub fn verify(&self, raw_body: &[u8], signature: Option<&str>) -> Result<()> {
        let signature = signature
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(AppError::SignatureInvalid)?;
        let signature = signature.strip_prefix("sha512=").unwrap_or(signature);
        let expected = hex::decode(signature).map_err(|_| AppError::SignatureInvalid)?;

        let mut mac = self.mac()?;
        mac.update(raw_body);
        mac.verify_slice(&expected).map_err(|_| AppError::SignatureInvalid)
    }
}
