use crate::error::{AppError, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Builds the keys and request fingerprints the guard stores.
#[derive(Debug, Clone)]
pub struct IdempotencyKeyGenerator {
    prefix: String,
}

impl Default for IdempotencyKeyGenerator {
    fn default() -> Self {
        Self::new("idem")
    }
}

impl IdempotencyKeyGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Validates a client `Idempotency-Key` header (must be a UUID) and
    /// returns its canonical form, so `ABC...` and `abc...` collide.
    pub fn from_client_key(&self, client_key: &str) -> Result<String> {
        let parsed = Uuid::parse_str(client_key.trim()).map_err(|_| {
            AppError::Validation("Idempotency-Key must be a UUID".to_string())
        })?;
        Ok(format!("{}_{}", self.prefix, parsed.hyphenated()))
    }

    /// Key for a provider webhook event. The webhook scope keeps it apart
    /// from client keys, so the id is used as-is.
    pub fn from_event_id(&self, event_id: &str) -> Result<String> {
        let event_id = event_id.trim();
        if event_id.is_empty() {
            return Err(AppError::MalformedPayload("event_id is empty".to_string()));
        }
        Ok(event_id.to_string())
    }

    /// SHA-256 over the canonical JSON of the logical request. Two requests
    /// with the same key must have the same fingerprint to count as a replay.
    pub fn fingerprint<T: Serialize>(&self, request: &T) -> Result<String> {
        let json = serde_json::to_vec(request).map_err(|e| {
            AppError::Internal(anyhow::anyhow!("Failed to serialize request: {}", e))
        })?;
        let mut hasher = Sha256::new();
        hasher.update(&json);
        Ok(hex::encode(hasher.finalize()))
    }
}
