//! Permissioning authority keys.
//!
//! A client may only register if a trusted permissioning authority has
//! signed its key. The registrar looks the authority key up through
//! [`AuthorityKeys`]; [`StaticAuthorities`] serves keys loaded at startup.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use ed25519_dalek::VerifyingKey;

use crate::crypto::parse_public_key_pem;

/// Source of trusted permissioning authority keys.
pub trait AuthorityKeys: Send + Sync {
    /// Verifying key of `authority_id`, if it is trusted.
    fn trusted_key(&self, authority_id: &str) -> Option<VerifyingKey>;
}

/// Shared authority key source.
pub type SharedAuthorityKeys = Arc<dyn AuthorityKeys>;

/// Fixed set of trusted authorities.
#[derive(Debug, Default, Clone)]
pub struct StaticAuthorities {
    keys: HashMap<String, VerifyingKey>,
}

impl StaticAuthorities {
    /// Empty set; nothing is trusted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust `key` under `authority_id`, replacing any previous key.
    pub fn with_key(mut self, authority_id: impl Into<String>, key: VerifyingKey) -> Self {
        self.keys.insert(authority_id.into(), key);
        self
    }

    /// Trust the SPKI PEM key stored at `path` under `authority_id`.
    pub fn load_pem_file(self, authority_id: &str, path: &Path) -> Result<Self> {
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read authority key {}", path.display()))?;
        let key = parse_public_key_pem(&pem)
            .with_context(|| format!("Failed to parse authority key {}", path.display()))?;
        log::info!(
            "Trusting permissioning authority '{}' (key {})",
            authority_id,
            crate::crypto::fingerprint(&key).short()
        );
        Ok(self.with_key(authority_id, key))
    }
}

impl AuthorityKeys for StaticAuthorities {
    fn trusted_key(&self, authority_id: &str) -> Option<VerifyingKey> {
        self.keys.get(authority_id).copied()
    }
}
