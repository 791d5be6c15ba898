//! Short-lived identity token handed to each worker process.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use nebula_core::{PluginName, ScopeSet};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};

/// Lifetime of a worker token.
const TOKEN_TTL_SECS: i64 = 300;

/// Contents of `NEBULA_PLUGIN_TOKEN`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerToken {
    /// Plugin the worker runs.
    pub plugin_name: String,
    /// Effective scopes at activation.
    pub scopes: Vec<String>,
    /// Expiry, unix seconds.
    pub exp: i64,
    /// Random per-activation value.
    pub nonce: String,
}

impl WorkerToken {
    /// Issue a token for one activation.
    #[must_use]
    pub fn issue(plugin: &PluginName, scopes: &ScopeSet, now: DateTime<Utc>) -> Self {
        let mut nonce = [0u8; 16];
        OsRng.fill_bytes(&mut nonce);
        Self {
            plugin_name: plugin.as_str().to_string(),
            scopes: scopes.to_strings(),
            exp: now.timestamp().saturating_add(TOKEN_TTL_SECS),
            nonce: URL_SAFE_NO_PAD.encode(nonce),
        }
    }

    /// URL-safe base64 of the JSON form.
    #[must_use]
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Parse an encoded token.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidRequest`] for malformed input.
    pub fn decode(raw: &str) -> PluginResult<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(raw.trim())
            .map_err(|e| PluginError::InvalidRequest(format!("token is not base64: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| PluginError::InvalidRequest(format!("token is not valid JSON: {e}")))
    }

    /// Whether the token has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.exp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_carries_effective_scopes() {
        let plugin = PluginName::new("sample_sync").unwrap();
        let scopes = ScopeSet::parse(["users.write", "users.read"]).unwrap();
        let now = Utc::now();
        let token = WorkerToken::issue(&plugin, &scopes, now);
        let decoded = WorkerToken::decode(&token.encode()).unwrap();

        assert_eq!(decoded, token);
        assert_eq!(decoded.scopes, vec!["users.read", "users.write"]);
        assert_eq!(decoded.exp, now.timestamp().saturating_add(300));
        assert!(!decoded.is_expired(now));
    }

    #[test]
    fn test_nonce_differs_per_issue() {
        let plugin = PluginName::new("sample_sync").unwrap();
        let now = Utc::now();
        let a = WorkerToken::issue(&plugin, &ScopeSet::new(), now);
        let b = WorkerToken::issue(&plugin, &ScopeSet::new(), now);
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(WorkerToken::decode("***").is_err());
        assert!(WorkerToken::decode(&URL_SAFE_NO_PAD.encode(b"not json")).is_err());
    }
}
