//! Credential lookup
//!
//! The engine never stores credentials. It asks an opaque provider for a key
//! by provider identity; a missing key means the remote path is unavailable.

use std::collections::HashMap;
use std::fmt;

use crate::remote::provider::ProviderId;

/// An API key. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

/// Opaque secure key lookup
pub trait KeyProvider: Send + Sync {
    fn get(&self, provider: ProviderId) -> Option<Secret>;
}

/// In-memory keys, handed over by a platform keystore bridge
#[derive(Debug, Clone, Default)]
pub struct StaticKeyProvider {
    keys: HashMap<ProviderId, Secret>,
}

impl StaticKeyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, provider: ProviderId, secret: Secret) -> Self {
        self.keys.insert(provider, secret);
        self
    }
}

impl KeyProvider for StaticKeyProvider {
    fn get(&self, provider: ProviderId) -> Option<Secret> {
        self.keys.get(&provider).cloned()
    }
}

/// Reads `SYNHEART_COACH_<PROVIDER>_API_KEY` from the environment
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvKeyProvider;

impl EnvKeyProvider {
    pub fn var_name(provider: ProviderId) -> String {
        format!(
            "SYNHEART_COACH_{}_API_KEY",
            provider.as_str().to_ascii_uppercase()
        )
    }
}

impl KeyProvider for EnvKeyProvider {
    fn get(&self, provider: ProviderId) -> Option<Secret> {
        std::env::var(Self::var_name(provider))
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(Secret::new)
    }
}
