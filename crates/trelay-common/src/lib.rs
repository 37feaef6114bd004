pub mod account;
pub mod client;
pub mod headers;

pub use account::{Account, AccountResolver, MemoryAccountStore, Toggle};
pub use client::{
    HttpMethod, TransportError, TransportErrorKind, UpstreamBody, UpstreamClient,
    UpstreamClientConfig, UpstreamHttpRequest, UpstreamHttpResponse, WreqUpstreamClient,
};
pub use headers::{Headers, header_get, header_remove, header_set};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum RelayConfigError {
    #[error("missing required config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged runtime configuration.
///
/// Merge order: CLI > ENV > defaults. clap applies CLI > ENV per field; the
/// patch overlay fills in the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Upstream relay request timeout in milliseconds.
    pub request_timeout_ms: u64,
    pub translation: TranslationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationConfig {
    /// Global feature flag; per-account toggles apply on top of it.
    pub enabled: bool,
    /// Account used for translation calls. Required when enabled.
    pub account_id: Option<String>,
    pub model: String,
    pub cache_size: usize,
    pub cache_ttl_hours: u64,
    pub max_tokens: u32,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            account_id: None,
            model: "qwen3-8b".to_string(),
            cache_size: 1000,
            cache_ttl_hours: 24,
            max_tokens: 4096,
        }
    }
}

/// Optional layer used for merging runtime config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelayConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub request_timeout_ms: Option<u64>,
    pub translation_enabled: Option<bool>,
    pub translation_account_id: Option<String>,
    pub translation_model: Option<String>,
    pub translation_cache_size: Option<usize>,
    pub translation_cache_ttl_hours: Option<u64>,
    pub translation_max_tokens: Option<u32>,
}

impl RelayConfigPatch {
    pub fn overlay(&mut self, other: RelayConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.request_timeout_ms.is_some() {
            self.request_timeout_ms = other.request_timeout_ms;
        }
        if other.translation_enabled.is_some() {
            self.translation_enabled = other.translation_enabled;
        }
        if other.translation_account_id.is_some() {
            self.translation_account_id = other.translation_account_id;
        }
        if other.translation_model.is_some() {
            self.translation_model = other.translation_model;
        }
        if other.translation_cache_size.is_some() {
            self.translation_cache_size = other.translation_cache_size;
        }
        if other.translation_cache_ttl_hours.is_some() {
            self.translation_cache_ttl_hours = other.translation_cache_ttl_hours;
        }
        if other.translation_max_tokens.is_some() {
            self.translation_max_tokens = other.translation_max_tokens;
        }
    }

    pub fn into_config(self) -> Result<RelayConfig, RelayConfigError> {
        let defaults = TranslationConfig::default();
        let translation = TranslationConfig {
            enabled: self.translation_enabled.unwrap_or(defaults.enabled),
            account_id: self.translation_account_id,
            model: self.translation_model.unwrap_or(defaults.model),
            cache_size: self.translation_cache_size.unwrap_or(defaults.cache_size),
            cache_ttl_hours: self
                .translation_cache_ttl_hours
                .unwrap_or(defaults.cache_ttl_hours),
            max_tokens: self.translation_max_tokens.unwrap_or(defaults.max_tokens),
        };
        if translation.enabled && translation.account_id.is_none() {
            return Err(RelayConfigError::MissingField("translation.account_id"));
        }
        Ok(RelayConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8788),
            request_timeout_ms: self.request_timeout_ms.unwrap_or(600_000),
            translation,
        })
    }
}
