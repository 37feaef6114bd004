use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{Value, json};

use trelay_common::{
    Account, AccountResolver, HttpMethod, TranslationConfig, TransportErrorKind,
    UpstreamClient, UpstreamHttpRequest,
};

use crate::cache::{CacheStats, TranslationCache};

const TRANSLATE_TIMEOUT: Duration = Duration::from_secs(60);

const SYSTEM_PROMPT: &str = "You are a professional translator. Return only the \
translation with no explanations or notes. Preserve the original whitespace and \
line breaks. Keep any __CODE_BLOCK_*__ or __INLINE_CODE_*__ placeholders exactly \
as they appear. Maintain the tone of the source text.";

/// Per-account translation directions, resolved from the account toggle and
/// the global feature flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationPolicy {
    pub source_lang: String,
    pub target_lang: String,
}

impl TranslationPolicy {
    /// `None` unless both the global flag and the account toggle enable
    /// translation.
    pub fn resolve(account: Option<&Account>, config: &TranslationConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let account = account?;
        if !account.enable_translation.enabled() {
            return None;
        }
        Some(Self {
            source_lang: account.translation_source_lang().to_string(),
            target_lang: account.translation_target_lang().to_string(),
        })
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TranslateError {
    #[error("no translation account configured")]
    AccountNotConfigured,
    #[error("translation account not found: {0}")]
    AccountNotFound(String),
    #[error("translation account has no api key: {0}")]
    AccountMissingKey(String),
    #[error("translation account has no base url: {0}")]
    AccountMissingBaseUrl(String),
    #[error("unsupported language pair: {source_lang} -> {target}")]
    UnsupportedLanguage { source_lang: String, target: String },
    #[error("translation upstream returned {status}: {message}")]
    Http { status: u16, message: String },
    #[error("malformed translation response: {0}")]
    Parse(String),
    #[error("translation request timed out")]
    Timeout,
    #[error("translation transport error: {0}")]
    Transport(String),
}

/// Single-string zh↔en translation through an upstream OpenAI-compatible
/// chat endpoint, deduplicated through the shared LRU cache.
pub struct TranslationService {
    config: TranslationConfig,
    accounts: Arc<dyn AccountResolver>,
    client: Arc<dyn UpstreamClient>,
    cache: TranslationCache,
}

impl TranslationService {
    pub fn new(
        config: TranslationConfig,
        accounts: Arc<dyn AccountResolver>,
        client: Arc<dyn UpstreamClient>,
    ) -> Self {
        let cache = TranslationCache::new(
            config.cache_size,
            Duration::from_secs(config.cache_ttl_hours * 3600),
        );
        Self {
            config,
            accounts,
            client,
            cache,
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub async fn translate(
        &self,
        text: &str,
        source: &str,
        target: &str,
    ) -> Result<String, TranslateError> {
        if text.trim().is_empty() || source == target {
            return Ok(text.to_string());
        }
        if !matches!((source, target), ("zh", "en") | ("en", "zh")) {
            return Err(TranslateError::UnsupportedLanguage {
                source_lang: source.to_string(),
                target: target.to_string(),
            });
        }

        let key = TranslationCache::key(source, target, text);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }

        let translated = self.translate_upstream(text, source, target).await?;
        self.cache.set(&key, translated.clone());
        Ok(translated)
    }

    async fn translate_upstream(
        &self,
        text: &str,
        source: &str,
        target: &str,
    ) -> Result<String, TranslateError> {
        let account_id = self
            .config
            .account_id
            .as_deref()
            .ok_or(TranslateError::AccountNotConfigured)?;
        let account = self
            .accounts
            .account(account_id)
            .await
            .ok_or_else(|| TranslateError::AccountNotFound(account_id.to_string()))?;
        if account.api_key.trim().is_empty() {
            return Err(TranslateError::AccountMissingKey(account.id.clone()));
        }
        if account.base_api.trim().is_empty() {
            return Err(TranslateError::AccountMissingBaseUrl(account.id.clone()));
        }

        let mut body = json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                {
                    "role": "user",
                    "content": format!(
                        "Translate the following from {} to {}:\n\n{}",
                        lang_name(source),
                        lang_name(target),
                        text
                    )
                }
            ],
            "max_tokens": self.config.max_tokens,
            "temperature": 0.3,
            "stream": false
        });
        if self.config.model.starts_with("qwen3")
            && let Some(map) = body.as_object_mut()
        {
            // qwen3 answers in chain-of-thought mode unless told otherwise.
            map.insert("enable_thinking".to_string(), Value::Bool(false));
        }

        let request = UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: format!(
                "{}/chat/completions",
                account.base_api.trim_end_matches('/')
            ),
            headers: vec![
                (
                    "Authorization".to_string(),
                    format!("Bearer {}", account.api_key),
                ),
                ("Content-Type".to_string(), "application/json".to_string()),
            ],
            body: Some(Bytes::from(serde_json::to_vec(&body).unwrap_or_default())),
            is_stream: false,
            proxy: account.proxy.clone(),
        };

        let response = tokio::time::timeout(TRANSLATE_TIMEOUT, self.client.send(request))
            .await
            .map_err(|_| TranslateError::Timeout)?
            .map_err(|err| match err.kind {
                TransportErrorKind::Timeout | TransportErrorKind::ReadTimeout => {
                    TranslateError::Timeout
                }
                _ => TranslateError::Transport(err.message),
            })?;

        let status = response.status;
        let payload = response.body.collect().await;
        if status != 200 {
            return Err(TranslateError::Http {
                status,
                message: extract_error_message(&payload),
            });
        }

        let value: Value = serde_json::from_slice(&payload)
            .map_err(|err| TranslateError::Parse(err.to_string()))?;
        let content = value
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .ok_or_else(|| TranslateError::Parse("missing choices[0].message.content".into()))?;

        Ok(content.trim().to_string())
    }
}

fn lang_name(code: &str) -> &str {
    match code {
        "zh" => "Chinese",
        "en" => "English",
        other => other,
    }
}

fn extract_error_message(body: &Bytes) -> String {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        if let Some(message) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return message.to_string();
        }
        if let Some(message) = value.get("message").and_then(|m| m.as_str()) {
            return message.to_string();
        }
    }
    String::from_utf8_lossy(body).trim().to_string()
}
