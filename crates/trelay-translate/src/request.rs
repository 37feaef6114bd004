use std::sync::Arc;

use tracing::warn;

use trelay_protocol::chat::{ChatRequest, Content, ContentBlock, KnownBlock, Role};

use crate::code_guard::CodeGuard;
use crate::lang::contains_chinese;
use crate::service::{TranslationPolicy, TranslationService};

/// Ingress-side translator: rewrites user-authored text zh→en, leaving
/// assistant/system messages and non-text blocks untouched.
pub struct RequestTranslator {
    service: Arc<TranslationService>,
    guard: CodeGuard,
}

impl RequestTranslator {
    pub fn new(service: Arc<TranslationService>) -> Self {
        Self {
            service,
            guard: CodeGuard::new(),
        }
    }

    /// With no active policy the request passes through untouched; otherwise
    /// user-message text is translated and everything else is carried over
    /// as-is.
    pub async fn translate_request(
        &self,
        mut request: ChatRequest,
        policy: Option<&TranslationPolicy>,
    ) -> ChatRequest {
        let Some(policy) = policy else {
            return request;
        };

        for message in &mut request.messages {
            if message.role != Role::User {
                continue;
            }
            match &mut message.content {
                Content::Text(text) => {
                    *text = self.translate_text(text, policy).await;
                }
                Content::Blocks(blocks) => {
                    for block in blocks.iter_mut() {
                        if let ContentBlock::Known(KnownBlock::Text { text, .. }) = block {
                            *text = self.translate_text(text, policy).await;
                        }
                    }
                }
            }
        }
        request
    }

    /// Best-effort single-text translation. Failures log and fall back to
    /// the original so the request always proceeds.
    pub async fn translate_text(&self, text: &str, policy: &TranslationPolicy) -> String {
        if text.is_empty() || !contains_chinese(text) {
            return text.to_string();
        }

        let (clean, placeholders) = self.guard.extract(text);
        if self.guard.nothing_translatable(&clean) {
            return text.to_string();
        }

        match self
            .service
            .translate(&clean, &policy.source_lang, &policy.target_lang)
            .await
        {
            Ok(translated) => self.guard.restore(&translated, &placeholders),
            Err(err) => {
                warn!(event = "request_translation_failed", error = %err);
                text.to_string()
            }
        }
    }
}
