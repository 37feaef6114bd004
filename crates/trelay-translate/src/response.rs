use std::sync::Arc;

use bytes::Bytes;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::warn;

use trelay_protocol::sse::SseMessage;

use crate::code_guard::CodeGuard;
use crate::sentence::SentenceBuffer;
use crate::service::{TranslationPolicy, TranslationService};

/// Client-stream writer that goes quiet once the receiver is gone, so a
/// disconnected client short-circuits the rest of the splice.
pub struct StreamWriter {
    tx: mpsc::Sender<Bytes>,
    ended: bool,
}

impl StreamWriter {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx, ended: false }
    }

    pub async fn write(&mut self, bytes: Bytes) -> bool {
        if self.ended {
            return false;
        }
        if self.tx.send(bytes).await.is_err() {
            self.ended = true;
            return false;
        }
        true
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseTranslatorStats {
    pub events: u64,
    pub text_deltas: u64,
    pub sentences_translated: u64,
    pub translation_errors: u64,
    pub passthrough: u64,
}

/// Egress-side SSE state machine: translates assistant text deltas en→zh at
/// sentence boundaries and re-emits them; every other event passes through
/// verbatim. Scoped to a single HTTP response.
pub struct ResponseTranslator {
    policy: Option<TranslationPolicy>,
    service: Arc<TranslationService>,
    guard: CodeGuard,
    writer: StreamWriter,
    current_block_type: Option<String>,
    current_block_index: Option<u64>,
    buffer: SentenceBuffer,
    finalized: bool,
    stats: ResponseTranslatorStats,
}

impl ResponseTranslator {
    pub fn new(
        policy: Option<TranslationPolicy>,
        service: Arc<TranslationService>,
        tx: mpsc::Sender<Bytes>,
    ) -> Self {
        Self {
            policy,
            service,
            guard: CodeGuard::new(),
            writer: StreamWriter::new(tx),
            current_block_type: None,
            current_block_index: None,
            buffer: SentenceBuffer::new(),
            finalized: false,
            stats: ResponseTranslatorStats::default(),
        }
    }

    pub fn stats(&self) -> ResponseTranslatorStats {
        self.stats
    }

    pub fn is_ended(&self) -> bool {
        self.writer.is_ended()
    }

    pub async fn process(&mut self, message: &SseMessage) {
        self.stats.events += 1;

        if self.policy.is_none() {
            self.pass_through(message).await;
            return;
        }

        let Some(value) = message.json() else {
            // [DONE] and undecodable payloads are forwarded as received.
            self.pass_through(message).await;
            return;
        };

        match value.get("type").and_then(|t| t.as_str()) {
            Some("content_block_start") => {
                self.current_block_type = value
                    .get("content_block")
                    .and_then(|b| b.get("type"))
                    .and_then(|t| t.as_str())
                    .map(|t| t.to_string());
                self.current_block_index = value.get("index").and_then(|i| i.as_u64());
                self.buffer.reset();
                self.pass_through(message).await;
            }
            Some("content_block_delta") => {
                let delta_type = value
                    .get("delta")
                    .and_then(|d| d.get("type"))
                    .and_then(|t| t.as_str());
                let is_text_block = self.current_block_type.as_deref() == Some("text");
                if is_text_block && delta_type == Some("text_delta") {
                    self.stats.text_deltas += 1;
                    let text = value
                        .get("delta")
                        .and_then(|d| d.get("text"))
                        .and_then(|t| t.as_str())
                        .unwrap_or_default();
                    let sentences = self.buffer.add(text);
                    for sentence in sentences {
                        self.emit_translated(&sentence, message.event.is_some())
                            .await;
                    }
                } else {
                    // tool_use input and anything unrecognized is never
                    // buffered or rewritten.
                    self.pass_through(message).await;
                }
            }
            Some("content_block_stop") => {
                if self.current_block_type.as_deref() == Some("text") {
                    let rest = self.buffer.flush();
                    if !rest.trim().is_empty() {
                        self.emit_translated(&rest, message.event.is_some()).await;
                    }
                }
                self.current_block_type = None;
                self.current_block_index = None;
                self.pass_through(message).await;
            }
            _ => {
                self.pass_through(message).await;
            }
        }
    }

    /// Idempotent. Residual buffered text means the upstream ended without a
    /// `content_block_stop`; it is logged and discarded.
    pub async fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        if !self.buffer.is_empty() {
            warn!(
                event = "response_translator_residual",
                dropped_chars = self.buffer.len(),
            );
            self.buffer.reset();
        }
    }

    async fn pass_through(&mut self, message: &SseMessage) {
        self.stats.passthrough += 1;
        self.writer.write(message.to_bytes()).await;
    }

    async fn emit_translated(&mut self, sentence: &str, named: bool) {
        let translated = self.translate_sentence(sentence).await;
        let index = self.current_block_index.unwrap_or(0);
        let payload = json!({
            "type": "content_block_delta",
            "index": index,
            "delta": { "type": "text_delta", "text": translated }
        });
        let frame = SseMessage {
            event: named.then(|| "content_block_delta".to_string()),
            data: payload.to_string(),
        };
        self.writer.write(frame.to_bytes()).await;
    }

    /// Same text sub-pipeline as the request side, reversed direction and
    /// without the Chinese guard; errors fall back to the original sentence.
    async fn translate_sentence(&mut self, sentence: &str) -> String {
        let Some(policy) = &self.policy else {
            return sentence.to_string();
        };
        let (clean, placeholders) = self.guard.extract(sentence);
        if self.guard.nothing_translatable(&clean) {
            return sentence.to_string();
        }
        match self
            .service
            .translate(&clean, &policy.target_lang, &policy.source_lang)
            .await
        {
            Ok(translated) => {
                self.stats.sentences_translated += 1;
                self.guard.restore(&translated, &placeholders)
            }
            Err(err) => {
                self.stats.translation_errors += 1;
                warn!(event = "response_translation_failed", error = %err);
                sentence.to_string()
            }
        }
    }
}
