use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use trelay_common::{
    Account, AccountResolver, HttpMethod, RelayConfig, TransportErrorKind, UpstreamBody,
    UpstreamClient, UpstreamHttpRequest,
};
use trelay_protocol::chat::ChatRequest;
use trelay_protocol::sse::SseAccumulator;
use trelay_protocol::usage::{
    RateLimitSignal, UsageObservation, extract_usage, resets_in_seconds, scan_rate_limit,
};
use trelay_translate::{RequestTranslator, ResponseTranslator, TranslationPolicy, TranslationService};

use crate::error::RelayError;
use crate::headers::build_upstream_headers;
use crate::recorder::{CostCalculator, UsageRecord, UsageRecorder};
use crate::scheduler::SchedulerCallbacks;

#[derive(Debug)]
pub struct InboundRequest {
    pub account_id: String,
    /// Validated API-key id, supplied by the external key-validation layer.
    pub api_key_id: Option<String>,
    pub method: HttpMethod,
    /// Path suffix appended to the account's base URL, leading slash
    /// included.
    pub path: String,
    pub headers: trelay_common::Headers,
    pub body: Bytes,
}

pub enum RelayResponse {
    Json {
        status: u16,
        body: Bytes,
    },
    /// SSE body; the receiver closes when the splice task finishes.
    Stream {
        status: u16,
        body: mpsc::Receiver<Bytes>,
    },
}

impl From<RelayError> for RelayResponse {
    fn from(err: RelayError) -> Self {
        RelayResponse::Json {
            status: err.status,
            body: err.body,
        }
    }
}

pub struct RelayDeps {
    pub config: RelayConfig,
    pub accounts: Arc<dyn AccountResolver>,
    pub scheduler: Arc<dyn SchedulerCallbacks>,
    pub recorder: Arc<dyn UsageRecorder>,
    pub cost: Arc<dyn CostCalculator>,
    pub client: Arc<dyn UpstreamClient>,
    pub translation: Arc<TranslationService>,
}

/// End-to-end request lifecycle: account lookup, optional ingress
/// translation, upstream dispatch, status classification, streaming splice,
/// usage recording.
pub struct RelayCore {
    deps: RelayDeps,
    request_translator: RequestTranslator,
}

impl RelayCore {
    pub fn new(deps: RelayDeps) -> Self {
        let request_translator = RequestTranslator::new(deps.translation.clone());
        Self {
            deps,
            request_translator,
        }
    }

    pub async fn handle(&self, req: InboundRequest) -> RelayResponse {
        let trace_id = Uuid::new_v4().to_string();
        let started_at = Instant::now();

        let Some(account) = self.deps.accounts.account(&req.account_id).await else {
            return RelayError::account_not_found(&req.account_id).into();
        };

        let parsed: ChatRequest = match serde_json::from_slice(&req.body) {
            Ok(parsed) => parsed,
            Err(err) => {
                return RelayError::bad_request(format!("malformed request body: {err}")).into();
            }
        };
        let is_stream = parsed.stream;
        let requested_model = parsed.model.clone();
        let session_hash = session_hash(&req.headers, &parsed);
        let provider = provider_tag(&req.path);

        info!(
            event = "relay_received",
            trace_id = %trace_id,
            account_id = %account.id,
            provider = %provider,
            model = %requested_model,
            path = %req.path,
            is_stream,
        );

        let policy = TranslationPolicy::resolve(Some(&account), &self.deps.config.translation);
        let outbound = self
            .request_translator
            .translate_request(parsed, policy.as_ref())
            .await;
        let outbound_body = match serde_json::to_vec(&outbound) {
            Ok(bytes) => bytes,
            Err(err) => {
                return RelayError::bad_request(format!("unserializable request body: {err}"))
                    .into();
            }
        };

        let upstream_req = UpstreamHttpRequest {
            method: req.method,
            url: format!("{}{}", account.base_api.trim_end_matches('/'), req.path),
            headers: build_upstream_headers(&req.headers, &account),
            body: Some(Bytes::from(outbound_body)),
            is_stream,
            proxy: account.proxy.clone(),
        };

        let response = match self.deps.client.send(upstream_req).await {
            Ok(response) => response,
            Err(err) => {
                self.deps
                    .accounts
                    .mark_error(&account.id, &err.message)
                    .await;
                let status = match err.kind {
                    TransportErrorKind::Timeout | TransportErrorKind::ReadTimeout => 504,
                    _ => 502,
                };
                warn!(
                    event = "relay_upstream_failed",
                    trace_id = %trace_id,
                    account_id = %account.id,
                    kind = ?err.kind,
                    message = %err.message,
                );
                return RelayError::new(status, "upstream_error", &err.message).into();
            }
        };

        let status = response.status;
        let result = match status {
            429 => {
                self.on_rate_limited(&account, provider, session_hash.as_deref(), response)
                    .await
            }
            401 => {
                self.on_unauthorized(&account, provider, session_hash.as_deref(), response)
                    .await
            }
            s if !(200..300).contains(&s) => RelayResponse::Json {
                status: s,
                body: response.body.collect().await,
            },
            s if is_stream => {
                self.splice(
                    &account,
                    policy,
                    provider,
                    session_hash,
                    requested_model,
                    req.api_key_id.clone(),
                    s,
                    response.body,
                )
                .await
            }
            s => {
                let body = response.body.collect().await;
                if let Ok(value) = serde_json::from_slice::<Value>(&body)
                    && let Some(usage) = extract_usage(&value, Some(&requested_model))
                {
                    self.record_usage(&account, req.api_key_id.clone(), usage)
                        .await;
                }
                self.deps.accounts.touch(&account.id).await;
                RelayResponse::Json { status: s, body }
            }
        };

        info!(
            event = "relay_responded",
            trace_id = %trace_id,
            account_id = %account.id,
            status = status,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            is_stream,
        );
        result
    }

    async fn on_rate_limited(
        &self,
        account: &Account,
        provider: &'static str,
        session_hash: Option<&str>,
        response: trelay_common::UpstreamHttpResponse,
    ) -> RelayResponse {
        let body = response.body.collect().await;
        let error_data = parse_error_payload(&body);
        let resets = error_data.as_ref().and_then(resets_in_seconds);

        warn!(
            event = "relay_rate_limited",
            account_id = %account.id,
            provider = %provider,
            resets_in_seconds = ?resets,
        );
        if let Err(err) = self
            .deps
            .scheduler
            .mark_rate_limited(&account.id, provider, session_hash, resets)
            .await
        {
            warn!(event = "scheduler_callback_failed", error = %err);
        }

        let payload = match error_data {
            Some(value) => Bytes::from(value.to_string()),
            None => {
                let mut error = Map::new();
                error.insert("type".to_string(), json!("rate_limit_error"));
                error.insert("message".to_string(), json!("Rate limit exceeded"));
                if let Some(seconds) = resets {
                    error.insert("resets_in_seconds".to_string(), json!(seconds));
                }
                Bytes::from(json!({ "error": error }).to_string())
            }
        };
        RelayResponse::Json {
            status: 429,
            body: payload,
        }
    }

    async fn on_unauthorized(
        &self,
        account: &Account,
        provider: &'static str,
        session_hash: Option<&str>,
        response: trelay_common::UpstreamHttpResponse,
    ) -> RelayResponse {
        let body = response.body.collect().await;
        let error_data = parse_error_payload(&body);
        let reason = unauthorized_reason(error_data.as_ref(), &body);

        warn!(
            event = "relay_unauthorized",
            account_id = %account.id,
            provider = %provider,
            reason = %reason,
        );
        if let Err(err) = self
            .deps
            .scheduler
            .mark_unauthorized(&account.id, provider, session_hash, &reason)
            .await
        {
            warn!(event = "scheduler_callback_failed", error = %err);
        }

        let payload = match error_data {
            Some(value) => Bytes::from(value.to_string()),
            None => Bytes::from(
                json!({
                    "error": {
                        "type": "unauthorized",
                        "code": "unauthorized",
                        "message": reason
                    }
                })
                .to_string(),
            ),
        };
        RelayResponse::Json {
            status: 401,
            body: payload,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn splice(
        &self,
        account: &Account,
        policy: Option<TranslationPolicy>,
        provider: &'static str,
        session_hash: Option<String>,
        requested_model: String,
        api_key_id: Option<String>,
        status: u16,
        body: UpstreamBody,
    ) -> RelayResponse {
        let mut upstream_rx = match body {
            UpstreamBody::Stream(rx) => rx,
            UpstreamBody::Bytes(bytes) => {
                // A 2xx that arrived buffered still goes out as one SSE
                // chunk through the same scanning path.
                let (tx, rx) = mpsc::channel(1);
                let _ = tx.try_send(bytes);
                rx
            }
        };

        let (tx, rx) = mpsc::channel::<Bytes>(16);
        let accounts = self.deps.accounts.clone();
        let scheduler = self.deps.scheduler.clone();
        let recorder = self.deps.recorder.clone();
        let cost = self.deps.cost.clone();
        let translation = self.deps.translation.clone();
        let account = account.clone();

        tokio::spawn(async move {
            let mut acc = SseAccumulator::new();
            let mut usage: Option<UsageObservation> = None;
            let mut rate_limit: Option<RateLimitSignal> = None;
            let mut translator =
                policy.map(|p| ResponseTranslator::new(Some(p), translation, tx.clone()));
            let mut stream_ended = false;

            while let Some(chunk) = upstream_rx.recv().await {
                // Raw tee unless the translator owns the client stream.
                if translator.is_none()
                    && !stream_ended
                    && tx.send(chunk.clone()).await.is_err()
                {
                    stream_ended = true;
                }

                for message in acc.push_bytes(&chunk) {
                    if let Some(value) = message.json() {
                        if let Some(observed) = extract_usage(&value, Some(&requested_model)) {
                            usage = Some(observed);
                        }
                        if let Some(signal) = scan_rate_limit(&value) {
                            rate_limit = Some(signal);
                        }
                    }
                    if let Some(translator) = translator.as_mut() {
                        translator.process(&message).await;
                    }
                }

                if stream_ended || translator.as_ref().is_some_and(|t| t.is_ended()) {
                    // Client went away; dropping the receiver aborts the
                    // upstream read task.
                    break;
                }
            }

            for message in acc.finish() {
                if let Some(value) = message.json() {
                    if let Some(observed) = extract_usage(&value, Some(&requested_model)) {
                        usage = Some(observed);
                    }
                    if let Some(signal) = scan_rate_limit(&value) {
                        rate_limit = Some(signal);
                    }
                }
                if let Some(translator) = translator.as_mut() {
                    translator.process(&message).await;
                }
            }
            if let Some(translator) = translator.as_mut() {
                translator.finalize().await;
            }
            // Close the client stream before the post-stream bookkeeping.
            drop(translator);
            drop(tx);

            if let Some(signal) = rate_limit {
                warn!(
                    event = "relay_stream_rate_limited",
                    account_id = %account.id,
                    resets_in_seconds = ?signal.resets_in_seconds,
                );
                if let Err(err) = scheduler
                    .mark_rate_limited(
                        &account.id,
                        provider,
                        session_hash.as_deref(),
                        signal.resets_in_seconds,
                    )
                    .await
                {
                    warn!(event = "scheduler_callback_failed", error = %err);
                }
            }

            if let Some(observed) = usage {
                record_usage_inner(
                    &*recorder,
                    &*cost,
                    &*accounts,
                    &account,
                    api_key_id,
                    observed,
                )
                .await;
            }
            accounts.touch(&account.id).await;
        });

        RelayResponse::Stream { status, body: rx }
    }

    async fn record_usage(
        &self,
        account: &Account,
        api_key_id: Option<String>,
        usage: UsageObservation,
    ) {
        record_usage_inner(
            &*self.deps.recorder,
            &*self.deps.cost,
            &*self.deps.accounts,
            account,
            api_key_id,
            usage,
        )
        .await;
    }
}

async fn record_usage_inner(
    recorder: &dyn UsageRecorder,
    cost: &dyn CostCalculator,
    accounts: &dyn AccountResolver,
    account: &Account,
    api_key_id: Option<String>,
    usage: UsageObservation,
) {
    let record = UsageRecord::from_observation(api_key_id, account.id.clone(), &usage);
    if let Err(err) = recorder.record_usage(record).await {
        warn!(event = "usage_record_failed", account_id = %account.id, error = %err);
    }
    if account.daily_quota > 0.0 {
        let amount = cost.cost(&usage.model, &usage);
        accounts.add_quota_cost(&account.id, amount).await;
    }
}

/// SHA-256 of the client-supplied session id; opaque affinity key for the
/// scheduler.
fn session_hash(headers: &trelay_common::Headers, parsed: &ChatRequest) -> Option<String> {
    let session_id = trelay_common::header_get(headers, "session_id")
        .map(|value| value.to_string())
        .or_else(|| parsed.session_id.clone())?;
    let digest = Sha256::digest(session_id.as_bytes());
    Some(digest.iter().map(|byte| format!("{byte:02x}")).collect())
}

fn provider_tag(path: &str) -> &'static str {
    if path.contains("/messages") {
        "claude"
    } else {
        "openai"
    }
}

/// Decode an error body that may be plain JSON or JSON wrapped in SSE
/// framing. Bodies are always fully buffered before classification.
fn parse_error_payload(body: &Bytes) -> Option<Value> {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        return Some(value);
    }
    let text = std::str::from_utf8(body).ok()?;
    if !text.contains("data:") {
        return None;
    }
    let mut acc = SseAccumulator::new();
    let mut messages = acc.push_str(text);
    messages.extend(acc.finish());
    messages.iter().find_map(|message| message.json())
}

fn unauthorized_reason(error_data: Option<&Value>, body: &Bytes) -> String {
    let from_payload = match error_data {
        Some(Value::String(text)) if !text.is_empty() => Some(text.clone()),
        Some(value) => value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .or_else(|| value.get("message").and_then(|m| m.as_str()))
            .map(|m| m.to_string()),
        None => {
            let raw = String::from_utf8_lossy(body).trim().to_string();
            (!raw.is_empty()).then_some(raw)
        }
    };
    from_payload
        .filter(|reason| !reason.is_empty())
        .unwrap_or_else(|| "upstream authentication failed".to_string())
}
