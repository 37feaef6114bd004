use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use trelay_common::{
    Account, AccountResolver, HttpMethod, RelayConfig, RelayConfigPatch, TranslationConfig,
    TransportError, TransportErrorKind, UpstreamBody, UpstreamClient, UpstreamHttpRequest,
    UpstreamHttpResponse,
};
use trelay_core::{
    CostCalculator, InboundRequest, RelayCore, RelayDeps, RelayResponse, SchedulerCallbacks,
    SchedulerError, UsageRecord, UsageRecorder, run_connection_test,
};
use trelay_core::recorder::RecordError;
use trelay_protocol::sse::SseAccumulator;
use trelay_protocol::usage::UsageObservation;
use trelay_translate::TranslationService;

// --- collaborator doubles ---

#[derive(Clone)]
enum Canned {
    Json { status: u16, body: Bytes },
    Stream { status: u16, chunks: Vec<Bytes> },
    Fail(TransportError),
}

struct ScriptedUpstream {
    script: Box<dyn Fn(&UpstreamHttpRequest) -> Canned + Send + Sync>,
    requests: Mutex<Vec<UpstreamHttpRequest>>,
}

impl ScriptedUpstream {
    fn new(script: impl Fn(&UpstreamHttpRequest) -> Canned + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<UpstreamHttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl UpstreamClient for ScriptedUpstream {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, TransportError>> + Send + 'a>>
    {
        Box::pin(async move {
            let canned = (self.script)(&req);
            self.requests.lock().unwrap().push(req);
            match canned {
                Canned::Json { status, body } => Ok(UpstreamHttpResponse {
                    status,
                    headers: Vec::new(),
                    body: UpstreamBody::Bytes(body),
                }),
                Canned::Stream { status, chunks } => {
                    let (tx, rx) = mpsc::channel(16);
                    tokio::spawn(async move {
                        for chunk in chunks {
                            if tx.send(chunk).await.is_err() {
                                break;
                            }
                        }
                    });
                    Ok(UpstreamHttpResponse {
                        status,
                        headers: Vec::new(),
                        body: UpstreamBody::Stream(rx),
                    })
                }
                Canned::Fail(err) => Err(err),
            }
        })
    }
}

#[derive(Default)]
struct TestAccounts {
    accounts: HashMap<String, Account>,
    errors: Mutex<Vec<(String, String)>>,
    touched: Mutex<Vec<String>>,
    quota: Mutex<Vec<(String, f64)>>,
}

impl TestAccounts {
    fn with(accounts: impl IntoIterator<Item = Account>) -> Arc<Self> {
        Arc::new(Self {
            accounts: accounts
                .into_iter()
                .map(|account| (account.id.clone(), account))
                .collect(),
            ..Default::default()
        })
    }
}

#[async_trait]
impl AccountResolver for TestAccounts {
    async fn account(&self, id: &str) -> Option<Account> {
        self.accounts.get(id).cloned()
    }

    async fn mark_error(&self, id: &str, message: &str) {
        self.errors
            .lock()
            .unwrap()
            .push((id.to_string(), message.to_string()));
    }

    async fn touch(&self, id: &str) {
        self.touched.lock().unwrap().push(id.to_string());
    }

    async fn add_quota_cost(&self, id: &str, cost: f64) {
        self.quota.lock().unwrap().push((id.to_string(), cost));
    }
}

#[derive(Default)]
struct RecordingScheduler {
    rate_limited: Mutex<Vec<(String, String, Option<String>, Option<i64>)>>,
    unauthorized: Mutex<Vec<(String, String, Option<String>, String)>>,
}

#[async_trait]
impl SchedulerCallbacks for RecordingScheduler {
    async fn mark_rate_limited(
        &self,
        account_id: &str,
        provider: &str,
        session_hash: Option<&str>,
        resets_in_seconds: Option<i64>,
    ) -> Result<(), SchedulerError> {
        self.rate_limited.lock().unwrap().push((
            account_id.to_string(),
            provider.to_string(),
            session_hash.map(|s| s.to_string()),
            resets_in_seconds,
        ));
        Ok(())
    }

    async fn mark_unauthorized(
        &self,
        account_id: &str,
        provider: &str,
        session_hash: Option<&str>,
        reason: &str,
    ) -> Result<(), SchedulerError> {
        self.unauthorized.lock().unwrap().push((
            account_id.to_string(),
            provider.to_string(),
            session_hash.map(|s| s.to_string()),
            reason.to_string(),
        ));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingRecorder {
    records: Mutex<Vec<UsageRecord>>,
}

#[async_trait]
impl UsageRecorder for RecordingRecorder {
    async fn record_usage(&self, record: UsageRecord) -> Result<(), RecordError> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}

struct FlatCost(f64);

impl CostCalculator for FlatCost {
    fn cost(&self, _model: &str, _usage: &UsageObservation) -> f64 {
        self.0
    }
}

// --- fixtures ---

fn serving_account(translation: bool) -> Account {
    serde_json::from_value(json!({
        "id": "serve-1",
        "baseApi": "https://api.example.com",
        "apiKey": "sk-serve",
        "dailyQuota": if translation { 0.0 } else { 10.0 },
        "enableTranslation": if translation { json!("true") } else { json!(false) }
    }))
    .unwrap()
}

fn translator_account() -> Account {
    serde_json::from_value(json!({
        "id": "trans-1",
        "baseApi": "https://translator.example",
        "apiKey": "sk-trans"
    }))
    .unwrap()
}

fn relay_config(translation: bool) -> RelayConfig {
    let mut config = RelayConfigPatch::default().into_config().unwrap();
    if translation {
        config.translation = TranslationConfig {
            enabled: true,
            account_id: Some("trans-1".to_string()),
            ..Default::default()
        };
    }
    config
}

struct Harness {
    relay: RelayCore,
    accounts: Arc<TestAccounts>,
    scheduler: Arc<RecordingScheduler>,
    recorder: Arc<RecordingRecorder>,
    upstream: Arc<ScriptedUpstream>,
}

fn harness(translation: bool, upstream: Arc<ScriptedUpstream>) -> Harness {
    let accounts = TestAccounts::with([serving_account(translation), translator_account()]);
    let scheduler = Arc::new(RecordingScheduler::default());
    let recorder = Arc::new(RecordingRecorder::default());
    let config = relay_config(translation);
    let translation_service = Arc::new(TranslationService::new(
        config.translation.clone(),
        accounts.clone(),
        upstream.clone(),
    ));
    let relay = RelayCore::new(RelayDeps {
        config,
        accounts: accounts.clone(),
        scheduler: scheduler.clone(),
        recorder: recorder.clone(),
        cost: Arc::new(FlatCost(0.25)),
        client: upstream.clone(),
        translation: translation_service,
    });
    Harness {
        relay,
        accounts,
        scheduler,
        recorder,
        upstream,
    }
}

fn inbound(body: Value) -> InboundRequest {
    InboundRequest {
        account_id: "serve-1".to_string(),
        api_key_id: Some("key-1".to_string()),
        method: HttpMethod::Post,
        path: "/v1/messages".to_string(),
        headers: vec![("session_id".to_string(), "sess-42".to_string())],
        body: Bytes::from(body.to_string()),
    }
}

fn json_body(response: &RelayResponse) -> (u16, Value) {
    match response {
        RelayResponse::Json { status, body } => {
            (*status, serde_json::from_slice(body).unwrap())
        }
        RelayResponse::Stream { .. } => panic!("expected json response"),
    }
}

async fn collect_stream(response: RelayResponse) -> (u16, Vec<Bytes>) {
    match response {
        RelayResponse::Stream { status, mut body } => {
            let mut chunks = Vec::new();
            while let Some(chunk) = body.recv().await {
                chunks.push(chunk);
            }
            (status, chunks)
        }
        RelayResponse::Json { .. } => panic!("expected stream response"),
    }
}

fn sse_chunk(value: &Value) -> Bytes {
    Bytes::from(format!("data: {value}\n\n"))
}

// --- tests ---

#[tokio::test]
async fn upstream_429_marks_rate_limited_and_forwards_reset() {
    let upstream = ScriptedUpstream::new(|_| Canned::Json {
        status: 429,
        body: Bytes::from_static(br#"{"error":{"resets_in_seconds":120}}"#),
    });
    let h = harness(false, upstream);

    let response = h
        .relay
        .handle(inbound(json!({"model": "claude-sonnet-4", "messages": []})))
        .await;
    let (status, body) = json_body(&response);
    assert_eq!(status, 429);
    assert_eq!(body["error"]["resets_in_seconds"], json!(120));

    let calls = h.scheduler.rate_limited.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    let (account_id, provider, session_hash, resets) = &calls[0];
    assert_eq!(account_id, "serve-1");
    assert_eq!(provider, "claude");
    assert_eq!(session_hash.as_ref().map(|s| s.len()), Some(64));
    assert_eq!(*resets, Some(120));
}

#[tokio::test]
async fn upstream_429_without_body_synthesizes_error() {
    let upstream = ScriptedUpstream::new(|_| Canned::Json {
        status: 429,
        body: Bytes::from_static(b"too many requests"),
    });
    let h = harness(false, upstream);

    let response = h
        .relay
        .handle(inbound(json!({"model": "m", "messages": []})))
        .await;
    let (status, body) = json_body(&response);
    assert_eq!(status, 429);
    assert_eq!(body["error"]["type"], "rate_limit_error");
    assert_eq!(h.scheduler.rate_limited.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn upstream_401_marks_unauthorized_with_reason() {
    let upstream = ScriptedUpstream::new(|_| Canned::Json {
        status: 401,
        body: Bytes::from_static(br#"{"error":{"message":"invalid api key"}}"#),
    });
    let h = harness(false, upstream);

    let response = h
        .relay
        .handle(inbound(json!({"model": "m", "messages": []})))
        .await;
    let (status, body) = json_body(&response);
    assert_eq!(status, 401);
    assert_eq!(body["error"]["message"], "invalid api key");

    let calls = h.scheduler.unauthorized.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].3, "invalid api key");
}

#[tokio::test]
async fn unknown_account_is_404_without_upstream_call() {
    let upstream = ScriptedUpstream::new(|_| Canned::Json {
        status: 200,
        body: Bytes::from_static(b"{}"),
    });
    let h = harness(false, upstream);

    let mut req = inbound(json!({"model": "m", "messages": []}));
    req.account_id = "ghost".to_string();
    let response = h.relay.handle(req).await;
    let (status, body) = json_body(&response);
    assert_eq!(status, 404);
    assert_eq!(body["error"]["type"], "not_found_error");
    assert!(h.upstream.requests().is_empty());
}

#[tokio::test]
async fn malformed_body_is_400() {
    let upstream = ScriptedUpstream::new(|_| Canned::Json {
        status: 200,
        body: Bytes::from_static(b"{}"),
    });
    let h = harness(false, upstream);

    let mut req = inbound(json!({}));
    req.body = Bytes::from_static(b"not json");
    let (status, body) = json_body(&h.relay.handle(req).await);
    assert_eq!(status, 400);
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn transport_failure_marks_account_error() {
    let upstream = ScriptedUpstream::new(|_| {
        Canned::Fail(TransportError {
            kind: TransportErrorKind::Connect,
            message: "connection refused".to_string(),
        })
    });
    let h = harness(false, upstream);

    let (status, body) = json_body(
        &h.relay
            .handle(inbound(json!({"model": "m", "messages": []})))
            .await,
    );
    assert_eq!(status, 502);
    assert_eq!(body["error"]["type"], "upstream_error");

    let errors = h.accounts.errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, "serve-1");
    assert!(errors[0].1.contains("connection refused"));
}

#[tokio::test]
async fn timeout_maps_to_504() {
    let upstream = ScriptedUpstream::new(|_| {
        Canned::Fail(TransportError {
            kind: TransportErrorKind::Timeout,
            message: "timed out".to_string(),
        })
    });
    let h = harness(false, upstream);
    let (status, _) = json_body(
        &h.relay
            .handle(inbound(json!({"model": "m", "messages": []})))
            .await,
    );
    assert_eq!(status, 504);
}

#[tokio::test]
async fn buffered_response_records_usage_and_quota() {
    let upstream = ScriptedUpstream::new(|_| Canned::Json {
        status: 200,
        body: Bytes::from(
            json!({
                "id": "msg_1",
                "content": [{"type": "text", "text": "hello"}],
                "usage": {
                    "input_tokens": 50,
                    "output_tokens": 10,
                    "input_tokens_details": { "cached_tokens": 20 }
                }
            })
            .to_string(),
        ),
    });
    let h = harness(false, upstream);

    let (status, body) = json_body(
        &h.relay
            .handle(inbound(json!({"model": "claude-sonnet-4", "messages": []})))
            .await,
    );
    assert_eq!(status, 200);
    assert_eq!(body["id"], "msg_1");

    let records = h.recorder.records.lock().unwrap().clone();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.account_id, "serve-1");
    assert_eq!(record.api_key_id.as_deref(), Some("key-1"));
    assert_eq!(record.model, "claude-sonnet-4");
    assert_eq!(record.input_tokens, 50);
    assert_eq!(record.cached_read_tokens, 20);
    assert_eq!(record.actual_input_tokens, 30);

    // dailyQuota is 10.0, so the flat cost lands in the quota ledger.
    let quota = h.accounts.quota.lock().unwrap().clone();
    assert_eq!(quota, vec![("serve-1".to_string(), 0.25)]);
    assert_eq!(h.accounts.touched.lock().unwrap().clone(), vec!["serve-1"]);
}

#[tokio::test]
async fn streaming_forwards_raw_chunks_and_records_terminal_usage() {
    let events = [
        json!({"type": "message_start", "message": {"id": "m1", "model": "claude-sonnet-4"}}),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hi."}}),
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"input_tokens": 7, "output_tokens": 3}}),
        json!({"type": "message_stop"}),
    ];
    let chunks: Vec<Bytes> = events.iter().map(sse_chunk).collect();
    let expected = chunks.clone();
    let upstream = ScriptedUpstream::new(move |_| Canned::Stream {
        status: 200,
        chunks: chunks.clone(),
    });
    let h = harness(false, upstream);

    let response = h
        .relay
        .handle(inbound(
            json!({"model": "claude-sonnet-4", "messages": [], "stream": true}),
        ))
        .await;
    let (status, received) = collect_stream(response).await;
    assert_eq!(status, 200);
    assert_eq!(received, expected);

    let records = h.recorder.records.lock().unwrap().clone();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].input_tokens, 7);
    assert_eq!(records[0].output_tokens, 3);
    assert_eq!(records[0].model, "claude-sonnet-4");
    assert!(h.scheduler.rate_limited.lock().unwrap().is_empty());
}

#[tokio::test]
async fn in_stream_rate_limit_signal_reaches_scheduler() {
    let events = [
        json!({"type": "message_start", "message": {"id": "m1"}}),
        json!({"type": "error", "error": {"type": "usage_limit_reached", "resets_in_seconds": 45}}),
    ];
    let chunks: Vec<Bytes> = events.iter().map(sse_chunk).collect();
    let upstream = ScriptedUpstream::new(move |_| Canned::Stream {
        status: 200,
        chunks: chunks.clone(),
    });
    let h = harness(false, upstream);

    let response = h
        .relay
        .handle(inbound(json!({"model": "m", "messages": [], "stream": true})))
        .await;
    let (_, _) = collect_stream(response).await;

    let calls = h.scheduler.rate_limited.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].3, Some(45));
}

#[tokio::test]
async fn translated_stream_rewrites_text_deltas_only() {
    let events = [
        json!({"type": "message_start", "message": {"id": "m1"}}),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "All done."}}),
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "message_stop"}),
    ];
    let chunks: Vec<Bytes> = events.iter().map(sse_chunk).collect();
    let upstream = ScriptedUpstream::new(move |req| {
        if req.url.starts_with("https://translator.example") {
            let body: Value = serde_json::from_slice(req.body.as_deref().unwrap()).unwrap();
            let prompt = body["messages"][1]["content"].as_str().unwrap();
            let text = prompt.split_once("\n\n").map(|(_, t)| t).unwrap_or(prompt);
            Canned::Json {
                status: 200,
                body: Bytes::from(
                    json!({"choices": [{"message": {"content": format!("中文:{text}")}}]})
                        .to_string(),
                ),
            }
        } else {
            Canned::Stream {
                status: 200,
                chunks: chunks.clone(),
            }
        }
    });
    let h = harness(true, upstream);

    let response = h
        .relay
        .handle(inbound(json!({"model": "m", "messages": [], "stream": true})))
        .await;
    let (status, received) = collect_stream(response).await;
    assert_eq!(status, 200);

    let mut acc = SseAccumulator::new();
    let mut frames = Vec::new();
    for chunk in &received {
        frames.extend(acc.push_bytes(chunk));
    }
    frames.extend(acc.finish());
    let values: Vec<Value> = frames.iter().filter_map(|f| f.json()).collect();

    let types: Vec<&str> = values
        .iter()
        .filter_map(|v| v["type"].as_str())
        .collect();
    assert_eq!(
        types,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "message_stop"
        ]
    );
    let delta = values
        .iter()
        .find(|v| v["type"] == "content_block_delta")
        .unwrap();
    assert_eq!(delta["delta"]["text"], "中文:All done.");

    // The relay called both the serving upstream and the translator.
    let urls: Vec<String> = h.upstream.requests().iter().map(|r| r.url.clone()).collect();
    assert!(urls.iter().any(|u| u.starts_with("https://api.example.com")));
    assert!(urls.iter().any(|u| u.starts_with("https://translator.example")));
}

#[tokio::test]
async fn other_4xx_is_forwarded_verbatim() {
    let upstream = ScriptedUpstream::new(|_| Canned::Json {
        status: 422,
        body: Bytes::from_static(br#"{"error":{"type":"invalid_request_error","message":"bad model"}}"#),
    });
    let h = harness(false, upstream);
    let (status, body) = json_body(
        &h.relay
            .handle(inbound(json!({"model": "m", "messages": []})))
            .await,
    );
    assert_eq!(status, 422);
    assert_eq!(body["error"]["message"], "bad model");
    assert!(h.scheduler.rate_limited.lock().unwrap().is_empty());
    assert!(h.scheduler.unauthorized.lock().unwrap().is_empty());
}

#[tokio::test]
async fn connection_test_streams_probe_events() {
    let chunks = vec![
        Bytes::from(format!(
            "data: {}\n\n",
            json!({"choices": [{"delta": {"content": "Hello"}}]})
        )),
        Bytes::from(format!(
            "data: {}\n\n",
            json!({"choices": [{"delta": {"content": " there"}}]})
        )),
        Bytes::from_static(b"data: [DONE]\n\n"),
    ];
    let upstream = ScriptedUpstream::new(move |_| Canned::Stream {
        status: 200,
        chunks: chunks.clone(),
    });
    let h = harness(false, upstream);

    let (tx, mut rx) = mpsc::channel::<Bytes>(32);
    run_connection_test("serve-1", h.accounts.clone(), h.upstream.clone(), tx).await;

    let mut acc = SseAccumulator::new();
    let mut values = Vec::new();
    while let Ok(chunk) = rx.try_recv() {
        for frame in acc.push_bytes(&chunk) {
            if let Some(value) = frame.json() {
                values.push(value);
            }
        }
    }

    let types: Vec<&str> = values.iter().filter_map(|v| v["type"].as_str()).collect();
    assert_eq!(
        types,
        vec!["test_start", "content", "content", "message_stop", "test_complete"]
    );
    assert_eq!(values[1]["text"], "Hello");
    assert_eq!(values.last().unwrap()["success"], json!(true));

    let probe = &h.upstream.requests()[0];
    assert_eq!(probe.url, "https://api.example.com/v1/chat/completions");
    let body: Value = serde_json::from_slice(probe.body.as_deref().unwrap()).unwrap();
    assert_eq!(body["model"], "gpt-4o-mini");
    assert_eq!(body["max_tokens"], json!(100));
    assert_eq!(body["stream"], json!(true));
}

#[tokio::test]
async fn connection_test_reports_upstream_failure() {
    let upstream = ScriptedUpstream::new(|_| Canned::Json {
        status: 403,
        body: Bytes::from_static(br#"{"error":{"message":"forbidden region"}}"#),
    });
    let h = harness(false, upstream);

    let (tx, mut rx) = mpsc::channel::<Bytes>(32);
    run_connection_test("serve-1", h.accounts.clone(), h.upstream.clone(), tx).await;

    let mut acc = SseAccumulator::new();
    let mut values = Vec::new();
    while let Ok(chunk) = rx.try_recv() {
        for frame in acc.push_bytes(&chunk) {
            if let Some(value) = frame.json() {
                values.push(value);
            }
        }
    }
    let last = values.last().unwrap();
    assert_eq!(last["type"], "test_complete");
    assert_eq!(last["success"], json!(false));
    assert_eq!(last["error"], "forbidden region");
}
