use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use wreq::{Client, Method, Proxy};

use crate::headers::Headers;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl From<HttpMethod> for Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Delete => Method::DELETE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamHttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub is_stream: bool,
    /// Optional per-request outbound proxy URL.
    pub proxy: Option<String>,
}

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

impl UpstreamBody {
    /// Drain the body into one buffer. Bounded by the sender side closing.
    pub async fn collect(self) -> Bytes {
        match self {
            UpstreamBody::Bytes(bytes) => bytes,
            UpstreamBody::Stream(mut rx) => {
                let mut buf = Vec::new();
                while let Some(chunk) = rx.recv().await {
                    buf.extend_from_slice(&chunk);
                }
                Bytes::from(buf)
            }
        }
    }
}

#[derive(Debug)]
pub struct UpstreamHttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Connect,
    Dns,
    Tls,
    Timeout,
    ReadTimeout,
    Other,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("upstream transport error ({kind:?}): {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    fn from_wreq(err: wreq::Error) -> Self {
        let message = err.to_string();
        let lower = message.to_ascii_lowercase();
        let kind = if err.is_timeout() {
            if lower.contains("read") || lower.contains("idle") {
                TransportErrorKind::ReadTimeout
            } else {
                TransportErrorKind::Timeout
            }
        } else if lower.contains("dns") || lower.contains("resolve") {
            TransportErrorKind::Dns
        } else if lower.contains("tls") || lower.contains("ssl") || lower.contains("certificate") {
            TransportErrorKind::Tls
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else {
            TransportErrorKind::Other
        };
        Self { kind, message }
    }
}

pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, TransportError>> + Send + 'a>>;
}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(600),
            stream_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl UpstreamClientConfig {
    pub fn with_request_timeout(timeout: Duration) -> Self {
        Self {
            request_timeout: timeout,
            ..Default::default()
        }
    }
}

/// wreq-backed client. The direct (proxyless) client is built up front;
/// proxied variants are created on first use and reused per proxy URL.
pub struct WreqUpstreamClient {
    config: UpstreamClientConfig,
    direct: Client,
    proxied: RwLock<HashMap<String, Client>>,
}

impl WreqUpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Result<Self, TransportError> {
        let direct = Self::build(&config, None)?;
        Ok(Self {
            config,
            direct,
            proxied: RwLock::new(HashMap::new()),
        })
    }

    fn build(
        config: &UpstreamClientConfig,
        proxy: Option<&str>,
    ) -> Result<Client, TransportError> {
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .read_timeout(config.stream_idle_timeout);
        if let Some(url) = proxy {
            builder = builder.proxy(Proxy::all(url).map_err(TransportError::from_wreq)?);
        }
        builder.build().map_err(TransportError::from_wreq)
    }

    fn client_for(&self, proxy: Option<&str>) -> Result<Client, TransportError> {
        let Some(proxy) = proxy else {
            return Ok(self.direct.clone());
        };
        {
            let cache = self.proxied.read().unwrap_or_else(|e| e.into_inner());
            if let Some(client) = cache.get(proxy) {
                return Ok(client.clone());
            }
        }
        let built = Self::build(&self.config, Some(proxy))?;
        let mut cache = self.proxied.write().unwrap_or_else(|e| e.into_inner());
        Ok(cache.entry(proxy.to_string()).or_insert(built).clone())
    }
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, TransportError>> + Send + 'a>>
    {
        Box::pin(async move {
            let client = self.client_for(active_proxy(req.proxy.as_deref()))?;

            let mut call = client.request(req.method.into(), &req.url);
            for (name, value) in &req.headers {
                call = call.header(name, value);
            }
            if let Some(body) = req.body {
                call = call.body(body);
            }

            let resp = call.send().await.map_err(TransportError::from_wreq)?;
            let status = resp.status().as_u16();
            let ok = resp.status().is_success();
            let headers = copy_headers(resp.headers());

            if req.is_stream && ok {
                return Ok(UpstreamHttpResponse {
                    status,
                    headers,
                    body: UpstreamBody::Stream(pump_body(
                        resp,
                        self.config.stream_idle_timeout,
                    )),
                });
            }

            let bytes = resp.bytes().await.map_err(TransportError::from_wreq)?;
            Ok(UpstreamHttpResponse {
                status,
                headers,
                body: UpstreamBody::Bytes(bytes),
            })
        })
    }
}

fn active_proxy(proxy: Option<&str>) -> Option<&str> {
    proxy.map(str::trim).filter(|p| !p.is_empty())
}

/// Forward body chunks into a channel. The pump stops when the reader goes
/// away, the stream errors, or it sits idle past the timeout.
fn pump_body(resp: wreq::Response, idle: Duration) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut stream = resp.bytes_stream();
        while let Ok(Some(Ok(chunk))) = tokio::time::timeout(idle, stream.next()).await {
            if tx.send(chunk).await.is_err() {
                return;
            }
        }
    });
    rx
}

fn copy_headers(map: &wreq::header::HeaderMap) -> Headers {
    map.iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|text| (name.to_string(), text.to_string()))
        })
        .collect()
}
