use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

/// One framed SSE message: optional `event:` name plus the joined `data:`
/// payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseMessage {
    pub event: Option<String>,
    pub data: String,
}

impl SseMessage {
    /// The OpenAI-style terminal sentinel. Forwarded as received, never
    /// synthesized.
    pub fn is_done(&self) -> bool {
        self.data == "[DONE]"
    }

    /// Decode the payload. `[DONE]` and malformed JSON both yield `None`;
    /// malformed payloads are logged and skipped, never fatal.
    pub fn json(&self) -> Option<Value> {
        if self.data.is_empty() || self.is_done() {
            return None;
        }
        match serde_json::from_str(&self.data) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::debug!(event = "sse_decode_failed", error = %err, data = %self.data);
                None
            }
        }
    }

    /// Re-frame the message as wire bytes, preserving the `event:` line when
    /// present and the data payload verbatim.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = Vec::with_capacity(self.data.len() + 32);
        if let Some(name) = &self.event {
            out.extend_from_slice(b"event: ");
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b"\n");
        }
        out.extend_from_slice(b"data: ");
        out.extend_from_slice(self.data.as_bytes());
        out.extend_from_slice(b"\n\n");
        Bytes::from(out)
    }
}

/// Incremental SSE framer over a chunked byte stream.
///
/// Events terminate on a blank line; the tail after the last terminator is
/// retained for the next chunk.
#[derive(Debug, Default)]
pub struct SseAccumulator {
    buffer: String,
}

impl SseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseMessage> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseMessage> {
        self.buffer.push_str(chunk);
        let mut messages = Vec::new();

        while let Some(pos) = self.buffer.find("\n\n") {
            let frame = self.buffer[..pos].to_string();
            self.buffer.drain(..pos + 2);
            if let Some(message) = parse_frame(&frame) {
                messages.push(message);
            }
        }

        messages
    }

    /// Drain whatever is still buffered at end-of-stream.
    pub fn finish(&mut self) -> Vec<SseMessage> {
        let remainder = std::mem::take(&mut self.buffer);
        let mut messages = Vec::new();
        if !remainder.trim().is_empty()
            && let Some(message) = parse_frame(&remainder)
        {
            messages.push(message);
        }
        messages
    }
}

fn parse_frame(frame: &str) -> Option<SseMessage> {
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in frame.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with(':') {
            continue;
        }
        if let Some(value) = line.strip_prefix("event:") {
            let value = value.trim();
            event = if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            };
            continue;
        }
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.trim());
        }
    }

    if event.is_none() && data_lines.is_empty() {
        return None;
    }
    Some(SseMessage {
        event,
        data: data_lines.join("\n"),
    })
}

/// Frame an outgoing value as `data: <json>\n\n`.
pub fn sse_json_bytes<T: Serialize>(value: &T) -> Option<Bytes> {
    let payload = serde_json::to_vec(value).ok()?;
    let mut data = Vec::with_capacity(payload.len() + 8);
    data.extend_from_slice(b"data: ");
    data.extend_from_slice(&payload);
    data.extend_from_slice(b"\n\n");
    Some(Bytes::from(data))
}
