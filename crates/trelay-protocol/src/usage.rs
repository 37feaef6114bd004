use serde_json::Value;

/// Token counts extracted from a provider usage payload, normalized across
/// the field-name variants providers use.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UsageObservation {
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cached_read_tokens: i64,
    pub cache_creation_tokens: i64,
    /// Input tokens actually processed, i.e. not served from cache.
    pub actual_input_tokens: i64,
    pub total_tokens: i64,
}

/// Pull usage out of a response body or stream event.
///
/// Looks for the usage object at `usage`, `response.usage` (OpenAI
/// `response.completed` events) or `message.usage` (Anthropic
/// `message_start`). Returns `None` when no usage object is present.
pub fn extract_usage(value: &Value, requested_model: Option<&str>) -> Option<UsageObservation> {
    let usage = usage_node(value)?;

    let input_tokens = numeric(usage.get("input_tokens"))
        .or_else(|| numeric(usage.get("prompt_tokens")))
        .unwrap_or(0);
    let output_tokens = numeric(usage.get("output_tokens"))
        .or_else(|| numeric(usage.get("completion_tokens")))
        .unwrap_or(0);
    let details = usage.get("input_tokens_details");
    let cached_read_tokens = numeric(details.and_then(|d| d.get("cached_tokens"))).unwrap_or(0);
    let cache_creation_tokens = numeric(details.and_then(|d| d.get("cache_creation_input_tokens")))
        .or_else(|| numeric(details.and_then(|d| d.get("cache_creation_tokens"))))
        .or_else(|| numeric(usage.get("cache_creation_input_tokens")))
        .or_else(|| numeric(usage.get("cache_creation_tokens")))
        .unwrap_or(0);

    let total_tokens = numeric(usage.get("total_tokens"))
        .unwrap_or(input_tokens + output_tokens + cache_creation_tokens);

    Some(UsageObservation {
        model: resolve_model(value, requested_model),
        input_tokens,
        output_tokens,
        cached_read_tokens,
        cache_creation_tokens,
        actual_input_tokens: (input_tokens - cached_read_tokens).max(0),
        total_tokens,
    })
}

fn usage_node(value: &Value) -> Option<&Value> {
    let candidate = value
        .get("usage")
        .or_else(|| value.get("response").and_then(|r| r.get("usage")))
        .or_else(|| value.get("message").and_then(|m| m.get("usage")))?;
    candidate.is_object().then_some(candidate)
}

fn resolve_model(value: &Value, requested_model: Option<&str>) -> String {
    value
        .get("model")
        .or_else(|| value.get("response").and_then(|r| r.get("model")))
        .or_else(|| value.get("message").and_then(|m| m.get("model")))
        .and_then(|m| m.as_str())
        .map(|m| m.to_string())
        .or_else(|| requested_model.map(|m| m.to_string()))
        .unwrap_or_else(|| "gpt-4".to_string())
}

/// Defined, non-empty, finite numeric value; strings holding numbers count.
fn numeric(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => {
            if let Some(int) = n.as_i64() {
                Some(int)
            } else {
                n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)
            }
        }
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))
        }
        _ => None,
    }
}

/// In-stream rate-limit marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateLimitSignal {
    pub resets_in_seconds: Option<i64>,
}

const RATE_LIMIT_ERROR_TYPES: [&str; 3] = [
    "rate_limit_error",
    "usage_limit_reached",
    "rate_limit_exceeded",
];

/// Flag a payload carrying one of the known rate-limit error types, along
/// with any reset countdown it declares.
pub fn scan_rate_limit(value: &Value) -> Option<RateLimitSignal> {
    let error = value.get("error").unwrap_or(value);
    let error_type = error
        .get("type")
        .and_then(|t| t.as_str())
        .or_else(|| error.get("code").and_then(|c| c.as_str()))?;
    if !RATE_LIMIT_ERROR_TYPES.contains(&error_type) {
        return None;
    }
    Some(RateLimitSignal {
        resets_in_seconds: resets_in_seconds(value),
    })
}

/// `error.resets_in_seconds` / `error.resets_in`, wherever the error object
/// sits in the payload.
pub fn resets_in_seconds(value: &Value) -> Option<i64> {
    let error = value.get("error").unwrap_or(value);
    numeric(error.get("resets_in_seconds")).or_else(|| numeric(error.get("resets_in")))
}
