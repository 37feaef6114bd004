use bytes::Bytes;
use serde_json::json;

/// Client-facing relay error: plain data only, no live bodies.
#[derive(Debug, Clone)]
pub struct RelayError {
    pub status: u16,
    pub body: Bytes,
}

impl RelayError {
    pub fn new(status: u16, error_type: &str, message: impl AsRef<str>) -> Self {
        let body = json!({
            "error": { "type": error_type, "message": message.as_ref() }
        });
        Self {
            status,
            body: Bytes::from(body.to_string()),
        }
    }

    pub fn account_not_found(account_id: &str) -> Self {
        Self::new(
            404,
            "not_found_error",
            format!("account not found: {account_id}"),
        )
    }

    pub fn bad_request(message: impl AsRef<str>) -> Self {
        Self::new(400, "invalid_request_error", message)
    }
}
