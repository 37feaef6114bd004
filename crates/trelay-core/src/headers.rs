use trelay_common::{Account, Headers, header_set};

/// Headers never forwarded upstream: hop-by-hop plumbing, routing headers,
/// and whatever credentials the client presented to the relay itself.
const STRIP_HEADERS: [&str; 12] = [
    "host",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
    "authorization",
    "x-api-key",
];

/// Build the upstream header set from the filtered inbound headers plus the
/// account's credentials.
pub fn build_upstream_headers(inbound: &Headers, account: &Account) -> Headers {
    let mut headers: Headers = inbound
        .iter()
        .filter(|(name, _)| !STRIP_HEADERS.contains(&name.to_ascii_lowercase().as_str()))
        .cloned()
        .collect();

    header_set(
        &mut headers,
        "Authorization",
        format!("Bearer {}", account.api_key),
    );
    header_set(&mut headers, "Content-Type", "application/json");
    if let Some(user_agent) = &account.user_agent {
        header_set(&mut headers, "User-Agent", user_agent.clone());
    }
    headers
}
