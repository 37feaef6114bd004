pub mod chat;
pub mod sse;
pub mod usage;

pub use chat::{ChatRequest, Content, ContentBlock, KnownBlock, Message, Role, SystemPrompt};
pub use sse::{SseAccumulator, SseMessage, sse_json_bytes};
pub use usage::{RateLimitSignal, UsageObservation, extract_usage, scan_rate_limit};
