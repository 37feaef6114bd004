pub mod cache;
pub mod code_guard;
pub mod lang;
pub mod request;
pub mod response;
pub mod sentence;
pub mod service;

pub use cache::{CacheStats, TranslationCache};
pub use code_guard::{CodeGuard, PlaceholderMap};
pub use lang::PrimaryLanguage;
pub use request::RequestTranslator;
pub use response::{ResponseTranslator, ResponseTranslatorStats, StreamWriter};
pub use sentence::SentenceBuffer;
pub use service::{TranslateError, TranslationPolicy, TranslationService};
