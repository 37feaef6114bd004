use async_trait::async_trait;

use trelay_protocol::usage::UsageObservation;

/// One usage record, handed to the external persistence layer after every
/// successful upstream exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub api_key_id: Option<String>,
    pub account_id: String,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cached_read_tokens: i64,
    pub cache_creation_tokens: i64,
    pub actual_input_tokens: i64,
    pub total_tokens: i64,
}

impl UsageRecord {
    pub fn from_observation(
        api_key_id: Option<String>,
        account_id: String,
        usage: &UsageObservation,
    ) -> Self {
        Self {
            api_key_id,
            account_id,
            model: usage.model.clone(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cached_read_tokens: usage.cached_read_tokens,
            cache_creation_tokens: usage.cache_creation_tokens,
            actual_input_tokens: usage.actual_input_tokens,
            total_tokens: usage.total_tokens,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("usage record failed: {0}")]
pub struct RecordError(pub String);

#[async_trait]
pub trait UsageRecorder: Send + Sync {
    async fn record_usage(&self, record: UsageRecord) -> Result<(), RecordError>;
}

/// External cost-rate table, reduced to the one call the relay makes.
pub trait CostCalculator: Send + Sync {
    fn cost(&self, model: &str, usage: &UsageObservation) -> f64;
}

#[derive(Debug, Default)]
pub struct NoopUsageRecorder;

#[async_trait]
impl UsageRecorder for NoopUsageRecorder {
    async fn record_usage(&self, _record: UsageRecord) -> Result<(), RecordError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ZeroCost;

impl CostCalculator for ZeroCost {
    fn cost(&self, _model: &str, _usage: &UsageObservation) -> f64 {
        0.0
    }
}
