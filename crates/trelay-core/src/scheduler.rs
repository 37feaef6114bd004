use async_trait::async_trait;

#[derive(Debug, Clone, thiserror::Error)]
#[error("scheduler callback failed: {0}")]
pub struct SchedulerError(pub String);

/// The two write-backs the relay makes into the external scheduler.
///
/// Both are fire-and-forget from the relay's point of view: a failure is
/// logged and never reaches the client.
#[async_trait]
pub trait SchedulerCallbacks: Send + Sync {
    async fn mark_rate_limited(
        &self,
        account_id: &str,
        provider: &str,
        session_hash: Option<&str>,
        resets_in_seconds: Option<i64>,
    ) -> Result<(), SchedulerError>;

    async fn mark_unauthorized(
        &self,
        account_id: &str,
        provider: &str,
        session_hash: Option<&str>,
        reason: &str,
    ) -> Result<(), SchedulerError>;
}

#[derive(Debug, Default)]
pub struct NoopScheduler;

#[async_trait]
impl SchedulerCallbacks for NoopScheduler {
    async fn mark_rate_limited(
        &self,
        _account_id: &str,
        _provider: &str,
        _session_hash: Option<&str>,
        _resets_in_seconds: Option<i64>,
    ) -> Result<(), SchedulerError> {
        Ok(())
    }

    async fn mark_unauthorized(
        &self,
        _account_id: &str,
        _provider: &str,
        _session_hash: Option<&str>,
        _reason: &str,
    ) -> Result<(), SchedulerError> {
        Ok(())
    }
}
