pub mod error;
pub mod headers;
pub mod http;
pub mod recorder;
pub mod relay;
pub mod scheduler;

pub use conn_test::run_connection_test;
pub use error::RelayError;
pub use http::{AppState, router};
pub use recorder::{CostCalculator, NoopUsageRecorder, RecordError, UsageRecord, UsageRecorder, ZeroCost};
pub use relay::{InboundRequest, RelayCore, RelayDeps, RelayResponse};
pub use scheduler::{NoopScheduler, SchedulerCallbacks, SchedulerError};
