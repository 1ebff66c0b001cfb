//! The proxy's request pipeline, scheduler, upstream transport, and ambient
//! services (key store, metrics, usage log, upload staging), wired together
//! behind `AppState`. The HTTP server binding itself lives in the `tollgate`
//! binary crate; everything here is transport-agnostic enough to unit test
//! without a socket.

mod allowlist;
mod error;
mod keystore;
mod lifecycle;
mod metrics;
mod pipeline;
mod scheduler;
mod state;
mod upload;
mod upstream;
mod usage;

pub use allowlist::AllowlistPolicy;
pub use error::PipelineError;
pub use keystore::KeyStore;
pub use lifecycle::{run_maintenance_tasks, shutdown_signal};
pub use metrics::MetricsSink;
pub use pipeline::{cors_preflight_response, proxy_handler};
pub use scheduler::{LimiterSnapshot, ScheduleError, Scheduler};
pub use state::AppState;
pub use upload::{sweep_staging_dir, StagedUpload, UploadSlots};
pub use upstream::{ReqwestTransport, Transport, TransportError, UpstreamRequest, UpstreamResponse};
pub use usage::{today_utc, UsageRecord, UsageSink};
