use std::sync::Arc;

use tollgate_common::AppConfig;

use crate::allowlist::AllowlistPolicy;
use crate::keystore::KeyStore;
use crate::metrics::MetricsSink;
use crate::scheduler::Scheduler;
use crate::upload::UploadSlots;
use crate::upstream::{ReqwestTransport, Transport};
use crate::usage::UsageSink;

/// Shared, `Arc`-wrapped context passed to every handler, mirroring the
/// teacher's `CoreState`/`AppState` split: everything a request needs to
/// run lives here rather than behind module-level globals.
pub struct AppState {
    pub config: AppConfig,
    pub key_store: Arc<KeyStore>,
    pub allowlist: AllowlistPolicy,
    pub scheduler: Arc<Scheduler>,
    pub transport: Arc<dyn Transport>,
    pub metrics: Arc<MetricsSink>,
    pub usage: UsageSink,
    pub upload_slots: UploadSlots,
    pub upload_max_concurrent: u32,
}

impl AppState {
    pub async fn bootstrap(config: AppConfig) -> anyhow::Result<Arc<Self>> {
        let key_store = KeyStore::start(config.key_file.clone()).await?;
        let allowlist = AllowlistPolicy::new(config.allowlist.clone());
        let metrics = Arc::new(MetricsSink::new()?);
        let scheduler = Scheduler::new(&config.rate_limiting, metrics.clone());
        let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(&config.http_client)?);
        let usage = UsageSink::start(config.usage_db_path.clone())?;
        let upload_max_concurrent = config.rate_limiting.per_user.concurrent_limit.max(1);
        let upload_slots = UploadSlots::new(upload_max_concurrent);

        Ok(Arc::new(Self {
            config,
            key_store,
            allowlist,
            scheduler,
            transport,
            metrics,
            usage,
            upload_slots,
            upload_max_concurrent,
        }))
    }
}
