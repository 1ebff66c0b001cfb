mod limiter;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tollgate_common::{RateLimitConfig, RateLimitTier};
use tracing::info;

use crate::metrics::MetricsSink;

pub use limiter::LimiterSnapshot;
use limiter::Limiter;

/// Why `Scheduler::schedule` refused to admit a submission.
#[derive(Debug, Clone, Copy)]
pub enum ScheduleError {
    /// The scheduler is draining for shutdown; no new work is admitted.
    Draining,
    /// The named limiter's queue was already at its high-water mark.
    QueueOverflow { limiter: &'static str },
}

const IDLE_TTL: Duration = Duration::from_secs(3600);
const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Two-level "Bottleneck"-style chained rate limiter: a single global
/// limiter and a per-principal limiter created lazily on first use.
///
/// Grounded on the teacher's `CredentialPool`: a registry of per-key state
/// guarded by `tokio::sync::RwLock<HashMap<...>>`, with a background task
/// spawned at construction time for periodic maintenance (there it recovers
/// unavailable credentials; here it refills reservoirs and reaps idle
/// per-user limiters).
pub struct Scheduler {
    global: Arc<Limiter>,
    per_user: RwLock<HashMap<String, Arc<Limiter>>>,
    per_user_tier: RateLimitTier,
    draining: std::sync::atomic::AtomicBool,
    metrics: Arc<MetricsSink>,
}

impl Scheduler {
    pub fn new(config: &RateLimitConfig, metrics: Arc<MetricsSink>) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            global: Limiter::spawn("global", config.global),
            per_user: RwLock::new(HashMap::new()),
            per_user_tier: config.per_user,
            draining: std::sync::atomic::AtomicBool::new(false),
            metrics,
        });
        scheduler.clone().spawn_reaper();
        scheduler
    }

    /// Runs `work` once both the per-user and global limiters admit it.
    /// Locks are acquired per-user-first-then-global on the admission path,
    /// and released in the reverse order on completion, to avoid deadlock
    /// between concurrently submitting principals.
    pub async fn schedule<F, Fut, T>(
        &self,
        principal_key: &str,
        work: F,
    ) -> Result<T, ScheduleError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if self.draining.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ScheduleError::Draining);
        }

        let user_limiter = self.user_limiter(principal_key).await;
        let _user_guard = user_limiter
            .admit()
            .await
            .map_err(|_| ScheduleError::QueueOverflow { limiter: "per_user" })?;
        let _global_guard = self
            .global
            .admit()
            .await
            .map_err(|_| ScheduleError::QueueOverflow { limiter: "global" })?;

        Ok(work().await)
    }

    pub async fn global_snapshot(&self) -> LimiterSnapshot {
        self.global.snapshot().await
    }

    pub async fn active_user_count(&self) -> usize {
        self.per_user.read().await.len()
    }

    /// Stops admitting new submissions; existing admissions are unaffected.
    /// Callers should combine this with awaiting in-flight work externally.
    pub fn begin_drain(&self) {
        self.draining.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Polls until the global limiter and every per-user limiter are
    /// quiescent (no running or queued work), or `deadline` elapses.
    /// Returns `true` if drain completed, `false` on timeout.
    pub async fn wait_for_drain(&self, deadline: Duration) -> bool {
        let wait = async {
            loop {
                let quiescent = self.global.is_quiescent()
                    && self.per_user.read().await.values().all(|l| l.is_quiescent());
                if quiescent {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        tokio::time::timeout(deadline, wait).await.is_ok()
    }

    async fn user_limiter(&self, principal_key: &str) -> Arc<Limiter> {
        if let Some(limiter) = self.per_user.read().await.get(principal_key) {
            return limiter.clone();
        }
        let mut guard = self.per_user.write().await;
        guard
            .entry(principal_key.to_string())
            .or_insert_with(|| Limiter::spawn(principal_key, self.per_user_tier))
            .clone()
    }

    fn spawn_reaper(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAP_INTERVAL);
            loop {
                ticker.tick().await;
                let mut guard = self.per_user.write().await;
                let before = guard.len();
                let mut reaped = Vec::new();
                guard.retain(|key, limiter| {
                    let idle = limiter.idle_since().elapsed() > IDLE_TTL && limiter.is_quiescent();
                    if idle {
                        reaped.push(key.clone());
                    }
                    !idle
                });
                if !reaped.is_empty() {
                    info!(
                        target: "tollgate::scheduler",
                        reaped = reaped.len(),
                        remaining = guard.len(),
                        was = before,
                        "reaped idle per-user limiters"
                    );
                }

                let global_snapshot = self.global.snapshot().await;
                self.metrics.set_limiter_state(
                    self.global.name(),
                    global_snapshot.running as i64,
                    global_snapshot.queued as i64,
                    global_snapshot.reservoir as i64,
                );

                // Per-user limiters are keyed by principal key, which must
                // never land in a metric label; report their aggregate
                // running/queued/reservoir under one series instead.
                let mut running = 0i64;
                let mut queued = 0i64;
                let mut reservoir = 0i64;
                for limiter in guard.values() {
                    let snapshot = limiter.snapshot().await;
                    running += snapshot.running as i64;
                    queued += snapshot.queued as i64;
                    reservoir += snapshot.reservoir as i64;
                }
                self.metrics
                    .set_limiter_state("per_user_aggregate", running, queued, reservoir);
                self.metrics.set_active_users(guard.len() as i64);
            }
        });
    }
}
