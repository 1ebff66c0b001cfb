use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{info, warn};

use crate::state::AppState;
use crate::upload::sweep_staging_dir;

const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const SWEEP_MAX_AGE: Duration = Duration::from_secs(10 * 60);
const ROTATE_INTERVAL: Duration = Duration::from_secs(5 * 60);
const ROTATE_THRESHOLD_BYTES: u64 = 100 * 1024 * 1024;
const ROTATE_BACKUPS_KEPT: usize = 5;

/// Spawns the background upkeep the lifecycle manager owns alongside the
/// scheduler's own idle-limiter reaper (`Scheduler::new` starts that one):
/// the staging-directory sweeper and access-log rotation, each on its own
/// fixed-interval ticker.
pub fn run_maintenance_tasks(state: Arc<AppState>) {
    let staging_dir = PathBuf::from(state.config.staging_dir.clone());
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            sweep_staging_dir(&staging_dir, SWEEP_MAX_AGE).await;
        }
    });

    let access_log_path = PathBuf::from(state.config.access_log_path.clone());
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ROTATE_INTERVAL);
        loop {
            ticker.tick().await;
            rotate_access_log(&access_log_path).await;
        }
    });
}

async fn rotate_access_log(path: &Path) {
    let Ok(metadata) = tokio::fs::metadata(path).await else {
        return;
    };
    if metadata.len() <= ROTATE_THRESHOLD_BYTES {
        return;
    }

    let suffix = OffsetDateTime::now_utc().unix_timestamp();
    let rotated = path.with_extension(format!("{suffix}.log"));
    if let Err(err) = tokio::fs::rename(path, &rotated).await {
        warn!(target: "tollgate::lifecycle", error = %err, "failed to rotate access log");
        return;
    }
    info!(target: "tollgate::lifecycle", rotated = %rotated.display(), "rotated access log");

    prune_old_backups(path).await;
}

async fn prune_old_backups(path: &Path) {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return;
    };
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("access")
        .to_string();

    let Ok(mut entries) = tokio::fs::read_dir(parent).await else {
        return;
    };
    let mut backups = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(&stem) && name != path.file_name().and_then(|n| n.to_str()).unwrap_or("") {
            if let Ok(metadata) = entry.metadata().await {
                if let Ok(modified) = metadata.modified() {
                    backups.push((modified, entry.path()));
                }
            }
        }
    }
    backups.sort_by_key(|(modified, _)| std::cmp::Reverse(*modified));
    for (_, stale) in backups.into_iter().skip(ROTATE_BACKUPS_KEPT) {
        if tokio::fs::remove_file(&stale).await.is_ok() {
            info!(target: "tollgate::lifecycle", path = %stale.display(), "pruned old access log backup");
        }
    }
}

/// Resolves once a shutdown signal arrives: Ctrl-C everywhere, plus SIGTERM
/// on unix. Callers pass this to `axum::serve(...).with_graceful_shutdown`.
pub async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let Ok(mut sigterm) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        else {
            std::future::pending::<()>().await;
            return;
        };
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!(target: "tollgate::lifecycle", "shutdown signal received, draining scheduler");
    state.scheduler.begin_drain();

    let deadline = Duration::from_secs(state.config.drain_deadline_secs);
    if state.scheduler.wait_for_drain(deadline).await {
        info!(target: "tollgate::lifecycle", "scheduler drained, shutting down");
    } else {
        warn!(
            target: "tollgate::lifecycle",
            deadline_secs = state.config.drain_deadline_secs,
            "drain deadline elapsed with work still outstanding, shutting down anyway"
        );
    }

    state.usage.flush().await;

    let staging_dir = PathBuf::from(state.config.staging_dir.clone());
    sweep_staging_dir(&staging_dir, Duration::ZERO).await;
}
