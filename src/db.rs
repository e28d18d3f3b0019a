//! Database bootstrap, the WAL listener, and the bootstrap scan.

use serde::Deserialize;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::PgPool;
use std::time::Duration;

use crate::scheduler::{EntityKey, EntityKind, Scheduler};

pub const NOTIFY_CHANNEL: &str = "zeitwork_changes";

/// Tables the WAL listener subscribes to, paired with the entity kind they
/// feed into the scheduler.
pub const WATCHED_TABLES: &[(&str, EntityKind)] = &[
    ("servers", EntityKind::Server),
    ("images", EntityKind::Image),
    ("builds", EntityKind::Build),
    ("deployments", EntityKind::Deployment),
    ("vms", EntityKind::Vm),
    ("domains", EntityKind::Domain),
];

pub async fn connect() -> sqlx::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(&crate::config::DATABASE_URL)
        .await
}

pub async fn migrate(pool: &PgPool) -> sqlx::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ChangeNotification {
    table: String,
    id: uuid::Uuid,
}

/// Subscribes to the logical-replication-backed notify channel for every
/// watched table and schedules a reconcile for each change. Runs until the
/// cancellation token fires; reconnects with backoff on connection loss --
/// a dropped window of notifications is harmless because reconciliation is
/// level-triggered.
pub async fn run_wal_listener(
    pool: PgPool,
    scheduler: Scheduler,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut backoff = Duration::from_secs(1);
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match PgListener::connect_with(&pool).await {
            Ok(mut listener) => {
                if let Err(e) = listener.listen(NOTIFY_CHANNEL).await {
                    tracing::warn!(error = %e, "failed to subscribe to notify channel, retrying");
                } else {
                    backoff = Duration::from_secs(1);
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            notification = listener.recv() => {
                                match notification {
                                    Ok(notification) => handle_notification(&scheduler, notification.payload()),
                                    Err(e) => {
                                        tracing::warn!(error = %e, "wal listener connection lost, reconnecting");
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to connect wal listener, retrying");
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(Duration::from_secs(30));
    }
}

fn handle_notification(scheduler: &Scheduler, payload: &str) {
    let parsed: ChangeNotification = match serde_json::from_str(payload) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, payload, "unparseable change notification, ignoring");
            return;
        }
    };
    let Some(kind) = WATCHED_TABLES
        .iter()
        .find(|(table, _)| *table == parsed.table)
        .map(|(_, kind)| *kind)
    else {
        return;
    };
    scheduler.schedule_now(EntityKey { kind, id: parsed.id });
}

/// Enumerates every live row in each watched table and schedules it --
/// level-triggered recovery from any lost WAL event. Running this twice in
/// a row schedules the same set of ids both times.
pub async fn bootstrap_scan(pool: &PgPool, scheduler: &Scheduler) -> sqlx::Result<()> {
    let servers: Vec<uuid::Uuid> = sqlx::query_scalar("SELECT id FROM servers").fetch_all(pool).await?;
    for id in servers {
        scheduler.schedule_now(EntityKey { kind: EntityKind::Server, id });
    }
    let images: Vec<uuid::Uuid> = sqlx::query_scalar("SELECT id FROM images").fetch_all(pool).await?;
    for id in images {
        scheduler.schedule_now(EntityKey { kind: EntityKind::Image, id });
    }
    let builds: Vec<uuid::Uuid> = sqlx::query_scalar(
        "SELECT id FROM builds WHERE status NOT IN ('successful', 'failed')",
    )
    .fetch_all(pool)
    .await?;
    for id in builds {
        scheduler.schedule_now(EntityKey { kind: EntityKind::Build, id });
    }
    let deployments: Vec<uuid::Uuid> = sqlx::query_scalar(
        "SELECT id FROM deployments WHERE status NOT IN ('stopped', 'failed')",
    )
    .fetch_all(pool)
    .await?;
    for id in deployments {
        scheduler.schedule_now(EntityKey { kind: EntityKind::Deployment, id });
    }
    let vms: Vec<uuid::Uuid> =
        sqlx::query_scalar("SELECT id FROM vms WHERE deleted_at IS NULL AND status != 'stopped'")
            .fetch_all(pool)
            .await?;
    for id in vms {
        scheduler.schedule_now(EntityKey { kind: EntityKind::Vm, id });
    }
    let domains: Vec<uuid::Uuid> = sqlx::query_scalar(
        "SELECT id FROM domains WHERE verified_at IS NULL AND deleted_at IS NULL",
    )
    .fetch_all(pool)
    .await?;
    for id in domains {
        scheduler.schedule_now(EntityKey { kind: EntityKind::Domain, id });
    }
    Ok(())
}
