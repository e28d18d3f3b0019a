//! Cluster leadership via a session-scoped Postgres advisory lock, held on
//! a dedicated connection for the daemon's lifetime. Losing the connection
//! releases the lock automatically; another server picks it up on its next
//! retry.

use sqlx::{Connection, PgConnection};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::LEADER_RETRY_INTERVAL_SECS;

#[derive(Clone)]
pub struct Leader {
    is_leader: Arc<AtomicBool>,
}

impl Leader {
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Spawns the background task holding (or retrying) the advisory lock.
    pub fn spawn(database_url: String, cancel: CancellationToken) -> Self {
        let is_leader = Arc::new(AtomicBool::new(false));
        let flag = is_leader.clone();
        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                match PgConnection::connect(&database_url).await {
                    Ok(mut conn) => {
                        let acquired: Option<bool> =
                            sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext('cluster_leader')::bigint)")
                                .fetch_one(&mut conn)
                                .await
                                .ok();
                        if acquired == Some(true) {
                            flag.store(true, Ordering::SeqCst);
                            tracing::info!("acquired cluster_leader advisory lock");
                            // Hold the connection open with a periodic keepalive;
                            // any failure drops leadership and falls through to retry.
                            loop {
                                tokio::select! {
                                    _ = cancel.cancelled() => {
                                        flag.store(false, Ordering::SeqCst);
                                        return;
                                    }
                                    _ = tokio::time::sleep(Duration::from_secs(*LEADER_RETRY_INTERVAL_SECS)) => {
                                        if sqlx::query("SELECT 1").execute(&mut conn).await.is_err() {
                                            tracing::warn!("leader connection lost, releasing leadership");
                                            flag.store(false, Ordering::SeqCst);
                                            break;
                                        }
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "leader election connection failed, retrying");
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(*LEADER_RETRY_INTERVAL_SECS)) => {}
                }
            }
        });
        Self { is_leader }
    }
}
