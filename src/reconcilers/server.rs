//! Server lifecycle: identity, registration, heartbeat, drain, and (as the
//! leader) dead-server failover.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use sqlx::PgPool;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SERVER_DATA_DIR;
use crate::leader::Leader;
use crate::scheduler::ReconcileOutcome;

#[derive(sqlx::FromRow, Clone)]
pub struct ServerRow {
    pub id: Uuid,
    pub hostname: String,
    pub internal_ip: String,
    pub ip_range: String,
    pub status: String,
    pub last_heartbeat_at: DateTime<Utc>,
}

fn identity_path() -> std::path::PathBuf {
    Path::new(SERVER_DATA_DIR.as_str()).join("server-id")
}

/// Reads the persisted server id, or generates and persists a new one on
/// first boot. A corrupt file fails startup loudly rather than silently
/// regenerating (which would orphan the old row's VMs).
pub async fn load_or_create_identity() -> Result<Uuid> {
    let path = identity_path();
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => {
            let trimmed = contents.trim();
            Uuid::parse_str(trimmed)
                .with_context(|| format!("corrupt server identity file at {}", path.display()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let id = crate::ids::new_id();
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, id.to_string()).await?;
            Ok(id)
        }
        Err(e) => bail!("failed to read server identity file at {}: {e}", path.display()),
    }
}

/// Next unused /20 by atomic counter over existing ip_range rows, carved
/// out of 10.0.0.0/8.
async fn allocate_ip_range(pool: &PgPool) -> Result<String> {
    let count: i64 = sqlx::query_scalar("SELECT count(*) FROM servers").fetch_one(pool).await?;
    let third_octet = (count * 16) % 256;
    let second_octet = 1 + (count * 16) / 256;
    Ok(format!("10.{second_octet}.{third_octet}.0/20"))
}

/// Upserts this server's row on startup, preserving its `ip_range` across
/// restarts.
pub async fn register(pool: &PgPool, id: Uuid, hostname: &str, internal_ip: &str) -> Result<ServerRow> {
    let existing: Option<ServerRow> =
        sqlx::query_as("SELECT id, hostname, internal_ip, ip_range, status, last_heartbeat_at FROM servers WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;

    let ip_range = match existing {
        Some(row) => row.ip_range,
        None => allocate_ip_range(pool).await?,
    };

    let row: ServerRow = sqlx::query_as(
        "INSERT INTO servers (id, hostname, internal_ip, ip_range, status, last_heartbeat_at)
         VALUES ($1, $2, $3, $4, 'active', now())
         ON CONFLICT (id) DO UPDATE SET
             hostname = EXCLUDED.hostname,
             internal_ip = EXCLUDED.internal_ip,
             status = 'active',
             last_heartbeat_at = now(),
             updated_at = now()
         RETURNING id, hostname, internal_ip, ip_range, status, last_heartbeat_at",
    )
    .bind(id)
    .bind(hostname)
    .bind(internal_ip)
    .bind(&ip_range)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn run_heartbeat_loop(pool: PgPool, id: Uuid, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(crate::config::heartbeat_interval());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                if let Err(e) = sqlx::query("UPDATE servers SET last_heartbeat_at = now(), updated_at = now() WHERE id = $1")
                    .bind(id)
                    .execute(&pool)
                    .await
                {
                    tracing::warn!(error = %e, "heartbeat update failed");
                }
            }
        }
    }
}

pub async fn run_host_route_sync_loop(pool: PgPool, id: Uuid, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(*crate::config::HOST_ROUTE_SYNC_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                if let Err(e) = crate::net::sync_host_routes(&pool, id, &cancel).await {
                    tracing::warn!(error = %e, "host route sync failed");
                }
            }
        }
    }
}

/// The per-entity reconcile handler for `EntityKind::Server`: drives the
/// drain migration pass when `status = draining`. Registration and
/// heartbeat are unconditional background loops, not WAL-triggered.
pub fn make_handler(pool: PgPool) -> crate::scheduler::Handler {
    std::sync::Arc::new(move |id: Uuid| {
        let pool = pool.clone();
        Box::pin(async move { reconcile(&pool, id).await })
    })
}

async fn reconcile(pool: &PgPool, id: Uuid) -> Result<ReconcileOutcome> {
    let server: Option<ServerRow> =
        sqlx::query_as("SELECT id, hostname, internal_ip, ip_range, status, last_heartbeat_at FROM servers WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
    let Some(server) = server else {
        return Ok(ReconcileOutcome::Done);
    };
    if server.status != "draining" {
        return Ok(ReconcileOutcome::Done);
    }
    drain_one_pass(pool, &server).await?;
    Ok(ReconcileOutcome::Requeue(Duration::from_secs(10)))
}

/// One migration step of the drain pass: picks a running deployment still
/// on this server and moves it. Returning lets the scheduler's per-id
/// serialization naturally throttle the pass to one VM move at a time.
async fn drain_one_pass(pool: &PgPool, server: &ServerRow) -> Result<()> {
    #[derive(sqlx::FromRow)]
    struct Moveable {
        deployment_id: Uuid,
        vm_id: Uuid,
        image_id: Uuid,
        vcpus: i32,
        memory_mib: i32,
        port: i32,
        env_variables: serde_json::Value,
    }

    let moveable: Option<Moveable> = sqlx::query_as(
        "SELECT d.id AS deployment_id, v.id AS vm_id, v.image_id, v.vcpus, v.memory_mib, v.port, v.env_variables
         FROM deployments d JOIN vms v ON v.id = d.vm_id
         WHERE v.server_id = $1 AND v.deleted_at IS NULL AND d.status = 'running'
         LIMIT 1",
    )
    .bind(server.id)
    .fetch_optional(pool)
    .await?;

    let Some(m) = moveable else {
        sqlx::query("UPDATE servers SET status = 'drained', updated_at = now() WHERE id = $1")
            .bind(server.id)
            .execute(pool)
            .await?;
        return Ok(());
    };

    let target = least_loaded_active_server(pool, Some(server.id)).await?;
    let Some(target) = target else {
        bail!("no other active server available to receive drained workload");
    };

    let new_vm_id = crate::ids::new_id();
    let ip = allocate_vm_ip(pool, target).await?;
    sqlx::query(
        "INSERT INTO vms (id, image_id, server_id, vcpus, memory_mib, port, ip_address, env_variables, status)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending')",
    )
    .bind(new_vm_id)
    .bind(m.image_id)
    .bind(target)
    .bind(m.vcpus)
    .bind(m.memory_mib)
    .bind(m.port)
    .bind(ip)
    .bind(m.env_variables)
    .execute(pool)
    .await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(300);
    loop {
        let status: Option<(String, String, i32)> =
            sqlx::query_as("SELECT status, ip_address, port FROM vms WHERE id = $1")
                .bind(new_vm_id)
                .fetch_optional(pool)
                .await?
                .map(|(s, ip, p): (String, String, i32)| (s, ip, p));
        if let Some((status, ip, port)) = status {
            if status == "running" && health_check(&ip, port).await {
                break;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("replacement vm {new_vm_id} did not become healthy within 5 minutes");
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE deployments SET vm_id = $1, updated_at = now() WHERE id = $2")
        .bind(new_vm_id)
        .bind(m.deployment_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE vms SET deleted_at = now(), updated_at = now() WHERE id = $1")
        .bind(m.vm_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn least_loaded_active_server(pool: &PgPool, exclude: Option<Uuid>) -> Result<Option<Uuid>> {
    #[derive(sqlx::FromRow)]
    struct Candidate {
        id: Uuid,
        vm_count: i64,
    }
    let candidates: Vec<Candidate> = sqlx::query_as(
        "SELECT s.id, count(v.id) AS vm_count
         FROM servers s LEFT JOIN vms v ON v.server_id = s.id AND v.deleted_at IS NULL
         WHERE s.status = 'active' AND ($1::uuid IS NULL OR s.id != $1)
         GROUP BY s.id
         ORDER BY vm_count ASC",
    )
    .bind(exclude)
    .fetch_all(pool)
    .await?;
    // Random tiebreak among the least-loaded ties, rather than always the
    // first row returned, so load spreads even under equal counts.
    let min = candidates.first().map(|c| c.vm_count);
    let tied: Vec<Uuid> = candidates.iter().filter(|c| Some(c.vm_count) == min).map(|c| c.id).collect();
    Ok(tied.choose(&mut rand::thread_rng()).copied())
}

/// Allocates the next unused /31 pair within `server_id`'s ip_range.
pub async fn allocate_vm_ip(pool: &PgPool, server_id: Uuid) -> Result<String> {
    let ip_range: String = sqlx::query_scalar("SELECT ip_range FROM servers WHERE id = $1")
        .bind(server_id)
        .fetch_one(pool)
        .await?;
    let net: ipnet::Ipv4Net = ip_range.parse().context("invalid ip_range")?;
    let used: Vec<String> = sqlx::query_scalar("SELECT ip_address FROM vms WHERE server_id = $1 AND deleted_at IS NULL")
        .bind(server_id)
        .fetch_all(pool)
        .await?;
    let used: std::collections::HashSet<Ipv4Addr> = used.into_iter().filter_map(|s| s.parse().ok()).collect();
    for pair_base in net.hosts().step_by(2) {
        let guest: Ipv4Addr = pair_base;
        if !used.contains(&guest) {
            return Ok(guest.to_string());
        }
    }
    bail!("ip_range {ip_range} exhausted")
}

async fn health_check(ip: &str, port: i32) -> bool {
    let url = format!("http://{ip}:{port}/");
    let client = reqwest::Client::builder().timeout(Duration::from_secs(10)).build().unwrap();
    match client.get(url).send().await {
        Ok(resp) => resp.status().is_success() || resp.status().is_redirection(),
        Err(_) => false,
    }
}

/// Leader-only: every `FAILOVER_SCAN_INTERVAL_SECS`, marks servers with a
/// stale heartbeat dead and replaces their VMs on the least-loaded active
/// server, all within one transaction.
pub async fn run_failover_loop(pool: PgPool, leader: Leader, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(*crate::config::FAILOVER_SCAN_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                if !leader.is_leader() {
                    continue;
                }
                if let Err(e) = run_failover_pass(&pool).await {
                    tracing::error!(error = %e, "dead-server failover pass failed");
                }
            }
        }
    }
}

async fn run_failover_pass(pool: &PgPool) -> Result<()> {
    let threshold = Utc::now() - chrono::Duration::from_std(crate::config::dead_server_threshold())?;
    let dead: Vec<Uuid> = sqlx::query_scalar(
        "SELECT id FROM servers WHERE status = 'active' AND last_heartbeat_at < $1",
    )
    .bind(threshold)
    .fetch_all(pool)
    .await?;
    if dead.is_empty() {
        return Ok(());
    }

    let mut tx = pool.begin().await?;
    for server_id in &dead {
        sqlx::query("UPDATE servers SET status = 'dead', updated_at = now() WHERE id = $1")
            .bind(server_id)
            .execute(&mut *tx)
            .await?;

        #[derive(sqlx::FromRow)]
        struct OrphanVm {
            id: Uuid,
            image_id: Uuid,
            vcpus: i32,
            memory_mib: i32,
            port: i32,
            env_variables: serde_json::Value,
        }
        let orphans: Vec<OrphanVm> = sqlx::query_as(
            "SELECT id, image_id, vcpus, memory_mib, port, env_variables
             FROM vms WHERE server_id = $1 AND deleted_at IS NULL AND status NOT IN ('stopped', 'failed')",
        )
        .bind(server_id)
        .fetch_all(&mut *tx)
        .await?;

        for vm in orphans {
            sqlx::query("UPDATE vms SET deleted_at = now(), updated_at = now() WHERE id = $1")
                .bind(vm.id)
                .execute(&mut *tx)
                .await?;

            let target: Option<Uuid> = sqlx::query_scalar(
                "SELECT s.id FROM servers s
                 LEFT JOIN vms v ON v.server_id = s.id AND v.deleted_at IS NULL
                 WHERE s.status = 'active'
                 GROUP BY s.id ORDER BY count(v.id) ASC LIMIT 1",
            )
            .fetch_optional(&mut *tx)
            .await?;
            let Some(target) = target else {
                bail!("no active server available to receive failover workload");
            };

            let new_ip = allocate_vm_ip_tx(&mut tx, target).await?;
            let new_vm_id = crate::ids::new_id();
            sqlx::query(
                "INSERT INTO vms (id, image_id, server_id, vcpus, memory_mib, port, ip_address, env_variables, status)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending')",
            )
            .bind(new_vm_id)
            .bind(vm.image_id)
            .bind(target)
            .bind(vm.vcpus)
            .bind(vm.memory_mib)
            .bind(vm.port)
            .bind(&new_ip)
            .bind(vm.env_variables)
            .execute(&mut *tx)
            .await?;

            sqlx::query("UPDATE deployments SET vm_id = $1, updated_at = now() WHERE vm_id = $2")
                .bind(new_vm_id)
                .bind(vm.id)
                .execute(&mut *tx)
                .await?;
        }
    }
    tx.commit().await?;
    tracing::warn!(dead_servers = ?dead, "marked servers dead and replaced their vms");
    Ok(())
}

async fn allocate_vm_ip_tx(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, server_id: Uuid) -> Result<String> {
    let ip_range: String = sqlx::query_scalar("SELECT ip_range FROM servers WHERE id = $1")
        .bind(server_id)
        .fetch_one(&mut **tx)
        .await?;
    let net: ipnet::Ipv4Net = ip_range.parse().context("invalid ip_range")?;
    let used: Vec<String> = sqlx::query_scalar("SELECT ip_address FROM vms WHERE server_id = $1 AND deleted_at IS NULL")
        .bind(server_id)
        .fetch_all(&mut **tx)
        .await?;
    let used: std::collections::HashSet<Ipv4Addr> = used.into_iter().filter_map(|s| s.parse().ok()).collect();
    for guest in net.hosts().step_by(2) {
        if !used.contains(&guest) {
            return Ok(guest.to_string());
        }
    }
    bail!("ip_range {ip_range} exhausted")
}
