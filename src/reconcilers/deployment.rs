//! Deployment reconciler: the level-triggered state machine gating
//! build -> image -> VM -> health -> traffic-swap. Runs on the cluster
//! leader only.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::leader::Leader;
use crate::scheduler::{Handler, ReconcileOutcome};

const DEPLOYMENT_PORT: i32 = 3000;
const DEFAULT_VCPUS: i32 = 1;
const DEFAULT_MEMORY_MIB: i32 = 1024;

#[derive(sqlx::FromRow)]
struct DeploymentRow {
    id: Uuid,
    project_id: Uuid,
    github_commit: String,
    build_id: Option<Uuid>,
    image_id: Option<Uuid>,
    vm_id: Option<Uuid>,
    status: String,
    created_at: DateTime<Utc>,
}

pub fn make_handler(pool: PgPool, leader: Leader) -> Handler {
    Arc::new(move |id: Uuid| {
        let pool = pool.clone();
        let leader = leader.clone();
        Box::pin(async move {
            if !leader.is_leader() {
                return Ok(ReconcileOutcome::Requeue(Duration::from_secs(5)));
            }
            reconcile(&pool, id).await
        })
    })
}

async fn reconcile(pool: &PgPool, id: Uuid) -> Result<ReconcileOutcome> {
    let Some(d): Option<DeploymentRow> = sqlx::query_as(
        "SELECT id, project_id, github_commit, build_id, image_id, vm_id, status, created_at
         FROM deployments WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    else {
        return Ok(ReconcileOutcome::Done);
    };

    if matches!(d.status.as_str(), "failed" | "stopped") {
        if let Some(vm_id) = d.vm_id {
            soft_delete_vm(pool, vm_id).await?;
        }
        return Ok(ReconcileOutcome::Done);
    }

    let Some(build_id) = d.build_id else {
        let build_id = crate::ids::new_id();
        sqlx::query(
            "INSERT INTO builds (id, project_id, github_commit, github_branch, status) VALUES ($1, $2, $3, '', 'pending')",
        )
        .bind(build_id)
        .bind(d.project_id)
        .bind(&d.github_commit)
        .execute(pool)
        .await?;
        sqlx::query("UPDATE deployments SET build_id = $1, status = 'building', updated_at = now() WHERE id = $2")
            .bind(build_id)
            .bind(id)
            .execute(pool)
            .await?;
        return Ok(ReconcileOutcome::Requeue(Duration::from_secs(5)));
    };

    let build_status: (String, Option<Uuid>) =
        sqlx::query_as("SELECT status, image_id FROM builds WHERE id = $1").bind(build_id).fetch_one(pool).await?;
    if build_status.0 == "failed" {
        sqlx::query("UPDATE deployments SET status = 'failed', failed_at = now(), updated_at = now() WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        return Ok(ReconcileOutcome::Done);
    }
    let Some(build_image_id) = build_status.1 else {
        return Ok(ReconcileOutcome::Requeue(Duration::from_secs(10)));
    };

    if d.image_id != Some(build_image_id) {
        sqlx::query("UPDATE deployments SET image_id = $1, updated_at = now() WHERE id = $2")
            .bind(build_image_id)
            .bind(id)
            .execute(pool)
            .await?;
        return Ok(ReconcileOutcome::Requeue(Duration::from_secs(1)));
    }

    let Some(vm_id) = d.vm_id else {
        let vm_id = create_deployment_vm(pool, build_image_id).await?;
        sqlx::query("UPDATE deployments SET vm_id = $1, status = 'starting', updated_at = now() WHERE id = $2")
            .bind(vm_id)
            .bind(id)
            .execute(pool)
            .await?;
        return Ok(ReconcileOutcome::Requeue(Duration::from_secs(2)));
    };

    let vm: Option<(String, String, i32)> =
        sqlx::query_as("SELECT status, ip_address, port FROM vms WHERE id = $1 AND deleted_at IS NULL")
            .bind(vm_id)
            .fetch_optional(pool)
            .await?;
    let Some((vm_status, vm_ip, vm_port)) = vm else {
        sqlx::query("UPDATE deployments SET vm_id = NULL, updated_at = now() WHERE id = $1").bind(id).execute(pool).await?;
        return Ok(ReconcileOutcome::Requeue(Duration::from_secs(2)));
    };

    if vm_status != "running" || !health_check(&vm_ip, vm_port).await {
        return Ok(ReconcileOutcome::Requeue(Duration::from_secs(5)));
    }

    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE deployments SET status = 'running', updated_at = now() WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE domains SET deployment_id = $1, updated_at = now() WHERE project_id = $2 AND verified_at IS NOT NULL")
        .bind(id)
        .bind(d.project_id)
        .execute(&mut *tx)
        .await?;

    #[derive(sqlx::FromRow)]
    struct Superseded {
        id: Uuid,
        vm_id: Option<Uuid>,
    }
    let superseded: Vec<Superseded> = sqlx::query_as(
        "SELECT id, vm_id FROM deployments
         WHERE project_id = $1 AND status = 'running' AND id != $2
         ORDER BY created_at DESC, id DESC",
    )
    .bind(d.project_id)
    .bind(id)
    .fetch_all(&mut *tx)
    .await?;
    for s in superseded {
        sqlx::query("UPDATE deployments SET status = 'stopped', stopped_at = now(), updated_at = now() WHERE id = $1")
            .bind(s.id)
            .execute(&mut *tx)
            .await?;
        if let Some(old_vm) = s.vm_id {
            sqlx::query("UPDATE vms SET deleted_at = now(), updated_at = now() WHERE id = $1")
                .bind(old_vm)
                .execute(&mut *tx)
                .await?;
        }
    }
    tx.commit().await?;
    Ok(ReconcileOutcome::Done)
}

async fn create_deployment_vm(pool: &PgPool, image_id: Uuid) -> Result<Uuid> {
    let server_id = crate::reconcilers::server::least_loaded_active_server(pool, None)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no active server available to schedule deployment vm"))?;
    let ip = crate::reconcilers::server::allocate_vm_ip(pool, server_id).await?;
    let vm_id = crate::ids::new_id();
    sqlx::query(
        "INSERT INTO vms (id, image_id, server_id, vcpus, memory_mib, port, ip_address, env_variables, status)
         VALUES ($1, $2, $3, $4, $5, $6, $7, '[]', 'pending')",
    )
    .bind(vm_id)
    .bind(image_id)
    .bind(server_id)
    .bind(DEFAULT_VCPUS)
    .bind(DEFAULT_MEMORY_MIB)
    .bind(DEPLOYMENT_PORT)
    .bind(ip)
    .execute(pool)
    .await?;
    Ok(vm_id)
}

async fn soft_delete_vm(pool: &PgPool, vm_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE vms SET deleted_at = now(), updated_at = now() WHERE id = $1 AND deleted_at IS NULL")
        .bind(vm_id)
        .execute(pool)
        .await?;
    Ok(())
}

async fn health_check(ip: &str, port: i32) -> bool {
    let url = format!("http://{ip}:{port}/");
    let client = match reqwest::Client::builder().timeout(Duration::from_secs(10)).build() {
        Ok(c) => c,
        Err(_) => return false,
    };
    match client.get(url).send().await {
        Ok(resp) => resp.status().is_success() || resp.status().is_redirection(),
        Err(_) => false,
    }
}
