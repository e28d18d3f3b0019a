//! Image reconciler: pull OCI -> unpack -> pack qcow2 -> upload to object
//! store, with a cross-host claim (`building_by`/`building_at`) so at most
//! one server builds a given image at a time, and a local mutex so at most
//! one build runs per host.

use anyhow::{bail, Result};
use sqlx::PgPool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SERVER_DATA_DIR;
use crate::objectstore::ObjectStore;
use crate::scheduler::{Handler, ReconcileOutcome};
use crate::subprocess::run_logged;

const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(20 * 60);

#[derive(sqlx::FromRow)]
struct ImageRow {
    id: Uuid,
    registry: String,
    repository: String,
    tag: String,
    disk_image_key: Option<String>,
}

fn base_path(image_id: Uuid) -> PathBuf {
    PathBuf::from(SERVER_DATA_DIR.as_str()).join("base").join(format!("{image_id}.qcow2"))
}

pub fn make_handler(
    pool: PgPool,
    store: ObjectStore,
    self_id: Uuid,
    build_lock: Arc<Mutex<()>>,
    cancel: CancellationToken,
) -> Handler {
    Arc::new(move |id: Uuid| {
        let pool = pool.clone();
        let store = store.clone();
        let build_lock = build_lock.clone();
        let cancel = cancel.clone();
        Box::pin(async move { reconcile(&pool, &store, self_id, &build_lock, &cancel, id).await })
    })
}

async fn reconcile(
    pool: &PgPool,
    store: &ObjectStore,
    self_id: Uuid,
    build_lock: &Mutex<()>,
    cancel: &CancellationToken,
    id: Uuid,
) -> Result<ReconcileOutcome> {
    let Some(image): Option<ImageRow> =
        sqlx::query_as("SELECT id, registry, repository, tag, disk_image_key FROM images WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?
    else {
        return Ok(ReconcileOutcome::Done);
    };

    if let Some(key) = &image.disk_image_key {
        if base_path(id).exists() {
            return Ok(ReconcileOutcome::Done);
        }
        if store.exists(key).await? {
            return Ok(ReconcileOutcome::Done);
        }
        tracing::warn!(image = %id, "disk_image_key set but blob missing from object store, rebuilding");
        sqlx::query("UPDATE images SET disk_image_key = NULL, updated_at = now() WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
    }

    let claimed: Option<(Uuid,)> = sqlx::query_as(
        "UPDATE images SET building_by = $1, building_at = now(), updated_at = now()
         WHERE id = $2 AND (building_by IS NULL OR building_at < now() - interval '20 minutes')
         RETURNING id",
    )
    .bind(self_id)
    .bind(id)
    .fetch_optional(pool)
    .await?
    .map(|(id,)| (id,));
    if claimed.is_none() {
        return Ok(ReconcileOutcome::Requeue(Duration::from_secs(120)));
    }

    let guard = build_lock.lock().await;
    let result = build_image(&image, cancel).await;
    drop(guard);

    match result {
        Ok(()) => {
            let key = format!("images/{id}.qcow2");
            store.put_file(&key, &base_path(id)).await?;
            sqlx::query(
                "UPDATE images SET disk_image_key = $1, building_by = NULL, building_at = NULL, updated_at = now()
                 WHERE id = $2",
            )
            .bind(&key)
            .bind(id)
            .execute(pool)
            .await?;
            Ok(ReconcileOutcome::Done)
        }
        Err(e) => {
            sqlx::query(
                "UPDATE images SET disk_image_key = NULL, building_by = NULL, building_at = NULL, updated_at = now()
                 WHERE id = $1",
            )
            .bind(id)
            .execute(pool)
            .await?;
            Err(e)
        }
    }
}

async fn build_image(image: &ImageRow, cancel: &CancellationToken) -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let oci_dir = tmp.path().join("oci");
    let bundle_dir = tmp.path().join("bundle");
    let out = base_path(image.id);
    if let Some(parent) = out.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if out.exists() {
        tokio::fs::remove_file(&out).await?;
    }

    let src = format!("docker://{}/{}:{}", image.registry, image.repository, image.tag);
    let dst = format!("oci:{}:latest", oci_dir.display());
    let creds = format!("{}:{}", crate::config::REGISTRY_USER.as_str(), crate::config::REGISTRY_PASSWORD.as_str());
    let mut args = vec!["copy"];
    if image.registry == crate::config::REGISTRY_URL.as_str() && !crate::config::REGISTRY_USER.is_empty() {
        args.push("--src-creds");
        args.push(&creds);
    }
    args.push(&src);
    args.push(&dst);
    run_logged("skopeo", &args, SUBPROCESS_TIMEOUT, cancel).await?;

    let oci_dir_s = oci_dir.display().to_string();
    let bundle_dir_s = bundle_dir.display().to_string();
    run_logged(
        "umoci",
        &["unpack", "--image", &format!("{oci_dir_s}:latest"), &bundle_dir_s],
        SUBPROCESS_TIMEOUT,
        cancel,
    )
    .await?;

    let out_s = out.display().to_string();
    let rootfs = bundle_dir.join("rootfs");
    let rootfs_s = rootfs.display().to_string();
    run_logged(
        "virt-make-fs",
        &["--format=qcow2", "--type=ext4", &rootfs_s, &out_s, "--size=+5G"],
        SUBPROCESS_TIMEOUT,
        cancel,
    )
    .await?;

    if !out.exists() {
        bail!("virt-make-fs did not produce {}", out.display());
    }
    Ok(())
}
