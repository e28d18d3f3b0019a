//! VM reconciler: launches the hypervisor subprocess for a VM row and
//! tracks it in a host-local process registry so that event storms never
//! produce more than one hypervisor per VM id.

use anyhow::{Context, Result};
use base64::Engine;
use dashmap::DashMap;
use serde::Serialize;
use sqlx::PgPool;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::ChannelRegistry;
use crate::config::SERVER_DATA_DIR;
use crate::crypto::decrypt_env;
use crate::objectstore::ObjectStore;
use crate::scheduler::{EntityKey, EntityKind, Handler, ReconcileOutcome, Scheduler};

pub struct ProcessHandle {
    pub child: Mutex<Option<Child>>,
}

use tokio::sync::Mutex;

#[derive(Clone)]
pub struct ProcessRegistry {
    inner: Arc<DashMap<Uuid, Arc<ProcessHandle>>>,
    tap_counter: Arc<AtomicU32>,
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self { inner: Arc::new(DashMap::new()), tap_counter: Arc::new(AtomicU32::new(0)) }
    }
}

impl ProcessRegistry {
    pub fn contains(&self, id: Uuid) -> bool {
        self.inner.contains_key(&id)
    }

    fn next_tap_index(&self) -> u32 {
        self.tap_counter.fetch_add(1, Ordering::SeqCst)
    }
}

#[derive(sqlx::FromRow)]
struct VmRow {
    id: Uuid,
    image_id: Uuid,
    server_id: Uuid,
    vcpus: i32,
    memory_mib: i32,
    port: i32,
    ip_address: String,
    env_variables: serde_json::Value,
    status: String,
    deleted_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Serialize)]
struct GuestConfig<'a> {
    app_id: Uuid,
    ip_addr: &'a str,
    ip_gw: String,
}

fn base_image_path(image_id: Uuid) -> PathBuf {
    PathBuf::from(SERVER_DATA_DIR.as_str()).join("base").join(format!("{image_id}.qcow2"))
}

fn work_disk_path(vm_id: Uuid) -> PathBuf {
    PathBuf::from(SERVER_DATA_DIR.as_str()).join("work").join(format!("{vm_id}.qcow2"))
}

/// Predecessor address of the /31 pair: the VM's own address is the guest
/// side, the host TAP takes the other half of the pair.
fn host_side_ip(vm_ip: Ipv4Addr) -> Ipv4Addr {
    let octets = vm_ip.octets();
    let last = octets[3];
    let host_last = if last % 2 == 0 { last + 1 } else { last - 1 };
    Ipv4Addr::new(octets[0], octets[1], octets[2], host_last)
}

pub fn make_handler(
    pool: PgPool,
    store: ObjectStore,
    registry: ProcessRegistry,
    channels: ChannelRegistry,
    self_server_id: Uuid,
    cancel: CancellationToken,
    scheduler: Arc<tokio::sync::OnceCell<Scheduler>>,
) -> Handler {
    Arc::new(move |id: Uuid| {
        let pool = pool.clone();
        let store = store.clone();
        let registry = registry.clone();
        let channels = channels.clone();
        let cancel = cancel.clone();
        let scheduler = scheduler.clone();
        Box::pin(async move {
            reconcile(&pool, &store, &registry, &channels, self_server_id, &cancel, &scheduler, id).await
        })
    })
}

async fn reconcile(
    pool: &PgPool,
    store: &ObjectStore,
    registry: &ProcessRegistry,
    channels: &ChannelRegistry,
    self_server_id: Uuid,
    cancel: &CancellationToken,
    scheduler: &Arc<tokio::sync::OnceCell<Scheduler>>,
    id: Uuid,
) -> Result<ReconcileOutcome> {
    let Some(vm): Option<VmRow> = sqlx::query_as(
        "SELECT id, image_id, server_id, vcpus, memory_mib, port, ip_address, env_variables, status, deleted_at
         FROM vms WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    else {
        return Ok(ReconcileOutcome::Done);
    };

    if vm.server_id != self_server_id {
        // Not ours to launch; another host's reconciler owns it.
        return Ok(ReconcileOutcome::Done);
    }

    if vm.deleted_at.is_some() {
        soft_delete_cleanup(registry, channels, id).await;
        return Ok(ReconcileOutcome::Done);
    }

    if vm.status == "stopped" {
        return Ok(ReconcileOutcome::Done);
    }

    if registry.contains(id) {
        if vm.status != "running" {
            sqlx::query("UPDATE vms SET status = 'running', updated_at = now() WHERE id = $1")
                .bind(id)
                .execute(pool)
                .await?;
        }
        return Ok(ReconcileOutcome::Done);
    }

    if vm.status == "failed" {
        tracing::info!(vm = %id, "previous hypervisor exited non-zero; relaunching");
    }
    if vm.status == "pending" || vm.status == "failed" {
        sqlx::query("UPDATE vms SET status = 'starting', updated_at = now() WHERE id = $1").bind(id).execute(pool).await?;
    }

    ensure_base_image(store, &vm).await?;
    create_work_disk(&vm, cancel).await?;

    let tap_index = registry.next_tap_index();
    let vm_ip: Ipv4Addr = vm.ip_address.parse().context("invalid vm ip_address")?;
    let host_ip = host_side_ip(vm_ip);

    register_channel(channels, &vm, vm_ip, host_ip).await?;

    let child = launch_hypervisor(&vm, tap_index, host_ip).await?;
    let handle = Arc::new(ProcessHandle { child: Mutex::new(Some(child)) });
    registry.inner.insert(id, handle.clone());

    sqlx::query("UPDATE vms SET status = 'running', updated_at = now() WHERE id = $1").bind(id).execute(pool).await?;

    spawn_exit_watcher(pool.clone(), registry.clone(), channels.clone(), scheduler.clone(), id, handle);

    Ok(ReconcileOutcome::Done)
}

async fn ensure_base_image(store: &ObjectStore, vm: &VmRow) -> Result<()> {
    let path = base_image_path(vm.image_id);
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let key = format!("images/{}.qcow2", vm.image_id);
    store.get_to_file(&key, &path).await.context("downloading base image from object store")
}

async fn create_work_disk(vm: &VmRow, cancel: &CancellationToken) -> Result<()> {
    let work = work_disk_path(vm.id);
    if let Some(parent) = work.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if work.exists() {
        tokio::fs::remove_file(&work).await?;
    }
    let base = base_image_path(vm.image_id);
    let base_s = base.display().to_string();
    let work_s = work.display().to_string();
    crate::subprocess::run_logged(
        "qemu-img",
        &["create", "-f", "qcow2", "-b", &base_s, "-F", "qcow2", &work_s],
        Duration::from_secs(30),
        cancel,
    )
    .await
    .map_err(anyhow::Error::from)
}

async fn register_channel(channels: &ChannelRegistry, vm: &VmRow, vm_ip: Ipv4Addr, host_ip: Ipv4Addr) -> Result<()> {
    let env = decrypt_env(&vm.env_variables).unwrap_or_default();
    channels
        .register(vm.id, vm.port as u16, crate::channel::VmInfo { env, ip_addr: vm_ip.to_string(), ip_gw: host_ip.to_string() })
        .await
}

async fn launch_hypervisor(vm: &VmRow, tap_index: u32, host_ip: Ipv4Addr) -> Result<Child> {
    let work = work_disk_path(vm.id).display().to_string();
    let config = GuestConfig { app_id: vm.id, ip_addr: &vm.ip_address, ip_gw: host_ip.to_string() };
    let config_json = serde_json::to_vec(&config)?;
    let config_b64 = base64::engine::general_purpose::STANDARD.encode(config_json);
    let cmdline = format!("console=hvc0 config={config_b64}");
    let disk_arg = format!("path={work},direct=on,queue_size=256");
    let cpus_arg = format!("boot={}", vm.vcpus);
    let mem_arg = format!("size={}M", vm.memory_mib);
    let net_arg = format!("tap=tap{tap_index},ip={host_ip},mask=255.255.255.254");
    let base_socket = std::env::temp_dir().join(format!("vsock-{}.sock", vm.id));

    let child = tokio::process::Command::new("hypervisor")
        .args([
            "--kernel",
            &format!("{}/kernel/vmlinux", SERVER_DATA_DIR.as_str()),
            "--initramfs",
            &format!("{}/kernel/initramfs", SERVER_DATA_DIR.as_str()),
            "--disk",
            &disk_arg,
            "--cmdline",
            &cmdline,
            "--cpus",
            &cpus_arg,
            "--memory",
            &mem_arg,
            "--net",
            &net_arg,
            "--vsock",
            &base_socket.display().to_string(),
        ])
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn hypervisor subprocess")?;
    Ok(child)
}

fn spawn_exit_watcher(
    pool: PgPool,
    registry: ProcessRegistry,
    channels: ChannelRegistry,
    scheduler: Arc<tokio::sync::OnceCell<Scheduler>>,
    id: Uuid,
    handle: Arc<ProcessHandle>,
) {
    tokio::spawn(async move {
        let status = {
            let mut guard = handle.child.lock().await;
            match guard.as_mut() {
                Some(child) => child.wait().await,
                None => return,
            }
        };
        registry.inner.remove(&id);
        channels.deregister(id).await;
        let new_status = match status {
            Ok(s) if s.success() => "stopped",
            _ => "failed",
        };
        if let Err(e) = sqlx::query("UPDATE vms SET status = $1, updated_at = now() WHERE id = $2")
            .bind(new_status)
            .bind(id)
            .execute(&pool)
            .await
        {
            tracing::warn!(vm = %id, error = %e, "failed to record hypervisor exit");
        }
        if let Some(scheduler) = scheduler.get() {
            scheduler.schedule_at(
                EntityKey { kind: EntityKind::Vm, id },
                chrono::Utc::now() + chrono::Duration::seconds(5),
            );
        }
    });
}

async fn soft_delete_cleanup(registry: &ProcessRegistry, channels: &ChannelRegistry, id: Uuid) {
    if let Some((_, handle)) = registry.inner.remove(&id) {
        let mut guard = handle.child.lock().await;
        if let Some(mut child) = guard.take() {
            let _ = child.kill().await;
        }
    }
    channels.deregister(id).await;
    let _ = tokio::fs::remove_file(work_disk_path(id)).await;
}
