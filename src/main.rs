use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use zeitwork::channel::ChannelRegistry;
use zeitwork::config;
use zeitwork::db;
use zeitwork::leader::Leader;
use zeitwork::objectstore::ObjectStore;
use zeitwork::reconcilers::{build, deployment, domain, image, server, vm};
use zeitwork::scheduler::{EntityKind, Scheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).json().init();
    dotenvy::dotenv().ok();
    config::assert_daemon_env();

    let pool = db::connect().await?;
    db::migrate(&pool).await?;

    let id = server::load_or_create_identity().await?;
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "zeitwork-node".to_string());
    let server_row = server::register(&pool, id, &hostname, &config::INTERNAL_IP).await?;
    tracing::info!(server_id = %server_row.id, ip_range = %server_row.ip_range, "server registered");

    let store = ObjectStore::connect().await;
    let channels = ChannelRegistry::new(pool.clone());
    let registry = vm::ProcessRegistry::default();
    let cancel = CancellationToken::new();
    let leader = Leader::spawn(config::DATABASE_URL.clone(), cancel.clone());

    let builder_image_id: Uuid = config::BUILDER_IMAGE_ID.parse().expect("BUILDER_IMAGE_ID must be a uuid");

    let scheduler_cell: Arc<tokio::sync::OnceCell<Scheduler>> = Arc::new(tokio::sync::OnceCell::new());

    let mut handlers: HashMap<EntityKind, zeitwork::scheduler::Handler> = HashMap::new();
    handlers.insert(EntityKind::Server, server::make_handler(pool.clone()));
    handlers.insert(
        EntityKind::Image,
        image::make_handler(pool.clone(), store.clone(), id, Arc::new(Mutex::new(())), cancel.clone()),
    );
    handlers.insert(EntityKind::Build, build::make_handler(pool.clone(), id, builder_image_id));
    handlers.insert(EntityKind::Deployment, deployment::make_handler(pool.clone(), leader.clone()));
    handlers.insert(
        EntityKind::Vm,
        vm::make_handler(
            pool.clone(),
            store.clone(),
            registry.clone(),
            channels.clone(),
            id,
            cancel.clone(),
            scheduler_cell.clone(),
        ),
    );
    handlers.insert(EntityKind::Domain, domain::make_handler(pool.clone()));

    let scheduler = Scheduler::new(handlers, *config::SCHEDULER_WORKERS as usize, cancel.clone());
    let _ = scheduler_cell.set(scheduler.clone());

    db::bootstrap_scan(&pool, &scheduler).await?;

    tokio::spawn(db::run_wal_listener(pool.clone(), scheduler.clone(), cancel.clone()));
    tokio::spawn(server::run_heartbeat_loop(pool.clone(), id, cancel.clone()));
    tokio::spawn(server::run_host_route_sync_loop(pool.clone(), id, cancel.clone()));
    tokio::spawn(server::run_failover_loop(pool.clone(), leader.clone(), cancel.clone()));

    tracing::info!("zeitwork daemon started");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining in-flight reconciles");
    cancel.cancel();
    scheduler.stop(std::time::Duration::from_secs(30)).await;

    Ok(())
}
