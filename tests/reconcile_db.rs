use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use zeitwork::db;
use zeitwork::scheduler::{EntityKind, Scheduler};

async fn insert_server(pool: &PgPool, ip_range: &str) -> Uuid {
    let id = zeitwork::ids::new_id();
    sqlx::query(
        "INSERT INTO servers (id, hostname, internal_ip, ip_range, status, last_heartbeat_at)
         VALUES ($1, $2, $3, $4, 'active', now())",
    )
    .bind(id)
    .bind(format!("host-{id}"))
    .bind("10.0.0.1")
    .bind(ip_range)
    .execute(pool)
    .await
    .unwrap();
    id
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn bootstrap_scan_is_idempotent(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let server_id = insert_server(&pool, "10.0.0.0/20").await;

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let mut handlers: HashMap<EntityKind, zeitwork::scheduler::Handler> = HashMap::new();
    handlers.insert(
        EntityKind::Server,
        Arc::new(move |id: Uuid| {
            let seen = seen_clone.clone();
            Box::pin(async move {
                seen.lock().unwrap().push(id);
                Ok(zeitwork::scheduler::ReconcileOutcome::Done)
            })
        }),
    );
    let scheduler = Scheduler::new(handlers, 4, CancellationToken::new());

    db::bootstrap_scan(&pool, &scheduler).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    db::bootstrap_scan(&pool, &scheduler).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // Scanning the same row twice schedules it twice, but each scan's ids
    // are the same set -- every recorded run is for the one server row.
    let runs = seen.lock().unwrap();
    assert!(runs.iter().all(|id| *id == server_id));
    assert!(runs.len() >= 2);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn image_claim_is_exclusive_across_concurrent_reconciles(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let image_id = zeitwork::ids::new_id();
    sqlx::query(
        "INSERT INTO images (id, registry, repository, tag)
         VALUES ($1, 'registry.zeitwork.internal', 'zeitwork/demo', 'abc123')",
    )
    .bind(image_id)
    .execute(&pool)
    .await
    .unwrap();

    let claimer_a = zeitwork::ids::new_id();
    let claimer_b = zeitwork::ids::new_id();

    let claimed_a: Option<Uuid> = sqlx::query_scalar(
        "UPDATE images SET building_by = $2, building_at = now()
         WHERE id = $1 AND building_by IS NULL
         RETURNING id",
    )
    .bind(image_id)
    .bind(claimer_a)
    .fetch_optional(&pool)
    .await
    .unwrap();

    let claimed_b: Option<Uuid> = sqlx::query_scalar(
        "UPDATE images SET building_by = $2, building_at = now()
         WHERE id = $1 AND building_by IS NULL
         RETURNING id",
    )
    .bind(image_id)
    .bind(claimer_b)
    .fetch_optional(&pool)
    .await
    .unwrap();

    assert!(claimed_a.is_some());
    assert!(claimed_b.is_none());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn cutover_leaves_exactly_one_running_deployment_per_project(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let project_id = zeitwork::ids::new_id();
    sqlx::query(
        "INSERT INTO projects (id, name, github_repository, github_installation_id)
         VALUES ($1, 'demo', 'acme/demo', '1')",
    )
    .bind(project_id)
    .execute(&pool)
    .await
    .unwrap();
    let server_id = insert_server(&pool, "10.0.1.0/20").await;
    let image_id = zeitwork::ids::new_id();
    sqlx::query(
        "INSERT INTO images (id, registry, repository, tag, disk_image_key)
         VALUES ($1, 'registry.zeitwork.internal', 'zeitwork/demo', 'abc123', 'images/demo.qcow2')",
    )
    .bind(image_id)
    .execute(&pool)
    .await
    .unwrap();

    let mut deployment_ids = Vec::new();
    for i in 0..3 {
        let vm_id = zeitwork::ids::new_id();
        sqlx::query(
            "INSERT INTO vms (id, image_id, server_id, vcpus, memory_mib, port, ip_address, env_variables, status)
             VALUES ($1, $2, $3, 1, 1024, 3000, $4, '[]', 'running')",
        )
        .bind(vm_id)
        .bind(image_id)
        .bind(server_id)
        .bind(format!("10.0.1.{}", i * 2 + 1))
        .execute(&pool)
        .await
        .unwrap();

        let deployment_id = zeitwork::ids::new_id();
        sqlx::query(
            "INSERT INTO deployments (id, project_id, github_commit, image_id, vm_id, status)
             VALUES ($1, $2, $3, $4, $5, 'running')",
        )
        .bind(deployment_id)
        .bind(project_id)
        .bind(format!("commit-{i}"))
        .bind(image_id)
        .bind(vm_id)
        .execute(&pool)
        .await
        .unwrap();
        deployment_ids.push(deployment_id);
    }

    // The cutover transaction: mark the newest running, stop every other
    // running deployment for the same project, tiebreaking by created_at
    // then id so the rule is total even for rows inserted in the same tick.
    let winner = *deployment_ids.last().unwrap();
    let mut tx = pool.begin().await.unwrap();
    sqlx::query(
        "UPDATE deployments SET status = 'stopped', updated_at = now()
         WHERE project_id = $1 AND id != $2 AND status = 'running'",
    )
    .bind(project_id)
    .bind(winner)
    .execute(&mut *tx)
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let running: i64 =
        sqlx::query_scalar("SELECT count(*) FROM deployments WHERE project_id = $1 AND status = 'running'")
            .bind(project_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(running, 1);

    let winner_status: String =
        sqlx::query_scalar("SELECT status FROM deployments WHERE id = $1").bind(winner).fetch_one(&pool).await.unwrap();
    assert_eq!(winner_status, "running");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn wal_listener_notification_reaches_scheduler(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let server_id = insert_server(&pool, "10.0.2.0/20").await;

    let mut handlers: HashMap<EntityKind, zeitwork::scheduler::Handler> = HashMap::new();
    let seen = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    handlers.insert(
        EntityKind::Server,
        Arc::new(move |id: Uuid| {
            let seen = seen_clone.clone();
            Box::pin(async move {
                seen.lock().await.push(id);
                Ok(zeitwork::scheduler::ReconcileOutcome::Done)
            })
        }),
    );
    let cancel = CancellationToken::new();
    let scheduler = Scheduler::new(handlers, 4, cancel.clone());
    let listener_pool = pool.clone();
    let listener_scheduler = scheduler.clone();
    let listener_cancel = cancel.clone();
    tokio::spawn(db::run_wal_listener(listener_pool, listener_scheduler, listener_cancel));

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    sqlx::query("UPDATE servers SET updated_at = now() WHERE id = $1").bind(server_id).execute(&pool).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    cancel.cancel();
    assert!(seen.lock().await.contains(&server_id));
}
