use sqlx::PgPool;
use zeitwork::proxy::routes::{self, RouteTableHandle};

async fn insert_project_domain_vm(pool: &PgPool, host: &str, verified: bool, vm_status: &str) {
    let project_id = zeitwork::ids::new_id();
    sqlx::query(
        "INSERT INTO projects (id, name, github_repository, github_installation_id)
         VALUES ($1, 'demo', 'acme/demo', '1')",
    )
    .bind(project_id)
    .execute(pool)
    .await
    .unwrap();

    let server_id = zeitwork::ids::new_id();
    sqlx::query(
        "INSERT INTO servers (id, hostname, internal_ip, ip_range, status, last_heartbeat_at)
         VALUES ($1, 'edge-test-host', '10.0.3.1', '10.0.3.0/20', 'active', now())",
    )
    .bind(server_id)
    .execute(pool)
    .await
    .unwrap();

    let image_id = zeitwork::ids::new_id();
    sqlx::query(
        "INSERT INTO images (id, registry, repository, tag, disk_image_key)
         VALUES ($1, 'registry.zeitwork.internal', 'zeitwork/demo', 'abc', 'images/demo.qcow2')",
    )
    .bind(image_id)
    .execute(pool)
    .await
    .unwrap();

    let vm_id = zeitwork::ids::new_id();
    sqlx::query(
        "INSERT INTO vms (id, image_id, server_id, vcpus, memory_mib, port, ip_address, env_variables, status)
         VALUES ($1, $2, $3, 1, 1024, 3000, '10.0.3.1', '[]', $4)",
    )
    .bind(vm_id)
    .bind(image_id)
    .bind(server_id)
    .bind(vm_status)
    .execute(pool)
    .await
    .unwrap();

    let deployment_id = zeitwork::ids::new_id();
    sqlx::query(
        "INSERT INTO deployments (id, project_id, github_commit, image_id, vm_id, status)
         VALUES ($1, $2, 'abc', $3, $4, 'running')",
    )
    .bind(deployment_id)
    .bind(project_id)
    .bind(image_id)
    .bind(vm_id)
    .execute(pool)
    .await
    .unwrap();

    let domain_id = zeitwork::ids::new_id();
    let verified_at: Option<chrono::DateTime<chrono::Utc>> = if verified { Some(chrono::Utc::now()) } else { None };
    sqlx::query(
        "INSERT INTO domains (id, name, project_id, deployment_id, txt_verification_required, verified_at)
         VALUES ($1, $2, $3, $4, false, $5)",
    )
    .bind(domain_id)
    .bind(host)
    .bind(project_id)
    .bind(deployment_id)
    .bind(verified_at)
    .execute(pool)
    .await
    .unwrap();
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn reload_only_routes_verified_running_deployments(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    insert_project_domain_vm(&pool, "live.example.com", true, "running").await;
    insert_project_domain_vm(&pool, "unverified.example.com", false, "running").await;
    insert_project_domain_vm(&pool, "notrunning.example.com", true, "starting").await;

    let handle = RouteTableHandle::new();
    routes::reload(&pool, &handle).await.unwrap();
    let table = handle.load();

    assert!(table.endpoints_for("live.example.com").is_some());
    assert!(table.endpoints_for("unverified.example.com").is_none());
    assert!(table.endpoints_for("notrunning.example.com").is_none());
}
