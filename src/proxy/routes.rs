//! The edge proxy's atomically swappable route table: `host -> endpoints`.

use arc_swap::ArcSwap;
use rand::seq::SliceRandom;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: String,
    pub port: i32,
}

#[derive(Debug, Default)]
pub struct RouteTable {
    routes: HashMap<String, Vec<Endpoint>>,
}

impl RouteTable {
    pub fn endpoints_for(&self, host: &str) -> Option<&[Endpoint]> {
        self.routes.get(host).map(|v| v.as_slice())
    }

    pub fn pick(&self, host: &str) -> RouteLookup {
        match self.routes.get(host) {
            None => RouteLookup::NoRoute,
            Some(endpoints) if endpoints.is_empty() => RouteLookup::Empty,
            Some(endpoints) => match endpoints.choose(&mut rand::thread_rng()) {
                Some(e) => RouteLookup::Endpoint(e.clone()),
                None => RouteLookup::Empty,
            },
        }
    }
}

pub enum RouteLookup {
    NoRoute,
    Empty,
    Endpoint(Endpoint),
}

#[derive(Clone)]
pub struct RouteTableHandle(Arc<ArcSwap<RouteTable>>);

impl RouteTableHandle {
    pub fn new() -> Self {
        Self(Arc::new(ArcSwap::from_pointee(RouteTable::default())))
    }

    pub fn load(&self) -> Arc<RouteTable> {
        self.0.load_full()
    }

    pub fn store(&self, table: RouteTable) {
        self.0.store(Arc::new(table));
    }
}

impl Default for RouteTableHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Joins verified domains to their current deployment's running, healthy
/// VM(s) and rebuilds the table in one pass, then swaps it in atomically.
pub async fn reload(pool: &PgPool, handle: &RouteTableHandle) -> anyhow::Result<()> {
    #[derive(sqlx::FromRow)]
    struct Row {
        host: String,
        ip: String,
        port: i32,
    }
    let rows: Vec<Row> = sqlx::query_as(
        "SELECT dom.name AS host, v.ip_address AS ip, v.port AS port
         FROM domains dom
         JOIN deployments d ON d.id = dom.deployment_id
         JOIN vms v ON v.id = d.vm_id
         WHERE dom.verified_at IS NOT NULL
           AND dom.deleted_at IS NULL
           AND d.status = 'running'
           AND v.status = 'running'
           AND v.deleted_at IS NULL",
    )
    .fetch_all(pool)
    .await?;

    let mut table = RouteTable::default();
    for row in rows {
        table.routes.entry(row.host).or_default().push(Endpoint { ip: row.ip, port: row.port });
    }
    handle.store(table);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_host_has_no_route() {
        let table = RouteTable::default();
        assert!(matches!(table.pick("unknown.example.com"), RouteLookup::NoRoute));
    }

    #[test]
    fn empty_endpoint_set_is_distinguished_from_no_route() {
        let mut table = RouteTable::default();
        table.routes.insert("empty.example.com".to_string(), vec![]);
        assert!(matches!(table.pick("empty.example.com"), RouteLookup::Empty));
    }

    #[test]
    fn known_host_picks_one_of_its_endpoints() {
        let mut table = RouteTable::default();
        let endpoints =
            vec![Endpoint { ip: "10.0.0.1".into(), port: 3000 }, Endpoint { ip: "10.0.0.2".into(), port: 3000 }];
        table.routes.insert("app.example.com".to_string(), endpoints.clone());
        match table.pick("app.example.com") {
            RouteLookup::Endpoint(e) => assert!(endpoints.contains(&e)),
            _ => panic!("expected an endpoint"),
        }
    }
}
