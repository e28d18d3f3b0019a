//! Host kernel route programming: gives every VM a flat reachable address
//! space across the cluster by routing each peer server's `ip_range`
//! through its `internal_ip`.

use ipnet::Ipv4Net;
use sqlx::PgPool;
use std::net::Ipv4Addr;
use tokio_util::sync::CancellationToken;

use crate::subprocess::run_logged;

#[derive(sqlx::FromRow)]
struct PeerRoute {
    ip_range: String,
    internal_ip: String,
}

/// Programs `ip route replace <cidr> via <ip>` for every other active
/// server. Idempotent: `route replace` overwrites rather than duplicating.
pub async fn sync_host_routes(pool: &PgPool, self_id: uuid::Uuid, cancel: &CancellationToken) -> anyhow::Result<()> {
    let peers: Vec<PeerRoute> = sqlx::query_as(
        "SELECT ip_range, internal_ip FROM servers WHERE status = 'active' AND id != $1",
    )
    .bind(self_id)
    .fetch_all(pool)
    .await?;

    for peer in peers {
        let cidr: Ipv4Net = match peer.ip_range.parse() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(ip_range = peer.ip_range, error = %e, "skipping unparseable ip_range");
                continue;
            }
        };
        let via: Ipv4Addr = match peer.internal_ip.parse() {
            Ok(ip) => ip,
            Err(e) => {
                tracing::warn!(internal_ip = peer.internal_ip, error = %e, "skipping unparseable internal_ip");
                continue;
            }
        };
        let cidr_str = cidr.to_string();
        let via_str = via.to_string();
        let args = ["route", "replace", &cidr_str, "via", &via_str];
        if let Err(e) = run_logged("ip", &args, std::time::Duration::from_secs(10), cancel).await {
            tracing::warn!(cidr = cidr_str, via = via_str, error = %e, "failed to program host route");
        }
    }
    Ok(())
}
