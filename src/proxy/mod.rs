//! Edge proxy: terminates TLS by SNI and forwards to the VM the route
//! table names for the request's `Host` header.

pub mod certs;
pub mod routes;
pub mod server;

use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{EDGE_HTTPS_ADDR, EDGE_HTTP_ADDR, EDGE_ROUTE_REFRESH_INTERVAL_SECS};
use certs::CertCache;
use routes::RouteTableHandle;

pub struct Proxy {
    pub routes: RouteTableHandle,
    pub certs: Arc<CertCache>,
}

impl Proxy {
    pub fn new() -> Self {
        Self { routes: RouteTableHandle::new(), certs: Arc::new(CertCache::new()) }
    }
}

impl Default for Proxy {
    fn default() -> Self {
        Self::new()
    }
}

/// Refreshes the route table and cert cache once immediately, then on the
/// configured interval and whenever a watched table changes. A 6-hour
/// default interval is the fallback; the `zeitwork_changes` notify channel
/// is what keeps routes current within seconds of a cutover or a new
/// verified domain.
pub async fn run_refresh_loop(pool: PgPool, proxy: Arc<Proxy>, cancel: CancellationToken) {
    if let Err(e) = routes::reload(&pool, &proxy.routes).await {
        tracing::warn!(error = %e, "initial route table load failed");
    }
    if let Err(e) = proxy.certs.reload(&pool).await {
        tracing::warn!(error = %e, "initial cert cache load failed");
    }

    let mut listener = match sqlx::postgres::PgListener::connect_with(&pool).await {
        Ok(l) => Some(l),
        Err(e) => {
            tracing::warn!(error = %e, "proxy could not subscribe to change notifications, falling back to polling only");
            None
        }
    };
    if let Some(listener) = listener.as_mut() {
        if let Err(e) = listener.listen(crate::db::NOTIFY_CHANNEL).await {
            tracing::warn!(error = %e, "proxy failed to listen on notify channel");
        }
    }

    let interval = Duration::from_secs(*EDGE_ROUTE_REFRESH_INTERVAL_SECS);
    loop {
        let notified = async {
            match listener.as_mut() {
                Some(listener) => {
                    let _ = listener.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
            _ = notified => {}
        }
        if let Err(e) = routes::reload(&pool, &proxy.routes).await {
            tracing::warn!(error = %e, "route table refresh failed");
        }
        if let Err(e) = proxy.certs.reload(&pool).await {
            tracing::warn!(error = %e, "cert cache refresh failed");
        }
    }
}

pub async fn run(pool: PgPool, cancel: CancellationToken) -> anyhow::Result<()> {
    let proxy = Arc::new(Proxy::new());

    let refresh_cancel = cancel.clone();
    let refresh_pool = pool.clone();
    let refresh_proxy = proxy.clone();
    tokio::spawn(run_refresh_loop(refresh_pool, refresh_proxy, refresh_cancel));

    let http_cancel = cancel.clone();
    let http_addr = EDGE_HTTP_ADDR.clone();
    let http_task = tokio::spawn(async move { server::run_http_redirect(&http_addr, http_cancel).await });

    let https_routes = proxy.routes.clone();
    let https_certs = proxy.certs.clone();
    let https_addr = EDGE_HTTPS_ADDR.clone();
    let https_task =
        tokio::spawn(async move { server::run_https(&https_addr, https_routes, https_certs, cancel).await });

    let (http_res, https_res) = tokio::join!(http_task, https_task);
    http_res??;
    https_res??;
    Ok(())
}
