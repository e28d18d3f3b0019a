use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use zeitwork::config;
use zeitwork::db;
use zeitwork::proxy;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).json().init();
    dotenvy::dotenv().ok();
    config::assert_proxy_env();

    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("rustls default crypto provider installs exactly once per process");

    let pool = db::connect().await?;
    let cancel = CancellationToken::new();

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    tracing::info!("zeitwork edge proxy started");
    proxy::run(pool, cancel).await
}
