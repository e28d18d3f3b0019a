use once_cell::sync::Lazy;
use std::time::Duration;

fn required(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} must be set"))
}

fn optional(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn optional_u64(name: &str, default: u64) -> u64 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

pub static DATABASE_URL: Lazy<String> = Lazy::new(|| required("DATABASE_URL"));
pub static INTERNAL_IP: Lazy<String> = Lazy::new(|| required("INTERNAL_IP"));
pub static INGRESS_IP: Lazy<String> = Lazy::new(|| required("INGRESS_IP"));
pub static REGION: Lazy<String> = Lazy::new(|| optional("REGION", "default"));

pub static REGISTRY_URL: Lazy<String> = Lazy::new(|| optional("REGISTRY_URL", "registry.zeitwork.internal"));
pub static REGISTRY_USER: Lazy<String> = Lazy::new(|| optional("REGISTRY_USER", ""));
pub static REGISTRY_PASSWORD: Lazy<String> = Lazy::new(|| optional("REGISTRY_PASSWORD", ""));

pub static GITHUB_APP_ID: Lazy<String> = Lazy::new(|| optional("GITHUB_APP_ID", ""));
pub static GITHUB_APP_PRIVATE_KEY_B64: Lazy<String> =
    Lazy::new(|| optional("GITHUB_APP_PRIVATE_KEY_B64", ""));

pub static S3_ENDPOINT: Lazy<String> = Lazy::new(|| required("S3_ENDPOINT"));
pub static S3_BUCKET: Lazy<String> = Lazy::new(|| required("S3_BUCKET"));
pub static S3_ACCESS_KEY: Lazy<String> = Lazy::new(|| required("S3_ACCESS_KEY"));
pub static S3_SECRET_KEY: Lazy<String> = Lazy::new(|| required("S3_SECRET_KEY"));

/// Read only; issuance itself is handled by an out-of-band ACME-driven process.
pub static ACME_EMAIL: Lazy<String> = Lazy::new(|| optional("ACME_EMAIL", ""));

pub static ENV_ENCRYPTION_KEY: Lazy<String> = Lazy::new(|| required("ENV_ENCRYPTION_KEY"));

pub static SERVER_DATA_DIR: Lazy<String> = Lazy::new(|| optional("SERVER_DATA_DIR", "/data"));

/// Pre-built image used for the short-lived builder VM the build reconciler
/// launches for every build.
pub static BUILDER_IMAGE_ID: Lazy<String> = Lazy::new(|| required("BUILDER_IMAGE_ID"));

pub static SCHEDULER_WORKERS: Lazy<u64> = Lazy::new(|| optional_u64("SCHEDULER_WORKERS", 32));
pub static HEARTBEAT_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| optional_u64("HEARTBEAT_INTERVAL_SECS", 10));
pub static DEAD_SERVER_THRESHOLD_SECS: Lazy<u64> =
    Lazy::new(|| optional_u64("DEAD_SERVER_THRESHOLD_SECS", 60));
pub static FAILOVER_SCAN_INTERVAL_SECS: Lazy<u64> =
    Lazy::new(|| optional_u64("FAILOVER_SCAN_INTERVAL_SECS", 30));
pub static HOST_ROUTE_SYNC_INTERVAL_SECS: Lazy<u64> =
    Lazy::new(|| optional_u64("HOST_ROUTE_SYNC_INTERVAL_SECS", 30));
pub static LEADER_RETRY_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| optional_u64("LEADER_RETRY_INTERVAL_SECS", 5));

pub static EDGE_HTTP_ADDR: Lazy<String> = Lazy::new(|| optional("EDGE_HTTP_ADDR", "0.0.0.0:8080"));
pub static EDGE_HTTPS_ADDR: Lazy<String> = Lazy::new(|| optional("EDGE_HTTPS_ADDR", "0.0.0.0:8443"));
pub static EDGE_ROUTE_REFRESH_INTERVAL_SECS: Lazy<u64> =
    Lazy::new(|| optional_u64("EDGE_ROUTE_REFRESH_INTERVAL_SECS", 6 * 3600));

pub fn heartbeat_interval() -> Duration {
    Duration::from_secs(*HEARTBEAT_INTERVAL_SECS)
}

pub fn dead_server_threshold() -> Duration {
    Duration::from_secs(*DEAD_SERVER_THRESHOLD_SECS)
}

/// Touches every variable the daemon binary requires, so a missing value
/// fails loudly at startup instead of on the first reconcile tick.
pub fn assert_daemon_env() {
    let _ = DATABASE_URL.as_str();
    let _ = INTERNAL_IP.as_str();
    let _ = INGRESS_IP.as_str();
    let _ = S3_ENDPOINT.as_str();
    let _ = S3_BUCKET.as_str();
    let _ = S3_ACCESS_KEY.as_str();
    let _ = S3_SECRET_KEY.as_str();
    let _ = ENV_ENCRYPTION_KEY.as_str();
    let _ = BUILDER_IMAGE_ID.as_str();
}

pub fn assert_proxy_env() {
    let _ = DATABASE_URL.as_str();
}
