//! VM<->host private channel: a per-VM HTTP server on the guest-dialed
//! Unix socket exposing `GET /config` and `POST /logs`, plus the
//! host-to-guest `CONNECT <port>\n` / `OK <cid>\n` handshake.

use dashmap::DashMap;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use sqlx::PgPool;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use uuid::Uuid;

type ChannelBody = http_body_util::combinators::BoxBody<hyper::body::Bytes, hyper::Error>;

#[derive(Clone, Debug)]
pub struct VmInfo {
    pub env: Vec<String>,
    pub ip_addr: String,
    pub ip_gw: String,
}

#[derive(Serialize)]
struct ConfigResponse {
    env: Vec<String>,
    ip_addr: String,
    ip_gw: String,
    hostname: String,
}

struct Entry {
    info: VmInfo,
    shutdown: tokio::sync::oneshot::Sender<()>,
}

#[derive(Clone)]
pub struct ChannelRegistry {
    pool: PgPool,
    entries: Arc<DashMap<Uuid, Entry>>,
}

pub fn socket_path(vm_id: Uuid, port: u16) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("vsock-{vm_id}.sock_{port}"))
}

impl ChannelRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, entries: Arc::new(DashMap::new()) }
    }

    /// Registers and binds the per-VM config/log server. Must happen
    /// before the hypervisor is launched so the guest's first dial finds a
    /// listener already waiting.
    pub async fn register(&self, vm_id: Uuid, port: u16, info: VmInfo) -> anyhow::Result<()> {
        let path = socket_path(vm_id, port);
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;

        let state = Arc::new(ChannelState { pool: self.pool.clone(), vm_id, info: info.clone() });

        let (tx, mut rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => return,
                    accepted = listener.accept() => {
                        let Ok((stream, _addr)) = accepted else { return };
                        let state = state.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| handle_request(state.clone(), req));
                            if let Err(e) = hyper::server::conn::http1::Builder::new().serve_connection(io, service).await {
                                tracing::debug!(error = %e, vm = %state.vm_id, "vm channel connection ended");
                            }
                        });
                    }
                }
            }
        });

        self.entries.insert(vm_id, Entry { info, shutdown: tx });
        Ok(())
    }

    pub async fn deregister(&self, vm_id: Uuid) {
        if let Some((_, entry)) = self.entries.remove(&vm_id) {
            let _ = entry.shutdown.send(());
        }
    }
}

struct ChannelState {
    pool: PgPool,
    vm_id: Uuid,
    info: VmInfo,
}

async fn handle_request(state: Arc<ChannelState>, req: Request<Incoming>) -> Result<Response<ChannelBody>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&hyper::Method::GET, "/config") => Ok(get_config(&state)),
        (&hyper::Method::POST, "/logs") => Ok(post_logs(&state, req).await),
        _ => Ok(Response::builder().status(StatusCode::NOT_FOUND).body(empty_body()).unwrap()),
    }
}

fn get_config(state: &ChannelState) -> Response<ChannelBody> {
    let payload = ConfigResponse {
        env: state.info.env.clone(),
        ip_addr: state.info.ip_addr.clone(),
        ip_gw: state.info.ip_gw.clone(),
        hostname: state.vm_id.to_string(),
    };
    let body = serde_json::to_vec(&payload).expect("ConfigResponse always serializes");
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(full_body(body))
        .unwrap()
}

async fn post_logs(state: &ChannelState, req: Request<Incoming>) -> Response<ChannelBody> {
    let mut body = req.into_body();
    let mut buf = Vec::new();
    loop {
        match body.frame().await {
            Some(Ok(frame)) => {
                let Some(chunk) = frame.data_ref() else { continue };
                buf.extend_from_slice(chunk);
                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line).trim_end().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    if let Err(e) = sqlx::query("INSERT INTO vm_logs (vm_id, message) VALUES ($1, $2)")
                        .bind(state.vm_id)
                        .bind(&line)
                        .execute(&state.pool)
                        .await
                    {
                        tracing::warn!(vm = %state.vm_id, error = %e, "failed to persist vm log line");
                    }
                    if line.starts_with("ZEITWORK_BUILD_EXIT=") {
                        if let Err(e) = sqlx::query(
                            "INSERT INTO build_logs (build_id, message)
                             SELECT id, $2 FROM builds WHERE vm_id = $1",
                        )
                        .bind(state.vm_id)
                        .bind(&line)
                        .execute(&state.pool)
                        .await
                        {
                            tracing::warn!(error = %e, "failed to persist build sentinel line");
                        }
                    }
                }
            }
            Some(Err(_)) | None => break,
        }
    }
    Response::builder().status(StatusCode::OK).body(empty_body()).unwrap()
}

fn empty_body() -> ChannelBody {
    http_body_util::Empty::new().map_err(|never| match never {}).boxed()
}

fn full_body(bytes: Vec<u8>) -> ChannelBody {
    http_body_util::Full::new(hyper::body::Bytes::from(bytes)).map_err(|never| match never {}).boxed()
}

/// Dials the hypervisor's base vsock-backed Unix socket for the
/// host-to-guest direction: `CONNECT <port>\n`, expect `OK <cid>\n`, then
/// the stream is a raw bidirectional pipe to the guest.
pub async fn connect_to_guest(vm_id: Uuid, port: u16) -> anyhow::Result<UnixStream> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let base_socket = std::env::temp_dir().join(format!("vsock-{vm_id}.sock"));
    let mut stream = UnixStream::connect(&base_socket).await?;
    stream.write_all(format!("CONNECT {port}\n").as_bytes()).await?;

    let mut reader = BufReader::new(&mut stream);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    if !line.trim_end().starts_with("OK ") {
        anyhow::bail!("unexpected handshake response: {line}");
    }
    Ok(stream)
}
