//! The edge proxy's two listeners: an HTTP port that redirects to HTTPS
//! (plus a health check), and the HTTPS port that terminates TLS by SNI
//! and reverse-proxies to the host:port the route table picks.

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, HOST};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use super::certs::{CertCache, SniResolver};
use super::routes::{RouteLookup, RouteTableHandle};

type ProxyBody = http_body_util::combinators::BoxBody<hyper::body::Bytes, hyper::Error>;
type ProxyClient = Client<HttpConnector, Incoming>;

#[derive(Clone)]
struct ProxyState {
    routes: RouteTableHandle,
    client: ProxyClient,
}

pub async fn run_http_redirect(addr: &str, cancel: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr, "http redirect listener started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, _peer) = accepted?;
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(redirect_or_health);
                    if let Err(e) = hyper::server::conn::http1::Builder::new().serve_connection(io, service).await {
                        tracing::debug!(error = %e, "http redirect connection ended");
                    }
                });
            }
        }
    }
}

async fn redirect_or_health(req: Request<Incoming>) -> Result<Response<ProxyBody>, Infallible> {
    if req.uri().path() == "/health" {
        return Ok(text_response(StatusCode::OK, "ok"));
    }
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let location = format!("https://{host}{}", req.uri().path_and_query().map(|p| p.as_str()).unwrap_or("/"));
    let mut resp = Response::builder().status(StatusCode::PERMANENT_REDIRECT).body(empty_body()).unwrap();
    if let Ok(value) = HeaderValue::from_str(&location) {
        resp.headers_mut().insert(hyper::header::LOCATION, value);
    }
    Ok(resp)
}

pub async fn run_https(
    addr: &str,
    routes: RouteTableHandle,
    certs: Arc<CertCache>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut server_config = ServerConfig::builder_with_protocol_versions(&[
        &tokio_rustls::rustls::version::TLS13,
        &tokio_rustls::rustls::version::TLS12,
    ])
    .with_no_client_auth()
    .with_cert_resolver(Arc::new(SniResolver(certs)));
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr, "https listener started");

    let client: ProxyClient = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
    let state = Arc::new(ProxyState { routes, client });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let acceptor = acceptor.clone();
                let state = state.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::debug!(error = %e, peer = %peer, "tls handshake failed");
                            return;
                        }
                    };
                    let io = TokioIo::new(tls_stream);
                    let service = service_fn(move |req| proxy_request(state.clone(), req));
                    if let Err(e) = hyper::server::conn::http1::Builder::new().serve_connection(io, service).await {
                        tracing::debug!(error = %e, peer = %peer, "https connection ended");
                    }
                });
            }
        }
    }
}

async fn proxy_request(state: Arc<ProxyState>, req: Request<Incoming>) -> Result<Response<ProxyBody>, Infallible> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_string())
        .unwrap_or_default();
    let browser_like = looks_like_browser(&req);

    let table = state.routes.load();
    let endpoint = match table.pick(&host) {
        RouteLookup::NoRoute => return Ok(error_response(StatusCode::NOT_FOUND, "no route for host", browser_like)),
        RouteLookup::Empty => {
            return Ok(error_response(StatusCode::BAD_GATEWAY, "no healthy endpoints", browser_like))
        }
        RouteLookup::Endpoint(e) => e,
    };

    let uri_string = format!(
        "http://{}:{}{}",
        endpoint.ip,
        endpoint.port,
        req.uri().path_and_query().map(|p| p.as_str()).unwrap_or("/")
    );
    let Ok(uri) = uri_string.parse() else {
        return Ok(error_response(StatusCode::BAD_GATEWAY, "invalid upstream uri", browser_like));
    };

    let (mut parts, body) = req.into_parts();
    parts.uri = uri;
    let upstream_req = Request::from_parts(parts, body);

    let upstream_resp = tokio::time::timeout(std::time::Duration::from_secs(30), state.client.request(upstream_req)).await;
    let mut resp = match upstream_resp {
        Ok(Ok(resp)) => resp.map(|b| b.map_err(|e| hyper::Error::from(e)).boxed()),
        Ok(Err(e)) => {
            tracing::warn!(host, error = %e, "upstream request failed");
            return Ok(error_response(StatusCode::BAD_GATEWAY, "upstream error", browser_like));
        }
        Err(_) => return Ok(error_response(StatusCode::GATEWAY_TIMEOUT, "upstream timed out", browser_like)),
    };

    resp.headers_mut().insert("server", HeaderValue::from_static("Zeitwork"));
    if let Ok(value) = HeaderValue::from_str(&format!("{}:{}", endpoint.ip, endpoint.port)) {
        resp.headers_mut().insert("x-zeitwork-endpoint", value);
    }
    Ok(resp)
}

fn empty_body() -> ProxyBody {
    http_body_util::Empty::new().map_err(|never| match never {}).boxed()
}

fn text_response(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .body(http_body_util::Full::new(hyper::body::Bytes::from_static(body.as_bytes())).map_err(|never| match never {}).boxed())
        .unwrap()
}

/// `Accept: text/html` or a `User-Agent` naming a known browser engine —
/// good enough to decide whether an error page should be HTML or plain text.
fn looks_like_browser(req: &Request<Incoming>) -> bool {
    let accepts_html = req
        .headers()
        .get(hyper::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/html"));
    let browser_ua = req
        .headers()
        .get(hyper::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("Mozilla") || v.contains("Gecko") || v.contains("WebKit") || v.contains("Chrome"));
    accepts_html || browser_ua
}

fn error_response(status: StatusCode, message: &'static str, browser_like: bool) -> Response<ProxyBody> {
    if !browser_like {
        return text_response(status, message);
    }
    let html = format!(
        "<!doctype html><html><head><title>{code}</title></head>\
         <body><h1>{code}</h1><p>{message}</p></body></html>",
        code = status.as_u16()
    );
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(http_body_util::Full::new(hyper::body::Bytes::from(html)).map_err(|never| match never {}).boxed())
        .unwrap()
}
