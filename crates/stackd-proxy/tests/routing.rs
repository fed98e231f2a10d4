//! Proxy routing over real sockets: 503 before readiness, forwarding after,
//! and WebSocket-style upgrades relayed as raw bytes.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::header::{CONNECTION, HOST, RETRY_AFTER, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName};
use stackd_proxy::routes::RouteEntry;
use stackd_proxy::{Listener, RouteTable, tls};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

const LISTEN_PORT: u16 = 443;

// =========================================================================
// Upstream service
// =========================================================================

async fn upstream(mut req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.headers().contains_key(UPGRADE) {
        let on_upgrade = hyper::upgrade::on(&mut req);
        tokio::spawn(async move {
            let upgraded = on_upgrade.await.unwrap();
            let mut io = TokioIo::new(upgraded);
            let mut buf = [0u8; 64];
            loop {
                let n = io.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                if io.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        });
        let mut res = Response::new(Full::new(Bytes::new()));
        *res.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        res.headers_mut()
            .insert(UPGRADE, req.headers()[UPGRADE].clone());
        res.headers_mut()
            .insert(CONNECTION, "upgrade".parse().unwrap());
        return Ok(res);
    }

    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("none")
            .to_string()
    };
    let body = format!(
        "path={} xff={} proto={} real={} conn={}",
        req.uri(),
        header("x-forwarded-for"),
        header("x-forwarded-proto"),
        header("x-real-ip"),
        header("connection"),
    );
    Ok(Response::new(Full::new(Bytes::from(body))))
}

async fn spawn_upstream() -> SocketAddr {
    spawn_counting_upstream().await.0
}

/// Upstream that counts accepted TCP connections.
async fn spawn_counting_upstream() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(upstream))
                    .with_upgrades()
                    .await;
            });
        }
    });
    (addr, accepted)
}

async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

// =========================================================================
// Proxy + client helpers
// =========================================================================

struct Certs {
    _dir: tempfile::TempDir,
    cert: PathBuf,
    key: PathBuf,
    pem: String,
}

fn self_signed() -> Certs {
    let dir = tempfile::tempdir().unwrap();
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
        .unwrap()
        .self_signed(&key_pair)
        .unwrap();
    let cert_path = dir.path().join("server.pem");
    let key_path = dir.path().join("server-key.pem");
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();
    Certs {
        _dir: dir,
        cert: cert_path,
        key: key_path,
        pem: cert.pem(),
    }
}

fn connector(pem: &str) -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    for cert in CertificateDer::pem_slice_iter(pem.as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

struct Proxy {
    table: RouteTable,
    addr: SocketAddr,
    cancel: CancellationToken,
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start_proxy(target: SocketAddr, tls: Option<&Certs>, upgrade: bool) -> Proxy {
    let table = RouteTable::new(vec![RouteEntry {
        listen_port: LISTEN_PORT,
        tls: tls.is_some(),
        service: "ui".into(),
        target,
        upgrade,
    }])
    .unwrap();
    let acceptor = tls.map(|c| tls::acceptor(&c.cert, &c.key).unwrap());
    let listener = Listener::bind(
        "127.0.0.1:0".parse().unwrap(),
        LISTEN_PORT,
        acceptor,
        table.reader(),
    )
    .await
    .unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(listener.serve(cancel.clone()));
    Proxy {
        table,
        addr,
        cancel,
    }
}

async fn client<I>(io: I) -> SendRequest<Empty<Bytes>>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.with_upgrades().await;
    });
    sender
}

async fn plain_client(addr: SocketAddr) -> SendRequest<Empty<Bytes>> {
    client(TcpStream::connect(addr).await.unwrap()).await
}

async fn tls_client(addr: SocketAddr, certs: &Certs) -> SendRequest<Empty<Bytes>> {
    let tcp = TcpStream::connect(addr).await.unwrap();
    let stream = connector(&certs.pem)
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap();
    client(stream).await
}

fn get(path: &str) -> Request<Empty<Bytes>> {
    Request::builder()
        .uri(path)
        .header(HOST, "localhost")
        .body(Empty::new())
        .unwrap()
}

async fn body_text(res: Response<Incoming>) -> String {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

// =========================================================================
// Scenarios
// =========================================================================

#[tokio::test]
async fn tls_route_rejects_until_target_healthy_then_forwards() {
    let certs = self_signed();
    let target = spawn_upstream().await;
    let proxy = start_proxy(target, Some(&certs), false).await;

    let mut sender = tls_client(proxy.addr, &certs).await;
    let res = sender.send_request(get("/api")).await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(res.headers()[RETRY_AFTER], "1");
    assert!(body_text(res).await.contains("ui"));

    proxy.table.set_ready("ui", true);

    // Same client connection, now forwarded.
    sender.ready().await.unwrap();
    let res = sender.send_request(get("/api?x=1")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_text(res).await;
    assert!(body.contains("path=/api?x=1"), "{body}");
    assert!(body.contains("xff=127.0.0.1"), "{body}");
    assert!(body.contains("proto=https"), "{body}");
    assert!(body.contains("real=127.0.0.1"), "{body}");
}

#[tokio::test]
async fn keep_alive_client_reuses_one_upstream_connection() {
    let (target, accepted) = spawn_counting_upstream().await;
    let proxy = start_proxy(target, None, false).await;
    proxy.table.set_ready("ui", true);

    let mut sender = plain_client(proxy.addr).await;
    for i in 0..3 {
        sender.ready().await.unwrap();
        let res = sender.send_request(get(&format!("/req/{i}"))).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(body_text(res).await.contains(&format!("path=/req/{i}")));
    }
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn withdrawn_route_stops_forwarding() {
    let target = spawn_upstream().await;
    let proxy = start_proxy(target, None, false).await;
    proxy.table.set_ready("ui", true);

    let mut sender = plain_client(proxy.addr).await;
    let res = sender.send_request(get("/")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_text(res).await;
    assert!(body.contains("proto=http "), "{body}");

    proxy.table.set_ready("ui", false);
    sender.ready().await.unwrap();
    let res = sender.send_request(get("/")).await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn unreachable_upstream_yields_bad_gateway() {
    let proxy = start_proxy(unused_addr().await, None, false).await;
    proxy.table.set_ready("ui", true);

    let mut sender = plain_client(proxy.addr).await;
    let res = sender.send_request(get("/")).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
}

fn upgrade_request() -> Request<Empty<Bytes>> {
    Request::builder()
        .uri("/ws")
        .header(HOST, "localhost")
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "websocket")
        .body(Empty::new())
        .unwrap()
}

#[tokio::test]
async fn websocket_upgrade_is_relayed_over_tls() {
    let certs = self_signed();
    let target = spawn_upstream().await;
    let proxy = start_proxy(target, Some(&certs), true).await;
    proxy.table.set_ready("ui", true);

    let mut sender = tls_client(proxy.addr, &certs).await;
    let res = sender.send_request(upgrade_request()).await.unwrap();
    assert_eq!(res.status(), StatusCode::SWITCHING_PROTOCOLS);
    assert_eq!(res.headers()[UPGRADE], "websocket");

    let upgraded = hyper::upgrade::on(res).await.unwrap();
    let mut io = TokioIo::new(upgraded);
    io.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    io.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn upgrade_headers_dropped_when_route_disallows() {
    let target = spawn_upstream().await;
    let proxy = start_proxy(target, None, false).await;
    proxy.table.set_ready("ui", true);

    let mut sender = plain_client(proxy.addr).await;
    let res = sender.send_request(upgrade_request()).await.unwrap();
    // The upstream never saw Upgrade, so it answered as plain HTTP.
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_text(res).await;
    assert!(body.contains("conn=none"), "{body}");
}
