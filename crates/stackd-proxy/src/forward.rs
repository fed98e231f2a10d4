//! Per-request forwarding.
//!
//! Every client connection owns at most one upstream HTTP/1.1 connection,
//! opened lazily and re-opened if the upstream closes it. The route is
//! checked on every request so a target that drops out of `Healthy` stops
//! receiving traffic immediately.

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::header::{
    CONNECTION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, RETRY_AFTER, UPGRADE,
};
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{ProxyError, Result};
use crate::routes::{RouteEntry, RouteReader};

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// State shared by every request on one client connection.
pub struct ClientConnection {
    listen_port: u16,
    peer: SocketAddr,
    tls: bool,
    reader: RouteReader,
    upstream: Mutex<Option<SendRequest<ProxyBody>>>,
}

impl ClientConnection {
    pub fn new(listen_port: u16, peer: SocketAddr, tls: bool, reader: RouteReader) -> Self {
        Self {
            listen_port,
            peer,
            tls,
            reader,
            upstream: Mutex::new(None),
        }
    }

    async fn send(&self, entry: &RouteEntry, req: Request<ProxyBody>) -> Result<Response<Incoming>> {
        let mut slot = self.upstream.lock().await;
        let reused = match slot.take() {
            Some(mut sender) => sender.ready().await.is_ok().then_some(sender),
            None => None,
        };
        let sender = match reused {
            Some(sender) => sender,
            None => connect(entry).await?,
        };
        let sender = slot.insert(sender);
        sender
            .send_request(req)
            .await
            .map_err(|e| upstream_error(entry, e))
    }
}

/// Serve one client request against the current route snapshot.
pub async fn handle(
    mut req: Request<Incoming>,
    conn: Arc<ClientConnection>,
) -> std::result::Result<Response<ProxyBody>, Infallible> {
    let snapshot = conn.reader.current();
    let Some(entry) = snapshot.routed(conn.listen_port).cloned() else {
        let service = snapshot
            .get(conn.listen_port)
            .map_or("unknown", |slot| slot.entry.service.as_str());
        let err = ProxyError::TargetUnavailable {
            service: service.to_string(),
        };
        debug!(port = conn.listen_port, peer = %conn.peer, "{err}");
        return Ok(unavailable(service));
    };

    let wants_upgrade = entry.upgrade && is_upgrade_request(req.headers());
    let client_upgrade = wants_upgrade.then(|| hyper::upgrade::on(&mut req));
    let upstream_req = upstream_request(req, conn.peer.ip(), conn.tls, wants_upgrade);

    let mut response = match conn.send(&entry, upstream_req).await {
        Ok(response) => response,
        Err(e) => {
            warn!(service = %entry.service, target = %entry.target, error = %e, "Forwarding failed");
            return Ok(bad_gateway(&entry.service));
        }
    };

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        let Some(client_upgrade) = client_upgrade else {
            warn!(service = %entry.service, "Upstream switched protocols without an allowed upgrade");
            return Ok(bad_gateway(&entry.service));
        };
        let upstream_upgrade = hyper::upgrade::on(&mut response);
        tokio::spawn(relay_upgraded(
            client_upgrade,
            upstream_upgrade,
            entry.service.clone(),
        ));
        return Ok(response.map(BodyExt::boxed));
    }

    strip_hop_by_hop(response.headers_mut(), false);
    Ok(response.map(BodyExt::boxed))
}

fn upstream_request(
    req: Request<Incoming>,
    client: IpAddr,
    tls: bool,
    keep_upgrade: bool,
) -> Request<ProxyBody> {
    let (mut parts, body) = req.into_parts();
    parts.uri = parts
        .uri
        .path_and_query()
        .and_then(|pq| pq.as_str().parse::<Uri>().ok())
        .unwrap_or_default();
    parts.version = Version::HTTP_11;
    strip_hop_by_hop(&mut parts.headers, keep_upgrade);
    add_forwarded_headers(&mut parts.headers, client, tls);
    Request::from_parts(parts, body.boxed())
}

async fn connect(entry: &RouteEntry) -> Result<SendRequest<ProxyBody>> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(entry.target))
        .await
        .map_err(|_| upstream_error(entry, "connect timed out"))?
        .map_err(|e| upstream_error(entry, e))?;
    stream.set_nodelay(true).ok();

    let (sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| upstream_error(entry, e))?;
    let service = entry.service.clone();
    tokio::spawn(async move {
        if let Err(e) = connection.with_upgrades().await {
            debug!(service, error = %e, "Upstream connection closed");
        }
    });
    Ok(sender)
}

async fn relay_upgraded(client: OnUpgrade, upstream: OnUpgrade, service: String) {
    let (client, upstream) = match tokio::try_join!(client, upstream) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(service, error = %e, "Upgrade handshake failed");
            return;
        }
    };
    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            debug!(service, to_upstream, to_client, "Upgraded connection closed");
        }
        Err(e) => debug!(service, error = %e, "Upgraded connection ended"),
    }
}

fn upstream_error(entry: &RouteEntry, e: impl std::fmt::Display) -> ProxyError {
    ProxyError::Upstream {
        service: entry.service.clone(),
        message: e.to_string(),
    }
}

/// `Connection: upgrade` together with an `Upgrade` header.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(UPGRADE)
        && connection_tokens(headers)
            .iter()
            .any(|token| token == "upgrade")
}

fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Remove hop-by-hop headers, including any named by `Connection`.
///
/// With `keep_upgrade`, the `Upgrade` value survives and `Connection` is
/// reduced to `upgrade`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
    let upgrade = if keep_upgrade {
        headers.get(UPGRADE).cloned()
    } else {
        None
    };
    for token in connection_tokens(headers) {
        headers.remove(token.as_str());
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    if let Some(value) = upgrade {
        headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(UPGRADE, value);
    }
}

/// Append the client to `X-Forwarded-For` and set the proto and real-ip headers.
pub fn add_forwarded_headers(headers: &mut HeaderMap, client: IpAddr, tls: bool) {
    let client_ip = client.to_canonical().to_string();
    let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.trim().is_empty() => format!("{existing}, {client_ip}"),
        _ => client_ip.clone(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    headers.insert(
        X_FORWARDED_PROTO,
        HeaderValue::from_static(if tls { "https" } else { "http" }),
    );
    if let Ok(value) = HeaderValue::from_str(&client_ip) {
        headers.insert(X_REAL_IP, value);
    }
}

fn full(body: String) -> ProxyBody {
    Full::new(Bytes::from(body))
        .map_err(|never| match never {})
        .boxed()
}

fn text_response(status: StatusCode, body: String) -> Response<ProxyBody> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// `503` for a route whose target is not healthy.
pub fn unavailable(service: &str) -> Response<ProxyBody> {
    let mut response = text_response(
        StatusCode::SERVICE_UNAVAILABLE,
        format!("service '{service}' is not available\n"),
    );
    response
        .headers_mut()
        .insert(RETRY_AFTER, HeaderValue::from_static("1"));
    response
}

/// `502` when the upstream could not be reached.
pub fn bad_gateway(service: &str) -> Response<ProxyBody> {
    text_response(
        StatusCode::BAD_GATEWAY,
        format!("service '{service}' could not be reached\n"),
    )
}
