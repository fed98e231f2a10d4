//! External listeners: TCP accept, optional TLS, HTTP/1.1 per connection.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, Result};
use crate::forward::{self, ClientConnection};
use crate::routes::{RouteReader, RouteTable};

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// One bound listener serving a single route.
pub struct Listener {
    socket: TcpListener,
    listen_port: u16,
    acceptor: Option<TlsAcceptor>,
    reader: RouteReader,
}

impl Listener {
    /// Bind `addr` and serve the route configured for `listen_port`.
    ///
    /// `addr` normally carries `listen_port` itself; tests bind port 0.
    pub async fn bind(
        addr: SocketAddr,
        listen_port: u16,
        acceptor: Option<TlsAcceptor>,
        reader: RouteReader,
    ) -> Result<Self> {
        let socket = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        Ok(Self {
            socket,
            listen_port,
            acceptor,
            reader,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Accept connections until `cancel` fires.
    pub async fn serve(self, cancel: CancellationToken) {
        let tls = self.acceptor.is_some();
        info!(
            port = self.listen_port,
            addr = ?self.socket.local_addr().ok(),
            tls,
            "Proxy listener started"
        );
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                accepted = self.socket.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let conn = Arc::new(ClientConnection::new(
                            self.listen_port,
                            peer,
                            tls,
                            self.reader.clone(),
                        ));
                        tokio::spawn(serve_stream(
                            stream,
                            self.acceptor.clone(),
                            conn,
                            cancel.child_token(),
                        ));
                    }
                    Err(e) => {
                        warn!(port = self.listen_port, error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
        info!(port = self.listen_port, "Proxy listener stopped");
    }
}

async fn serve_stream(
    stream: TcpStream,
    acceptor: Option<TlsAcceptor>,
    conn: Arc<ClientConnection>,
    cancel: CancellationToken,
) {
    stream.set_nodelay(true).ok();
    match acceptor {
        None => serve_http(TokioIo::new(stream), conn, cancel).await,
        Some(acceptor) => {
            match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => serve_http(TokioIo::new(tls), conn, cancel).await,
                Ok(Err(e)) => debug!(error = %e, "TLS handshake failed"),
                Err(_) => debug!("TLS handshake timed out"),
            }
        }
    }
}

async fn serve_http<I>(io: I, conn: Arc<ClientConnection>, cancel: CancellationToken)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let service = service_fn(move |req| forward::handle(req, Arc::clone(&conn)));
    let connection = http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades();
    tokio::pin!(connection);

    tokio::select! {
        result = connection.as_mut() => {
            if let Err(e) = result {
                debug!(error = %e, "Client connection error");
            }
        }
        () = cancel.cancelled() => {
            connection.as_mut().graceful_shutdown();
            if let Err(e) = connection.await {
                debug!(error = %e, "Client connection error during shutdown");
            }
        }
    }
}

/// Every route listener of a stack, running until cancelled.
pub struct ProxyServer {
    addrs: BTreeMap<u16, SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProxyServer {
    /// Bind one listener per route in `table` on `bind`.
    ///
    /// TLS routes must have an entry in `acceptors`, keyed by listen port.
    pub async fn start(
        bind: IpAddr,
        table: &RouteTable,
        mut acceptors: HashMap<u16, TlsAcceptor>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let snapshot = table.snapshot();
        let mut listeners = Vec::new();
        for slot in snapshot.slots() {
            let port = slot.entry.listen_port;
            let acceptor = if slot.entry.tls {
                Some(acceptors.remove(&port).ok_or_else(|| {
                    ProxyError::Tls(format!(
                        "no certificate material for '{}' on port {port}",
                        slot.entry.service
                    ))
                })?)
            } else {
                None
            };
            let listener =
                Listener::bind(SocketAddr::new(bind, port), port, acceptor, table.reader()).await?;
            listeners.push(listener);
        }

        let mut addrs = BTreeMap::new();
        let mut tasks = Vec::with_capacity(listeners.len());
        for listener in listeners {
            addrs.insert(listener.listen_port, listener.local_addr()?);
            tasks.push(tokio::spawn(listener.serve(cancel.clone())));
        }
        Ok(Self { addrs, tasks })
    }

    pub fn local_addr(&self, listen_port: u16) -> Option<SocketAddr> {
        self.addrs.get(&listen_port).copied()
    }

    /// Wait for every listener to stop.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Proxy listener task panicked");
            }
        }
    }
}
