//! HTTP server, graceful shutdown and live restart.
//!
//! # Lifecycle
//!
//! [`Server::bind`] opens one socket per [`ServerListenConfig`], adopting a
//! socket inherited from a restarting parent when one is present for the same
//! address. [`Server::serve`] then runs one accept loop per socket until a
//! shutdown trigger fires:
//!
//! - the cancellation token passed to `serve` (the application's),
//! - **SIGTERM** or **Ctrl-C**,
//! - **SIGTERM from a restarted child** once it is accepting.
//!
//! On shutdown every accept loop stops taking connections, asks open
//! connections to finish their current request, and waits up to
//! [`ServerConfig::grace`] (30 s by default) before closing what is left.
//!
//! **SIGUSR2** triggers a live restart: the same binary is started with the
//! listening sockets on fds 3, 4, … and `EUDORE_GRACEFUL_ADDRS` naming their
//! addresses in order. The parent keeps serving until the child signals that
//! it is up.

mod graceful;
mod tls;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::handler::BoxFuture;
use crate::value::{deserialize_duration, serialize_duration};

pub use graceful::ENV_GRACEFUL_ADDRS;

/// Serves one request. The server calls it once per request on a connection.
pub type RequestHandler = Arc<
    dyn Fn(http::Request<Incoming>, SocketAddr) -> BoxFuture<'static, http::Response<Full<Bytes>>>
        + Send
        + Sync,
>;

// ── Config ────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    #[default]
    Off,
    Tls,
    /// TLS with client certificates checked against `trustfile`.
    Mutual,
}

/// One listening socket.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerListenConfig {
    pub addr: String,
    pub tls: TlsMode,
    pub certfile: Option<PathBuf>,
    pub keyfile: Option<PathBuf>,
    /// Trust anchors for client certificates in mutual TLS.
    pub trustfile: Option<PathBuf>,
    /// Offer HTTP/2 next to HTTP/1.1. Off forces HTTP/1 only.
    pub http2: bool,
    /// Time allowed for a client to send the request head. Zero uses
    /// [`ServerConfig::read_header_timeout`].
    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub read_timeout: Duration,
    /// Time allowed for the application to produce a response; 503 after.
    /// Zero disables the limit.
    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub write_timeout: Duration,
    /// HTTP/2 keep-alive ping interval on idle connections. Zero disables it.
    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub idle_timeout: Duration,
}

impl Default for ServerListenConfig {
    fn default() -> Self {
        Self {
            addr: String::new(),
            tls: TlsMode::Off,
            certfile: None,
            keyfile: None,
            trustfile: None,
            http2: true,
            read_timeout: Duration::ZERO,
            write_timeout: Duration::ZERO,
            idle_timeout: Duration::ZERO,
        }
    }
}

impl ServerListenConfig {
    /// Plain HTTP on `addr`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into(), ..Self::default() }
    }

    /// HTTPS on `addr` with a PEM certificate chain and private key.
    pub fn tls(addr: impl Into<String>, certfile: impl Into<PathBuf>, keyfile: impl Into<PathBuf>) -> Self {
        Self {
            addr: addr.into(),
            tls: TlsMode::Tls,
            certfile: Some(certfile.into()),
            keyfile: Some(keyfile.into()),
            ..Self::default()
        }
    }

    /// Requires client certificates issued by the PEM anchors in `trustfile`.
    pub fn mutual(mut self, trustfile: impl Into<PathBuf>) -> Self {
        self.tls = TlsMode::Mutual;
        self.trustfile = Some(trustfile.into());
        self
    }

    pub fn http2(mut self, on: bool) -> Self {
        self.http2 = on;
        self
    }
}

/// Settings shared by every listener.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Drain window on shutdown.
    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub grace: Duration,
    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub read_header_timeout: Duration,
    /// HTTP/1 connection buffer size. Zero keeps hyper's default; otherwise at
    /// least 8 KiB.
    pub max_buf_size: usize,
    /// Interval of the log-sync tick.
    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub log_sync: Duration,
    /// React to SIGTERM, Ctrl-C and SIGUSR2.
    pub signals: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(30),
            read_header_timeout: Duration::from_secs(60),
            max_buf_size: 0,
            log_sync: Duration::from_millis(80),
            signals: true,
        }
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

struct Listener {
    config: ServerListenConfig,
    tcp: TcpListener,
    tls: Option<TlsAcceptor>,
}

/// A set of bound listeners, ready to serve.
pub struct Server {
    config: ServerConfig,
    listeners: Vec<Listener>,
    inherited: Vec<(String, std::net::TcpListener)>,
}

impl Server {
    /// An empty server. Sockets passed down by a restarting parent are taken
    /// over here and handed out by [`Server::listen`].
    pub fn new(config: ServerConfig) -> Result<Self, Error> {
        Ok(Self { config, listeners: Vec::new(), inherited: graceful::inherited()? })
    }

    /// Binds every listen config.
    pub async fn bind(listen: &[ServerListenConfig], config: ServerConfig) -> Result<Self, Error> {
        let mut server = Self::new(config)?;
        for cfg in listen {
            server.listen(cfg).await?;
        }
        Ok(server)
    }

    /// Adds a listener, adopting the inherited socket for the same address
    /// when there is one. Returns the bound address.
    pub async fn listen(&mut self, cfg: &ServerListenConfig) -> Result<SocketAddr, Error> {
        let tls = tls::acceptor(cfg)?;
        let tcp = match self.inherited.iter().position(|(addr, _)| *addr == cfg.addr) {
            Some(i) => {
                let (_, socket) = self.inherited.swap_remove(i);
                info!(addr = %cfg.addr, "adopted inherited listener");
                TcpListener::from_std(socket)?
            }
            None => TcpListener::bind(cfg.addr.as_str())
                .await
                .map_err(|source| Error::ServerListen { addr: cfg.addr.clone(), source })?,
        };
        let local = tcp.local_addr()?;
        self.listeners.push(Listener { config: cfg.clone(), tcp, tls });
        Ok(local)
    }

    /// Addresses the listeners are actually bound to.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().filter_map(|l| l.tcp.local_addr().ok()).collect()
    }

    /// Accepts connections on every listener and dispatches requests through
    /// `handler`. Returns after a full graceful shutdown.
    pub async fn serve(self, handler: RequestHandler, shutdown: CancellationToken) -> Result<(), Error> {
        let Server { config, listeners, inherited } = self;
        for (addr, _) in inherited {
            warn!(addr = %addr, "inherited listener has no matching listen config, closing");
        }
        let stop = CancellationToken::new();

        #[cfg(unix)]
        let fds: Vec<(String, std::os::fd::RawFd)> = {
            use std::os::fd::AsRawFd;
            listeners.iter().map(|l| (l.config.addr.clone(), l.tcp.as_raw_fd())).collect()
        };

        let mut accepts = JoinSet::new();
        for listener in listeners {
            accepts.spawn(accept_loop(listener, config.clone(), Arc::clone(&handler), stop.clone()));
        }
        graceful::notify_parent();

        let mut signals = Signals::new(config.signals)?;
        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,

                trigger = signals.recv() => match trigger {
                    Trigger::Shutdown => {
                        info!("shutdown signal received");
                        break;
                    }
                    #[cfg(unix)]
                    Trigger::Restart => match graceful::restart(&fds) {
                        Ok(pid) => info!(pid, "restart: child started, waiting for it to take over"),
                        Err(e) => error!("restart failed: {e}"),
                    },
                },

                Some(res) = accepts.join_next(), if !accepts.is_empty() => {
                    if let Err(e) = res {
                        error!("accept loop failed: {e}");
                    }
                    if accepts.is_empty() {
                        break;
                    }
                }
            }
        }

        stop.cancel();
        while accepts.join_next().await.is_some() {}
        info!("server stopped");
        Ok(())
    }
}

async fn accept_loop(listener: Listener, config: ServerConfig, handler: RequestHandler, stop: CancellationToken) {
    let Listener { config: listen, tcp, tls } = listener;
    let builder = Arc::new(conn_builder(&listen, &config));
    let addr = tcp.local_addr().map(|a| a.to_string()).unwrap_or_else(|_| listen.addr.clone());
    info!(addr = %addr, tls = ?listen.tls, http2 = listen.http2, "eudore listening");

    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            biased;

            () = stop.cancelled() => {
                info!(addr = %addr, in_flight = tasks.len(), "stop accepting, draining connections");
                break;
            }

            res = tcp.accept() => {
                let (stream, peer) = match res {
                    Ok(v) => v,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };
                let conn = Connection {
                    builder: Arc::clone(&builder),
                    handler: Arc::clone(&handler),
                    write_timeout: listen.write_timeout,
                    peer,
                    stop: stop.clone(),
                };
                match &tls {
                    Some(acceptor) => {
                        let acceptor = acceptor.clone();
                        tasks.spawn(async move {
                            match acceptor.accept(stream).await {
                                Ok(stream) => conn.serve(stream).await,
                                Err(e) => debug!(peer = %peer, "tls handshake failed: {e}"),
                            }
                        });
                    }
                    None => {
                        tasks.spawn(conn.serve(stream));
                    }
                }
            }

            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    let drained = tokio::time::timeout(config.grace, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(addr = %addr, remaining = tasks.len(), "grace window elapsed, closing connections");
        tasks.abort_all();
    }
}

fn conn_builder(listen: &ServerListenConfig, config: &ServerConfig) -> ConnBuilder<TokioExecutor> {
    let mut builder = ConnBuilder::new(TokioExecutor::new());
    let header_timeout = match listen.read_timeout {
        d if d.is_zero() => config.read_header_timeout,
        d => d,
    };
    {
        let mut http1 = builder.http1();
        http1.timer(TokioTimer::new()).header_read_timeout(header_timeout);
        if config.max_buf_size >= 8192 {
            http1.max_buf_size(config.max_buf_size);
        }
    }
    if !listen.idle_timeout.is_zero() {
        builder
            .http2()
            .timer(TokioTimer::new())
            .keep_alive_interval(listen.idle_timeout);
    }
    if listen.http2 { builder } else { builder.http1_only() }
}

struct Connection {
    builder: Arc<ConnBuilder<TokioExecutor>>,
    handler: RequestHandler,
    write_timeout: Duration,
    peer: SocketAddr,
    stop: CancellationToken,
}

impl Connection {
    async fn serve<I>(self, io: I)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Connection { builder, handler, write_timeout, peer, stop } = self;
        let svc = service_fn(move |req: http::Request<Incoming>| {
            let fut = handler(req, peer);
            async move {
                if write_timeout.is_zero() {
                    return Ok::<_, Infallible>(fut.await);
                }
                Ok(tokio::time::timeout(write_timeout, fut).await.unwrap_or_else(|_| {
                    warn!(peer = %peer, "response not ready within {write_timeout:?}");
                    status_response(StatusCode::SERVICE_UNAVAILABLE)
                }))
            }
        });

        let conn = builder.serve_connection_with_upgrades(TokioIo::new(io), svc);
        tokio::pin!(conn);
        let res = tokio::select! {
            res = conn.as_mut() => res,
            () = stop.cancelled() => {
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        };
        if let Err(e) = res {
            debug!(peer = %peer, "connection error: {e}");
        }
    }
}

pub(crate) fn status_response(status: StatusCode) -> http::Response<Full<Bytes>> {
    let mut res = http::Response::new(Full::new(Bytes::new()));
    *res.status_mut() = status;
    res
}

// ── Signals ───────────────────────────────────────────────────────────────────

enum Trigger {
    Shutdown,
    #[cfg(unix)]
    Restart,
}

struct Signals {
    #[cfg(unix)]
    unix: Option<(tokio::signal::unix::Signal, tokio::signal::unix::Signal)>,
    enabled: bool,
}

impl Signals {
    fn new(enabled: bool) -> Result<Self, Error> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let unix = match enabled {
                true => Some((signal(SignalKind::terminate())?, signal(SignalKind::user_defined2())?)),
                false => None,
            };
            Ok(Self { unix, enabled })
        }
        #[cfg(not(unix))]
        Ok(Self { enabled })
    }

    /// Resolves on the next shutdown or restart request; never resolves when
    /// signal handling is off.
    async fn recv(&mut self) -> Trigger {
        if !self.enabled {
            return std::future::pending().await;
        }

        #[cfg(unix)]
        if let Some((term, usr2)) = &mut self.unix {
            return tokio::select! {
                Ok(()) = tokio::signal::ctrl_c() => Trigger::Shutdown,
                Some(()) = term.recv()           => Trigger::Shutdown,
                Some(()) = usr2.recv()           => Trigger::Restart,
                else => std::future::pending().await,
            };
        }

        match tokio::signal::ctrl_c().await {
            Ok(()) => Trigger::Shutdown,
            Err(_) => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_config_from_toml() {
        let cfg: ServerListenConfig = toml::from_str(
            r#"
            addr = "127.0.0.1:8443"
            tls = "mutual"
            certfile = "cert.pem"
            keyfile = "key.pem"
            trustfile = "ca.pem"
            http2 = false
            write_timeout = "5s"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.tls, TlsMode::Mutual);
        assert!(!cfg.http2);
        assert_eq!(cfg.write_timeout, Duration::from_secs(5));
        assert_eq!(cfg.read_timeout, Duration::ZERO);
    }

    #[test]
    fn server_config_defaults() {
        let cfg: ServerConfig = toml::from_str("grace = \"10s\"").unwrap();
        assert_eq!(cfg.grace, Duration::from_secs(10));
        assert_eq!(cfg.log_sync, Duration::from_millis(80));
        assert!(cfg.signals);
    }

    #[tokio::test]
    async fn bind_reports_listen_errors() {
        let err = Server::bind(&[ServerListenConfig::new("256.0.0.1:80")], ServerConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::ServerListen { .. }), "{err}");
    }

    #[tokio::test]
    async fn serve_returns_on_cancel() {
        let server = Server::bind(&[ServerListenConfig::new("127.0.0.1:0")], ServerConfig {
            signals: false,
            ..ServerConfig::default()
        })
        .await
        .unwrap();
        assert_eq!(server.local_addrs().len(), 1);

        let handler: RequestHandler = Arc::new(
            |_: http::Request<Incoming>, _: SocketAddr| -> BoxFuture<'static, http::Response<Full<Bytes>>> {
                Box::pin(async { status_response(StatusCode::OK) })
            },
        );
        let token = CancellationToken::new();
        let task = tokio::spawn(server.serve(handler, token.clone()));
        token.cancel();
        task.await.unwrap().unwrap();
    }
}
