//! Application glue.
//!
//! An [`App`] owns the router, the shared bind/render/validate components,
//! a pool of [`Context`]s and the root handler chain: global middleware
//! followed by the router dispatch, which always stays last.
//!
//! ```rust,no_run
//! use eudore::{App, Context, middleware};
//!
//! async fn hello(ctx: &mut Context) {
//!     ctx.write_string("hi");
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), eudore::Error> {
//!     let app = App::new();
//!     app.add_middleware([middleware::recover(), middleware::logger()]);
//!     app.router().get("/hello", hello);
//!     app.listen("0.0.0.0:8080").await;
//!     app.run().await
//! }
//! ```
//!
//! Errors reported through [`AppOption::Error`] (listen failures included)
//! cancel the application; the first one is returned by [`App::run`].

use std::io::Write as _;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use parking_lot::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Dispatch, Instrument, error, info, warn};

use crate::bind::Bind;
use crate::config::Config;
use crate::context::{Context, MAX_HANDLERS, Services};
use crate::error::{BoxError, Error};
use crate::handler::{BoxFuture, HandlerFunc};
use crate::middleware::panic_message;
use crate::render::Render;
use crate::router::{Router, RouterDispatch};
use crate::server::{RequestHandler, Server, ServerConfig, ServerListenConfig};
use crate::validate::Validator;

type SyncHook = Arc<dyn Fn() + Send + Sync>;

/// A component handed to [`App::set`]; each replaces the current one.
pub enum AppOption {
    /// Parent cancellation: the app stops when this token is cancelled. The
    /// app keeps a child token, so its own shutdown leaves the parent alone.
    Context(CancellationToken),
    /// Logger used for every request's log lines.
    Logger(Dispatch),
    /// Whole configuration: limits, server settings and listeners.
    Config(Config),
    Server(ServerConfig),
    Router(Router),
    Binder(Arc<dyn Bind>),
    Renderer(Arc<dyn Render>),
    Validator(Arc<Validator>),
    /// Cancels the app; the first error is kept for [`App::run`].
    Error(Error),
}

struct AppInner {
    cancel: RwLock<CancellationToken>,
    error: Mutex<Option<Error>>,
    config: RwLock<Config>,
    router: RwLock<Router>,
    middlewares: RwLock<Vec<HandlerFunc>>,
    handlers: RwLock<Arc<[HandlerFunc]>>,
    services: RwLock<Arc<Services>>,
    pool: Mutex<Vec<Box<Context>>>,
    server: tokio::sync::Mutex<Option<Server>>,
    sync_hooks: RwLock<Vec<SyncHook>>,
}

/// The application. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    /// An app with the default router, binder, renderer and validator. The
    /// validator shares the router's function creator.
    pub fn new() -> Self {
        let router = Router::new();
        let services = Services {
            validator: Arc::new(Validator::new(Arc::clone(router.creator()))),
            ..Services::default()
        };
        let app = Self {
            inner: Arc::new(AppInner {
                cancel: RwLock::new(CancellationToken::new()),
                error: Mutex::new(None),
                config: RwLock::new(Config::default()),
                router: RwLock::new(router),
                middlewares: RwLock::new(Vec::new()),
                handlers: RwLock::new(Arc::from(Vec::new())),
                services: RwLock::new(Arc::new(services)),
                pool: Mutex::new(Vec::new()),
                server: tokio::sync::Mutex::new(None),
                sync_hooks: RwLock::new(Vec::new()),
            }),
        };
        app.add_sync_hook(|| {
            let _ = std::io::stdout().flush();
        });
        app.rebuild_chain();
        app
    }

    /// Applies options in order.
    pub fn with(self, options: impl IntoIterator<Item = AppOption>) -> Self {
        for option in options {
            self.set(option);
        }
        self
    }

    /// Replaces one component.
    pub fn set(&self, option: AppOption) {
        match option {
            AppOption::Context(token) => *self.inner.cancel.write() = token.child_token(),
            AppOption::Logger(d)      => self.update_services(|s| s.logger = Some(d)),
            AppOption::Config(c) => {
                self.update_services(|s| {
                    s.body_limit = c.context.body_limit;
                    s.multipart_limit = c.context.multipart_limit;
                });
                *self.inner.config.write() = c;
            }
            AppOption::Server(c)    => self.inner.config.write().server = c,
            AppOption::Router(r) => {
                let creator = Arc::clone(r.creator());
                *self.inner.router.write() = r;
                self.update_services(|s| s.validator = Arc::new(s.validator.with_creator(creator)));
                self.rebuild_chain();
            }
            AppOption::Binder(b)    => self.update_services(|s| s.binder = b),
            AppOption::Renderer(r)  => self.update_services(|s| s.renderer = r),
            AppOption::Validator(v) => self.update_services(|s| s.validator = v),
            AppOption::Error(e)     => self.report(e),
        }
    }

    fn update_services(&self, f: impl FnOnce(&mut Services)) {
        let mut services = self.inner.services.write();
        let mut next = Services::clone(&services);
        f(&mut next);
        *services = Arc::new(next);
    }

    fn report(&self, err: Error) {
        {
            let mut slot = self.inner.error.lock();
            if slot.is_none() {
                error!("app error: {err}");
                *slot = Some(err);
            } else {
                warn!("app error after cancellation: {err}");
            }
        }
        self.inner.cancel.read().cancel();
    }

    // ── Components ────────────────────────────────────────────────────────────

    pub fn router(&self) -> Router {
        self.inner.router.read().clone()
    }

    /// The validator requests currently use. Rules registered on it apply to
    /// every later [`Context::bind`] and [`Context::validate`].
    pub fn validator(&self) -> Arc<Validator> {
        Arc::clone(&self.inner.services.read().validator)
    }

    pub fn config(&self) -> Config {
        self.inner.config.read().clone()
    }

    /// The application token; every request's token is a child of it.
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.read().clone()
    }

    /// Stops the app; [`App::run`] returns once the server has drained.
    pub fn shutdown(&self) {
        self.inner.cancel.read().cancel();
    }

    /// Appends global middleware. It runs for every request, matched or not,
    /// before the router dispatch.
    pub fn add_middleware(&self, handlers: impl IntoIterator<Item = HandlerFunc>) {
        self.inner.middlewares.write().extend(handlers);
        self.rebuild_chain();
    }

    fn rebuild_chain(&self) {
        let router = self.inner.router.read().clone();
        let middlewares = self.inner.middlewares.read();
        let mut chain: Vec<HandlerFunc> = middlewares.iter().cloned().collect();
        if chain.len() >= MAX_HANDLERS {
            warn!(count = chain.len(), "too many global middleware, extra ones dropped");
            chain.truncate(MAX_HANDLERS - 1);
        }
        chain.push(Arc::new(RouterDispatch(router)));
        *self.inner.handlers.write() = Arc::from(chain);
    }

    /// Registers a function called on every log-sync tick and once on exit.
    pub fn add_sync_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.inner.sync_hooks.write().push(Arc::new(hook));
    }

    fn run_sync_hooks(&self) {
        let hooks = self.inner.sync_hooks.read().clone();
        for hook in hooks {
            hook();
        }
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    /// Runs one request through the root chain on a pooled context.
    ///
    /// A panic that escapes the chain is logged and answered with a 500 unless
    /// a body was already written.
    pub async fn serve_request<B>(&self, req: http::Request<B>, peer: Option<SocketAddr>) -> http::Response<Full<Bytes>>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let req = req.map(|b| b.map_err(Into::into).boxed_unsync());
        let mut ctx = self.inner.pool.lock().pop().unwrap_or_default();
        let services = Arc::clone(&self.inner.services.read());
        let handlers = Arc::clone(&self.inner.handlers.read());
        let cancel = self.inner.cancel.read().child_token();
        ctx.reset(req, peer, services, &handlers, cancel);

        let span = ctx.span().clone();
        let result = AssertUnwindSafe(ctx.next()).catch_unwind().instrument(span).await;
        let poisoned = match result {
            Ok(()) => false,
            Err(payload) => {
                let message = panic_message(payload.as_ref()).to_owned();
                ctx.fatal(Error::msg(format!("panic: {message}")));
                true
            }
        };

        let res = ctx.take_response();
        ctx.release();
        let pool_size = self.inner.config.read().context.pool_size;
        let mut pool = self.inner.pool.lock();
        if !poisoned && pool.len() < pool_size {
            pool.push(ctx);
        }
        res
    }

    fn request_handler(&self) -> RequestHandler {
        let app = self.clone();
        Arc::new(
            move |req: http::Request<Incoming>, peer: SocketAddr| -> BoxFuture<'static, http::Response<Full<Bytes>>> {
                let app = app.clone();
                Box::pin(async move { app.serve_request(req, Some(peer)).await })
            },
        )
    }

    // ── Serving ───────────────────────────────────────────────────────────────

    /// Starts listening on `addr`. Returns the bound address; on failure the
    /// error cancels the app and `None` is returned.
    pub async fn listen(&self, addr: &str) -> Option<SocketAddr> {
        self.listen_with(ServerListenConfig::new(addr)).await
    }

    /// Like [`App::listen`] with TLS from PEM files.
    pub async fn listen_tls(
        &self,
        addr: &str,
        certfile: impl Into<PathBuf>,
        keyfile: impl Into<PathBuf>,
    ) -> Option<SocketAddr> {
        self.listen_with(ServerListenConfig::tls(addr, certfile, keyfile)).await
    }

    pub async fn listen_with(&self, cfg: ServerListenConfig) -> Option<SocketAddr> {
        let mut server = self.inner.server.lock().await;
        if server.is_none() {
            let config = self.inner.config.read().server.clone();
            match Server::new(config) {
                Ok(s) => *server = Some(s),
                Err(e) => {
                    self.report(e);
                    return None;
                }
            }
        }
        let server = server.as_mut()?;
        match server.listen(&cfg).await {
            Ok(addr) => Some(addr),
            Err(e) => {
                self.report(e);
                None
            }
        }
    }

    /// Serves every listener (those added with `listen*` plus the config's
    /// `[[listen]]` entries) until the app is cancelled or the server gets a
    /// shutdown signal. Returns the first reported error.
    pub async fn run(&self) -> Result<(), Error> {
        let listen = self.inner.config.read().listen.clone();
        for cfg in listen {
            self.listen_with(cfg).await;
        }
        let cancel = self.cancellation();
        let period = match self.inner.config.read().server.log_sync {
            d if d.is_zero() => Duration::from_millis(80),
            d => d,
        };
        let sync = tokio::spawn(self.clone().log_sync(period, cancel.clone()));

        let server = self.inner.server.lock().await.take();
        match server {
            Some(server) if !cancel.is_cancelled() => {
                if let Err(e) = server.serve(self.request_handler(), cancel.clone()).await {
                    self.report(e);
                }
            }
            Some(_) => {}
            None => {
                info!("no listeners, waiting for cancellation");
                cancel.cancelled().await;
            }
        }

        cancel.cancel();
        let _ = sync.await;
        self.run_sync_hooks();
        match self.inner.error.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn log_sync(self, period: Duration, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = tick.tick() => self.run_sync_hooks(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use http::StatusCode;

    use super::*;

    async fn ok(ctx: &mut Context) {
        ctx.write_string("ok");
    }

    async fn boom(_ctx: &mut Context) {
        panic!("boom");
    }

    fn get(path: &str) -> http::Request<Full<Bytes>> {
        http::Request::get(path).body(Full::new(Bytes::new())).unwrap()
    }

    #[tokio::test]
    async fn routes_through_global_middleware() {
        let app = App::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        struct Count(Arc<AtomicUsize>);
        impl crate::handler::ErasedHandler for Count {
            fn call<'a>(&'a self, _ctx: &'a mut Context) -> BoxFuture<'a, ()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Box::pin(async {})
            }
        }
        app.add_middleware([Arc::new(Count(counter)) as HandlerFunc]);
        app.router().get("/ok", ok);

        let res = app.serve_request(get("/ok"), None).await;
        assert_eq!(res.status(), StatusCode::OK);
        let res = app.serve_request(get("/missing"), None).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panics_become_500_and_contexts_are_reused() {
        let app = App::new();
        app.router().get("/boom", boom).get("/ok", ok);

        let res = app.serve_request(get("/boom"), None).await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);

        app.serve_request(get("/ok"), None).await;
        assert_eq!(app.inner.pool.lock().len(), 1);
        let res = app.serve_request(get("/ok"), None).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(app.inner.pool.lock().len(), 1);
    }

    #[tokio::test]
    async fn first_error_is_kept_and_cancels() {
        let app = App::new();
        let token = app.cancellation();
        app.set(AppOption::Error(Error::msg("first")));
        app.set(AppOption::Error(Error::msg("second")));
        assert!(token.is_cancelled());
        let err = app.run().await.unwrap_err();
        assert_eq!(err.to_string(), "first");
    }

    #[tokio::test]
    async fn app_shutdown_leaves_parent_token_alone() {
        let parent = CancellationToken::new();
        let app = App::new().with([AppOption::Context(parent.clone())]);
        app.set(AppOption::Error(Error::msg("stop")));
        assert!(app.cancellation().is_cancelled());
        assert!(!parent.is_cancelled());

        let app = App::new().with([AppOption::Context(parent.clone())]);
        parent.cancel();
        assert!(app.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn router_swap_moves_validator_to_new_creator() {
        let app = App::new();
        app.validator().register::<String>(&[("", "nozero")]);
        let router = Router::new();
        app.set(AppOption::Router(router.clone()));
        let validator = app.validator();
        assert!(Arc::ptr_eq(validator.creator(), router.creator()));
        assert!(validator.validate(&String::new()).is_err());
    }

    #[tokio::test]
    async fn listen_failure_is_reported() {
        let app = App::new();
        assert!(app.listen("256.0.0.1:1").await.is_none());
        assert!(matches!(app.run().await, Err(Error::ServerListen { .. })));
    }

    #[tokio::test]
    async fn config_option_sets_limits() {
        let mut config = Config::default();
        config.context.body_limit = 4;
        let app = App::new().with([AppOption::Config(config)]);
        assert_eq!(app.inner.services.read().body_limit, 4);
    }
}
