//! Request routing.
//!
//! ```text
//! Router (cheap clone: prefix + params + shared state)
//!   ├── middleware table   path prefix → handlers, applied at registration
//!   ├── HandlerExtender    runtime handler conversion
//!   └── RwLock<dyn RouterCore>
//!         RouterCoreHost ──▶ RouterCoreRadix
//! ```
//!
//! Registration is builder-style and happens before serving; the typed
//! helpers ([`Router::get`] etc.) panic on an invalid route the way a
//! malformed regex literal would. [`Router::add_handler`] returns the error
//! instead.
//!
//! At request time [`RouterDispatch`], the last handler of the application
//! chain, resolves the route and splices its handlers into the context chain
//! in place of itself.

mod host;
mod path;
mod radix;

use std::sync::Arc;

use http::Method as HttpMethod;
use http::header::{ALLOW, HOST};
use parking_lot::RwLock;
use serde::Serialize;

pub use host::RouterCoreHost;
pub use radix::RouterCoreRadix;

use crate::context::{Context, MAX_HANDLERS};
use crate::error::Error;
use crate::extender::{AnyHandler, HandlerExtender};
use crate::funcs::{FuncCreator, FuncCreatorExpr};
use crate::handler::{BoxFuture, ErasedHandler, HandlerFunc, IntoHandler};
use crate::method::Method;
use crate::params::{PARAM_ALLOW, PARAM_ROUTE, Params};

/// A route table.
///
/// `path` arrives split from its params; `params` already carries `route`.
pub trait RouterCore: Send + Sync + 'static {
    fn handle(&mut self, method: Method, path: &str, params: Params, handlers: Vec<HandlerFunc>) -> Result<(), Error>;

    /// Resolves a request. Writes the route's params and captures into
    /// `params` and returns its handlers, or the 404/405 handlers.
    fn find(&self, method: &HttpMethod, host: &str, path: &str, params: &mut Params) -> Arc<[HandlerFunc]>;

    /// Registered `(method, path)` pairs.
    fn routes(&self) -> Vec<(Method, String)>;
}

/// Registered routes and middleware, for diagnostics.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RouterMetadata {
    pub routes: Vec<(String, String)>,
    pub middlewares: Vec<(String, Vec<&'static str>)>,
    pub extender: Vec<&'static str>,
}

struct RouterShared {
    core: RwLock<Box<dyn RouterCore>>,
    middlewares: RwLock<Vec<(String, Vec<HandlerFunc>)>>,
    not_found: RwLock<Vec<HandlerFunc>>,
    method_not_allowed: RwLock<Vec<HandlerFunc>>,
    extender: Arc<HandlerExtender>,
    creator: Arc<dyn FuncCreator>,
}

/// The application router. Clones share one route table.
#[derive(Clone)]
pub struct Router {
    shared: Arc<RouterShared>,
    prefix: String,
    params: Params,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// A host-aware radix router with the expression function creator.
    pub fn new() -> Self {
        let creator: Arc<dyn FuncCreator> = Arc::new(FuncCreatorExpr::default());
        let core = RouterCoreHost::new(Box::new(RouterCoreRadix::new(Arc::clone(&creator))));
        Self::with_core(Box::new(core), creator, Arc::new(HandlerExtender::new()))
    }

    pub fn with_core(core: Box<dyn RouterCore>, creator: Arc<dyn FuncCreator>, extender: Arc<HandlerExtender>) -> Self {
        let router = Self {
            shared: Arc::new(RouterShared {
                core: RwLock::new(core),
                middlewares: RwLock::new(Vec::new()),
                not_found: RwLock::new(vec![Arc::new(NotFound) as HandlerFunc]),
                method_not_allowed: RwLock::new(vec![Arc::new(MethodNotAllowed)]),
                extender,
                creator,
            }),
            prefix: String::new(),
            params: Params::new(),
        };
        if let Err(err) = router.sync_sentinels() {
            tracing::error!(error = %err, "register default 404/405 handlers");
        }
        router
    }

    pub fn extender(&self) -> &Arc<HandlerExtender> {
        &self.shared.extender
    }

    pub fn creator(&self) -> &Arc<dyn FuncCreator> {
        &self.shared.creator
    }

    /// A router that prefixes every path with `route`'s path and adds its
    /// params to every route.
    ///
    /// ```rust
    /// # use eudore::Router;
    /// let api = Router::new().group("/api/v1 version=1");
    /// api.get("/users", || async { "[]" });
    /// ```
    pub fn group(&self, route: &str) -> Router {
        let (path, params) = path::split_route(route);
        let mut merged = self.params.clone();
        merged.merge(&params);
        Router {
            shared: Arc::clone(&self.shared),
            prefix: format!("{}{}", self.prefix, path),
            params: merged,
        }
    }

    fn chain(&self, path: &str, handlers: Vec<HandlerFunc>) -> Result<Vec<HandlerFunc>, Error> {
        let mut chain: Vec<HandlerFunc> = self
            .shared
            .middlewares
            .read()
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .flat_map(|(_, hs)| hs.iter().cloned())
            .collect();
        chain.extend(handlers);
        if chain.len() > MAX_HANDLERS {
            return Err(Error::RouteSyntax {
                path: path.to_owned(),
                message: format!("{} handlers exceed the limit of {MAX_HANDLERS}", chain.len()),
            });
        }
        Ok(chain)
    }

    fn sync_sentinels(&self) -> Result<(), Error> {
        let global = |base: &[HandlerFunc]| {
            let mut chain: Vec<HandlerFunc> = self
                .shared
                .middlewares
                .read()
                .iter()
                .filter(|(prefix, _)| prefix.is_empty() || prefix == "/")
                .flat_map(|(_, hs)| hs.iter().cloned())
                .collect();
            chain.extend(base.iter().cloned());
            chain
        };
        let nf = global(self.shared.not_found.read().as_slice());
        let mna = global(self.shared.method_not_allowed.read().as_slice());
        let mut core = self.shared.core.write();
        core.handle(Method::NotFound, "", Params::new(), nf)?;
        core.handle(Method::MethodNotAllowed, "", Params::new(), mna)
    }

    /// Registers `handlers` under `method` (`GET`, `ANY`, `NotFound`, …; a
    /// comma-separated list registers each) and `route`.
    pub fn add_handler(&self, method: &str, route: &str, handlers: Vec<HandlerFunc>) -> Result<(), Error> {
        let (path, route_params) = path::split_route(route);
        let full = format!("{}{}", self.prefix, path);

        for name in method.split(',').map(str::trim) {
            let method: Method = name.parse()?;
            let sentinel = match method {
                Method::NotFound => Some(&self.shared.not_found),
                Method::MethodNotAllowed => Some(&self.shared.method_not_allowed),
                _ => None,
            };
            if let Some(slot) = sentinel {
                *slot.write() = handlers.clone();
                self.sync_sentinels()?;
                continue;
            }

            let mut params = Params::with_capacity(2 + self.params.len() + route_params.len());
            params.add(PARAM_ROUTE, full.as_str());
            params.merge(&self.params);
            params.merge(&route_params);
            let chain = self.chain(&full, handlers.clone())?;
            tracing::debug!(%method, route = %full, handlers = chain.len(), "register route");
            self.shared.core.write().handle(method, &full, params, chain)?;
        }
        Ok(())
    }

    /// Like [`Router::add_handler`], converting each value through the
    /// router's [`HandlerExtender`].
    pub fn add_handler_dyn(&self, method: &str, route: &str, handlers: Vec<AnyHandler>) -> Result<(), Error> {
        let handlers = handlers
            .into_iter()
            .map(|h| self.shared.extender.create(h))
            .collect::<Result<Vec<_>, _>>()?;
        self.add_handler(method, route, handlers)
    }

    /// Adds middleware for every route registered afterwards whose path
    /// starts with `prefix` (relative to the group). Shorter prefixes run
    /// first.
    pub fn add_middleware(&self, prefix: &str, handlers: Vec<HandlerFunc>) {
        let prefix = format!("{}{}", self.prefix, prefix);
        {
            let mut mws = self.shared.middlewares.write();
            match mws.iter_mut().find(|(p, _)| *p == prefix) {
                Some((_, hs)) => hs.extend(handlers),
                None => mws.push((prefix.clone(), handlers)),
            }
            mws.sort_by_key(|(p, _)| p.len());
        }
        if prefix.is_empty() || prefix == "/" {
            if let Err(err) = self.sync_sentinels() {
                tracing::error!(error = %err, "register 404/405 handlers with global middleware");
            }
        }
    }

    fn must(&self, method: &str, route: &str, h: HandlerFunc) -> &Self {
        if let Err(err) = self.add_handler(method, route, vec![h]) {
            panic!("invalid route `{method} {route}`: {err}");
        }
        self
    }

    pub fn get<M>(&self, route: &str, h: impl IntoHandler<M>) -> &Self {
        self.must("GET", route, h.into_handler())
    }

    pub fn post<M>(&self, route: &str, h: impl IntoHandler<M>) -> &Self {
        self.must("POST", route, h.into_handler())
    }

    pub fn put<M>(&self, route: &str, h: impl IntoHandler<M>) -> &Self {
        self.must("PUT", route, h.into_handler())
    }

    pub fn delete<M>(&self, route: &str, h: impl IntoHandler<M>) -> &Self {
        self.must("DELETE", route, h.into_handler())
    }

    pub fn head<M>(&self, route: &str, h: impl IntoHandler<M>) -> &Self {
        self.must("HEAD", route, h.into_handler())
    }

    pub fn patch<M>(&self, route: &str, h: impl IntoHandler<M>) -> &Self {
        self.must("PATCH", route, h.into_handler())
    }

    pub fn options<M>(&self, route: &str, h: impl IntoHandler<M>) -> &Self {
        self.must("OPTIONS", route, h.into_handler())
    }

    /// Registers for every method in [`ANY_METHODS`](crate::method::ANY_METHODS).
    pub fn any<M>(&self, route: &str, h: impl IntoHandler<M>) -> &Self {
        self.must("ANY", route, h.into_handler())
    }

    pub fn not_found<M>(&self, h: impl IntoHandler<M>) -> &Self {
        self.must("NotFound", "", h.into_handler())
    }

    pub fn method_not_allowed<M>(&self, h: impl IntoHandler<M>) -> &Self {
        self.must("MethodNotAllowed", "", h.into_handler())
    }

    /// Resolves a request against the route table.
    pub fn match_route(&self, method: &HttpMethod, host: &str, path: &str, params: &mut Params) -> Arc<[HandlerFunc]> {
        self.shared.core.read().find(method, host, path, params)
    }

    pub fn metadata(&self) -> RouterMetadata {
        RouterMetadata {
            routes: self
                .shared
                .core
                .read()
                .routes()
                .into_iter()
                .map(|(m, p)| (m.to_string(), p))
                .collect(),
            middlewares: self
                .shared
                .middlewares
                .read()
                .iter()
                .map(|(p, hs)| (p.clone(), hs.iter().map(|h| h.name()).collect()))
                .collect(),
            extender: self.shared.extender.metadata(),
        }
    }
}

// ── Request-time handlers ─────────────────────────────────────────────────────

/// Resolves the route and replaces itself with the route's handlers.
pub struct RouterDispatch(pub Router);

impl ErasedHandler for RouterDispatch {
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        let handlers = {
            let (parts, params) = ctx.route_parts();
            let host = parts
                .headers
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .or_else(|| parts.uri.authority().map(|a| a.as_str()))
                .unwrap_or_default();
            self.0.match_route(&parts.method, host, parts.uri.path(), params)
        };
        let index = ctx.index();
        ctx.set_handlers(index, &handlers);
        Box::pin(std::future::ready(()))
    }

    fn name(&self) -> &'static str {
        "eudore::RouterDispatch"
    }
}

/// Default 404 handler.
pub struct NotFound;

impl ErasedHandler for NotFound {
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        ctx.write_status(http::StatusCode::NOT_FOUND);
        Box::pin(std::future::ready(()))
    }
}

/// Default 405 handler; writes `Allow` from the `allow` param.
pub struct MethodNotAllowed;

impl ErasedHandler for MethodNotAllowed {
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        if let Some(allow) = ctx.get_param(PARAM_ALLOW).map(str::to_owned) {
            ctx.set_header(ALLOW, &allow);
        }
        ctx.write_status(http::StatusCode::METHOD_NOT_ALLOWED);
        Box::pin(std::future::ready(()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Count(Arc<AtomicUsize>);

    impl ErasedHandler for Count {
        fn call<'a>(&'a self, _ctx: &'a mut Context) -> BoxFuture<'a, ()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Box::pin(std::future::ready(()))
        }
    }

    fn find(r: &Router, method: HttpMethod, path: &str) -> (usize, Params) {
        let mut p = Params::new();
        let hs = r.match_route(&method, "", path, &mut p);
        (hs.len(), p)
    }

    struct NoSentinels;

    impl RouterCore for NoSentinels {
        fn handle(&mut self, method: Method, _path: &str, _params: Params, _hs: Vec<HandlerFunc>) -> Result<(), Error> {
            match method {
                Method::NotFound | Method::MethodNotAllowed => Err(Error::msg("sentinels unsupported")),
                _ => Ok(()),
            }
        }

        fn find(&self, _method: &HttpMethod, _host: &str, _path: &str, _params: &mut Params) -> Arc<[HandlerFunc]> {
            Arc::from(Vec::new())
        }

        fn routes(&self) -> Vec<(Method, String)> {
            Vec::new()
        }
    }

    #[test]
    fn sentinel_registration_errors_propagate() {
        let creator: Arc<dyn FuncCreator> = Arc::new(FuncCreatorExpr::default());
        let r = Router::with_core(Box::new(NoSentinels), creator, Arc::new(HandlerExtender::new()));
        let err = r.add_handler("NotFound", "", vec![Arc::new(NotFound) as HandlerFunc]).unwrap_err();
        assert_eq!(err.to_string(), "sentinels unsupported");
        r.add_handler("GET", "/ok", vec![Arc::new(NotFound) as HandlerFunc]).unwrap();
    }

    #[test]
    fn groups_prefix_and_params() {
        let r = Router::new();
        let api = r.group("/api version=1");
        api.get("/users/:id", || async { "user" });
        let (n, p) = find(&r, HttpMethod::GET, "/api/users/7");
        assert_eq!(n, 1);
        assert_eq!(p.get("route"), Some("/api/users/:id"));
        assert_eq!(p.get("version"), Some("1"));
        assert_eq!(p.get("id"), Some("7"));
    }

    #[test]
    fn middleware_applies_by_prefix_to_later_routes() {
        let hits = Arc::new(AtomicUsize::new(0));
        let r = Router::new();
        r.get("/before", || async {});
        r.add_middleware("/api", vec![Arc::new(Count(Arc::clone(&hits)))]);
        r.add_middleware("/", vec![Arc::new(Count(Arc::clone(&hits)))]);
        r.get("/api/x", || async {});
        r.get("/other", || async {});

        assert_eq!(find(&r, HttpMethod::GET, "/before").0, 1);
        assert_eq!(find(&r, HttpMethod::GET, "/api/x").0, 3);
        assert_eq!(find(&r, HttpMethod::GET, "/other").0, 2);
        // Global middleware also wraps the 404 handler.
        assert_eq!(find(&r, HttpMethod::GET, "/nothing").0, 2);

        let meta = r.metadata();
        assert_eq!(meta.middlewares[0].0, "/");
    }

    #[test]
    fn host_routes() {
        let r = Router::new();
        r.get("/ h=1 host=*.example.com", || async { "sub" });
        r.get("/", || async { "plain" });
        let mut p = Params::new();
        r.match_route(&HttpMethod::GET, "api.example.com", "/", &mut p);
        assert_eq!(p.get("h"), Some("1"));
        let mut p = Params::new();
        r.match_route(&HttpMethod::GET, "example.com", "/", &mut p);
        assert!(p.get("h").is_none());
    }

    #[test]
    fn invalid_method_and_route() {
        let r = Router::new();
        assert!(matches!(r.add_handler("FETCH", "/", vec![]), Err(Error::RouteMethodInvalid(_))));
        assert!(matches!(r.add_handler("GET", "/*a/b", vec![]), Err(Error::RouteSyntax { .. })));
    }

    #[test]
    #[should_panic(expected = "invalid route")]
    fn typed_helpers_panic() {
        Router::new().get("/:id|nosuch", || async {});
    }
}
