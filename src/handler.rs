//! Handler trait and type erasure.
//!
//! # How handlers are stored
//!
//! A route's chain mixes middleware, user functions of different shapes and
//! built-in handlers, so every entry is erased to one trait object:
//!
//! ```text
//! async fn hello(ctx: &mut Context) -> &'static str { … }  ← user writes this
//!        ↓ router.get("/hello", hello)
//! hello.into_handler()                                     ← IntoHandler impl
//!        ↓
//! Arc::new(ContextHandler(hello))                          ← heap-allocated wrapper
//!        ↓  stored as HandlerFunc = Arc<dyn ErasedHandler>
//! handler.call(&mut ctx)  at request time                  ← one vtable dispatch
//!        ↓
//! Box::pin(async { hello(ctx).await.reply(ctx) })          ← BoxFuture
//! ```
//!
//! Accepted shapes, resolved at compile time by [`IntoHandler`]:
//!
//! | Shape | Behaviour |
//! |---|---|
//! | `async fn() -> R` | call, reply |
//! | `async fn(&mut Context) -> R` | call, reply |
//! | `async fn(&mut Context, Req) -> R` | bind `Req`, call, reply |
//! | [`HttpHandler`] | plain `http::Request` → `http::Response` |
//! | [`StaticFiles`] | serve a directory |
//! | [`HandlerFunc`] | used as is |
//!
//! `R` is any [`Reply`]: `()`, `String`, `&'static str`, `Value` or
//! `Result<T: Serialize, E: Into<Error>>`. Shapes only known at runtime go
//! through the [`HandlerExtender`](crate::HandlerExtender).

use std::future::Future;
use std::marker::PhantomData;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use http::header::CONTENT_TYPE;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::context::Context;
use crate::error::Error;
use crate::response::ContentType;

// ── Erased types ──────────────────────────────────────────────────────────────

/// A heap-allocated, type-erased `Send` future borrowing the context.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The canonical handler: something that runs against a [`Context`].
///
/// Implement this directly for middleware that carries configuration.
pub trait ErasedHandler: Send + Sync + 'static {
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()>;

    /// Name shown in route metadata and logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// A shared, type-erased handler.
pub type HandlerFunc = Arc<dyn ErasedHandler>;

// ── IntoHandler ───────────────────────────────────────────────────────────────

/// Conversion of a handler-shaped value into a [`HandlerFunc`].
///
/// `M` is a marker that keeps the impls for different function arities apart;
/// it is always inferred.
pub trait IntoHandler<M>: Send + Sync + 'static {
    fn into_handler(self) -> HandlerFunc;
}

#[doc(hidden)]
pub struct NoArgs;
#[doc(hidden)]
pub struct WithContext;
#[doc(hidden)]
pub struct WithData;

impl IntoHandler<()> for HandlerFunc {
    fn into_handler(self) -> HandlerFunc {
        self
    }
}

/// Lifts the lifetime of a `&mut Context` argument into the returned future.
///
/// Named `async fn`s taking `&mut Context` implement this for every `'a`;
/// closures returning `async` blocks generally do not.
pub trait ContextFn<'a>: Send + Sync + 'static {
    type Output;
    type Future: Future<Output = Self::Output> + Send + 'a;

    fn call(&self, ctx: &'a mut Context) -> Self::Future;
}

impl<'a, F, Fut> ContextFn<'a> for F
where
    F: Fn(&'a mut Context) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'a,
{
    type Output = Fut::Output;
    type Future = Fut;

    fn call(&self, ctx: &'a mut Context) -> Fut {
        self(ctx)
    }
}

/// [`ContextFn`] for handlers that also take a bound request value.
pub trait ContextDataFn<'a, Req>: Send + Sync + 'static {
    type Output;
    type Future: Future<Output = Self::Output> + Send + 'a;

    fn call(&self, ctx: &'a mut Context, req: Req) -> Self::Future;
}

impl<'a, F, Req, Fut> ContextDataFn<'a, Req> for F
where
    F: Fn(&'a mut Context, Req) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'a,
{
    type Output = Fut::Output;
    type Future = Fut;

    fn call(&self, ctx: &'a mut Context, req: Req) -> Fut {
        self(ctx, req)
    }
}

struct NoArgsHandler<F>(F);

impl<F, Fut> ErasedHandler for NoArgsHandler<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: Reply,
{
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        let fut = (self.0)();
        Box::pin(async move { fut.await.reply(ctx) })
    }

    fn name(&self) -> &'static str {
        std::any::type_name::<F>()
    }
}

impl<F, Fut> IntoHandler<(NoArgs, Fut)> for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: Reply,
{
    fn into_handler(self) -> HandlerFunc {
        Arc::new(NoArgsHandler(self))
    }
}

struct ContextHandler<F, R>(F, PhantomData<fn() -> R>);

impl<F, R> ErasedHandler for ContextHandler<F, R>
where
    F: for<'a> ContextFn<'a, Output = R>,
    R: Reply + 'static,
{
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let out = ContextFn::call(&self.0, &mut *ctx).await;
            out.reply(ctx);
        })
    }

    fn name(&self) -> &'static str {
        std::any::type_name::<F>()
    }
}

impl<F, R> IntoHandler<(WithContext, R)> for F
where
    F: for<'a> ContextFn<'a, Output = R>,
    R: Reply + 'static,
{
    fn into_handler(self) -> HandlerFunc {
        Arc::new(ContextHandler(self, PhantomData))
    }
}

struct DataHandler<F, Req, R>(F, PhantomData<fn(Req) -> R>);

impl<F, Req, R> ErasedHandler for DataHandler<F, Req, R>
where
    F: for<'a> ContextDataFn<'a, Req, Output = R>,
    Req: DeserializeOwned + Send + 'static,
    R: Reply + 'static,
{
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let req = match ctx.bind::<Req>().await {
                Ok(req) => req,
                Err(err) => return ctx.fatal(err),
            };
            let out = ContextDataFn::call(&self.0, &mut *ctx, req).await;
            out.reply(ctx);
        })
    }

    fn name(&self) -> &'static str {
        std::any::type_name::<F>()
    }
}

impl<F, Req, R> IntoHandler<(WithData, Req, R)> for F
where
    F: for<'a> ContextDataFn<'a, Req, Output = R>,
    Req: DeserializeOwned + Send + 'static,
    R: Reply + 'static,
{
    fn into_handler(self) -> HandlerFunc {
        Arc::new(DataHandler(self, PhantomData))
    }
}

// ── Reply ─────────────────────────────────────────────────────────────────────

/// What a handler's return value does to the response.
pub trait Reply: Send {
    fn reply(self, ctx: &mut Context);
}

impl Reply for () {
    fn reply(self, _ctx: &mut Context) {}
}

impl Reply for &'static str {
    fn reply(self, ctx: &mut Context) {
        ctx.write_string(self);
    }
}

impl Reply for String {
    fn reply(self, ctx: &mut Context) {
        ctx.write_string(&self);
    }
}

impl Reply for Value {
    fn reply(self, ctx: &mut Context) {
        reply_value(ctx, &self);
    }
}

/// `Ok` renders unless the handler already wrote a body or the value is
/// `null`; `Err` goes to [`Context::fatal`].
impl<T, E> Reply for Result<T, E>
where
    T: Serialize + Send,
    E: Into<Error> + Send,
{
    fn reply(self, ctx: &mut Context) {
        match self.map_err(Into::into).and_then(|v| serde_json::to_value(v).map_err(Error::from)) {
            Ok(v) => reply_value(ctx, &v),
            Err(err) => ctx.fatal(err),
        }
    }
}

fn reply_value(ctx: &mut Context, v: &Value) {
    if v.is_null() || ctx.response().size() > 0 {
        return;
    }
    if let Err(err) = ctx.render(v) {
        ctx.fatal(err);
    }
}

// ── HttpHandler ───────────────────────────────────────────────────────────────

/// Adapts a plain `http::Request<Bytes> -> http::Response<Bytes>` function.
///
/// The request body is read through the context (and its size cap) first;
/// the returned status, headers and body replace the context's response.
pub struct HttpHandler<F>(pub F);

impl<F, Fut> ErasedHandler for HttpHandler<F>
where
    F: Fn(http::Request<Bytes>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = http::Response<Bytes>> + Send + 'static,
{
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let body = match ctx.body().await {
                Ok(body) => body,
                Err(err) => return ctx.fatal(err),
            };
            let mut req = http::Request::new(body);
            *req.method_mut() = ctx.method().clone();
            *req.uri_mut() = ctx.uri().clone();
            *req.headers_mut() = ctx.headers().clone();

            let (parts, body) = (self.0)(req).await.into_parts();
            let w = ctx.response_mut();
            w.write_status(parts.status);
            w.headers_mut().extend(parts.headers);
            w.write(&body);
        })
    }

    fn name(&self) -> &'static str {
        std::any::type_name::<F>()
    }
}

impl<F, Fut> IntoHandler<()> for HttpHandler<F>
where
    F: Fn(http::Request<Bytes>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = http::Response<Bytes>> + Send + 'static,
{
    fn into_handler(self) -> HandlerFunc {
        Arc::new(self)
    }
}

// ── StaticFiles ───────────────────────────────────────────────────────────────

/// Serves files below a directory.
///
/// The file path is taken from the wildcard parameter (`*` by default), so
/// register it on a wildcard route:
///
/// ```rust,no_run
/// # use eudore::{Router, StaticFiles};
/// # let router = Router::new();
/// router.get("/static/*", StaticFiles::new("./public"));
/// ```
pub struct StaticFiles {
    root: PathBuf,
    param: String,
    index: Option<String>,
}

impl StaticFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), param: "*".to_owned(), index: Some("index.html".to_owned()) }
    }

    /// Reads the relative path from another route parameter.
    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.param = name.into();
        self
    }

    /// File served for directory requests; `None` answers them with 404.
    pub fn index(mut self, file: Option<&str>) -> Self {
        self.index = file.map(str::to_owned);
        self
    }

    /// Joins `rel` under the root, refusing anything that climbs out of it.
    fn resolve(&self, rel: &str) -> Option<PathBuf> {
        let mut path = self.root.clone();
        for c in Path::new(rel.trim_start_matches('/')).components() {
            match c {
                Component::Normal(p) => path.push(p),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(path)
    }
}

impl ErasedHandler for StaticFiles {
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let rel = ctx.get_param(&self.param).unwrap_or_default().to_owned();
            let Some(mut path) = self.resolve(&rel) else {
                return ctx.write_status(StatusCode::NOT_FOUND);
            };
            if tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_dir()) {
                match &self.index {
                    Some(index) => path.push(index),
                    None => return ctx.write_status(StatusCode::NOT_FOUND),
                }
            }
            match tokio::fs::read(&path).await {
                Ok(data) => {
                    let ct = path
                        .extension()
                        .and_then(|e| e.to_str())
                        .map_or(ContentType::OctetStream.as_str(), ContentType::from_extension);
                    ctx.set_header(CONTENT_TYPE, ct);
                    ctx.write(&data);
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    ctx.write_status(StatusCode::NOT_FOUND);
                }
                Err(err) => ctx.fatal(err.into()),
            }
        })
    }

    fn name(&self) -> &'static str {
        "eudore::StaticFiles"
    }
}

impl IntoHandler<()> for StaticFiles {
    fn into_handler(self) -> HandlerFunc {
        Arc::new(self)
    }
}

/// Turns any [`ErasedHandler`] into a [`HandlerFunc`].
pub fn handler_func(h: impl ErasedHandler) -> HandlerFunc {
    Arc::new(h)
}
