//! The per-request context and handler-chain executor.
//!
//! # Chain protocol
//!
//! A context owns the handler chain of the current request and an index into
//! it. [`Context::next`] advances and runs handlers until the chain ends or is
//! aborted:
//!
//! ```text
//! index: MAX ──next()──▶ 0 ─▶ 1 ─▶ … ─▶ len      (done)
//!                           └─ end() ─▶ ABORT    (no further handler runs)
//! ```
//!
//! A middleware that wants to run code *after* the rest of the chain calls
//! `ctx.next().await` itself; the outer loop then finds the index past the
//! end and returns. [`Context::set_handlers`] splices a new tail into the
//! chain at the current position; the router dispatch handler uses it to
//! replace itself with the matched route's handlers.
//!
//! # Pooling
//!
//! Contexts are pooled by the [`App`](crate::App). Every per-request field is
//! reset on acquire and request/response objects are dropped on release;
//! vectors keep their capacity.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::panic::Location;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST, IntoHeaderName, LOCATION, SET_COOKIE};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, LengthLimitError, Limited};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{Dispatch, Level, Span};

use crate::bind::{Bind, Binder};
use crate::error::{BoxError, Error};
use crate::handler::{BoxFuture, HandlerFunc};
use crate::multipart::{self, FileHeader, Form};
use crate::params::{PARAM_ROUTE, Params};
use crate::render::{Render, Renderer};
use crate::request::{self, Cookie, SetCookie, Values};
use crate::response::{ContentType, ResponseWriter};
use crate::validate::Validator;
use crate::value;

/// Longest handler chain a route may build.
pub const MAX_HANDLERS: usize = 127;

/// Index value of an aborted chain.
const INDEX_ABORT: usize = 0xff;

/// Default cap for a buffered request body (10 MiB).
pub const DEFAULT_BODY_LIMIT: usize = 10 << 20;

/// Default cap for a buffered multipart form (32 MiB).
pub const DEFAULT_MULTIPART_LIMIT: usize = 32 << 20;

pub(crate) type RequestBody = UnsyncBoxBody<Bytes, BoxError>;

/// Shared components a context reads from; replaced wholesale by the app.
#[derive(Clone)]
pub(crate) struct Services {
    pub binder: Arc<dyn Bind>,
    pub renderer: Arc<dyn Render>,
    pub validator: Arc<Validator>,
    pub logger: Option<Dispatch>,
    pub body_limit: usize,
    pub multipart_limit: usize,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            binder: Arc::new(Binder::default()),
            renderer: Arc::new(Renderer::default()),
            validator: Arc::new(Validator::default()),
            logger: None,
            body_limit: DEFAULT_BODY_LIMIT,
            multipart_limit: DEFAULT_MULTIPART_LIMIT,
        }
    }
}

enum BodyState {
    Pending(RequestBody),
    Ready(Bytes),
}

/// The per-request context handed to every handler.
pub struct Context {
    parts: http::request::Parts,
    // The boxed body is `Send` but not `Sync`; the mutex makes the context
    // `Sync` without ever being locked (access goes through `get_mut`).
    body: Mutex<BodyState>,
    peer: Option<SocketAddr>,
    response: ResponseWriter,
    params: Params,
    handlers: Vec<HandlerFunc>,
    index: usize,
    values: http::Extensions,
    query: Option<Values>,
    cookies: Option<Vec<Cookie>>,
    form: Option<Form>,
    request_id: String,
    span: Span,
    services: Arc<Services>,
    cancel: CancellationToken,
    body_limit: usize,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("method", &self.parts.method)
            .field("uri", &self.parts.uri)
            .field("params", &self.params)
            .field("index", &self.index)
            .field("handlers", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

fn empty_parts() -> http::request::Parts {
    http::Request::new(()).into_parts().0
}

fn empty_body() -> RequestBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
}

impl Context {
    /// An idle context for `GET /` with default components.
    pub fn new() -> Self {
        Self {
            parts: empty_parts(),
            body: Mutex::new(BodyState::Ready(Bytes::new())),
            peer: None,
            response: ResponseWriter::new(),
            params: Params::with_capacity(4),
            handlers: Vec::with_capacity(8),
            index: usize::MAX,
            values: http::Extensions::new(),
            query: None,
            cookies: None,
            form: None,
            request_id: String::new(),
            span: Span::none(),
            services: Arc::new(Services::default()),
            cancel: CancellationToken::new(),
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    /// A context bound to `req`, with default components and an empty chain.
    pub fn from_request<B>(req: http::Request<B>) -> Self
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let mut ctx = Self::new();
        let services = Arc::clone(&ctx.services);
        ctx.reset(req.map(|b| b.map_err(Into::into).boxed_unsync()), None, services, &[], CancellationToken::new());
        ctx
    }

    /// Binds the context to a new request. Every per-request field is cleared.
    pub(crate) fn reset(
        &mut self,
        req: http::Request<RequestBody>,
        peer: Option<SocketAddr>,
        services: Arc<Services>,
        handlers: &[HandlerFunc],
        cancel: CancellationToken,
    ) {
        let (parts, body) = req.into_parts();
        self.request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        self.parts = parts;
        *self.body.get_mut() = BodyState::Pending(body);
        self.peer = peer;
        self.response.reset();
        self.params.clear();
        self.params.add(PARAM_ROUTE, "");
        self.handlers.clear();
        self.handlers.extend(handlers.iter().cloned());
        self.index = usize::MAX;
        self.values.clear();
        self.query = None;
        self.cookies = None;
        self.form = None;
        self.body_limit = services.body_limit;
        self.span = self.new_span(&services);
        self.services = services;
        self.cancel = cancel;
    }

    /// Drops request-scoped objects before the context goes back to the pool.
    pub(crate) fn release(&mut self) {
        self.parts = empty_parts();
        *self.body.get_mut() = BodyState::Ready(Bytes::new());
        self.handlers.clear();
        self.values.clear();
        self.query = None;
        self.cookies = None;
        self.form = None;
        self.span = Span::none();
    }

    fn new_span(&self, services: &Services) -> Span {
        let make = || {
            let span = tracing::info_span!(
                "request",
                method = %self.parts.method,
                path = %self.parts.uri.path(),
                x_request_id = tracing::field::Empty,
            );
            if !self.request_id.is_empty() {
                span.record("x_request_id", self.request_id.as_str());
            }
            span
        };
        match &services.logger {
            Some(d) => tracing::dispatcher::with_default(d, make),
            None => make(),
        }
    }

    // ── Chain ─────────────────────────────────────────────────────────────────

    /// Runs the remaining handlers in order until the chain ends or
    /// [`Context::end`] is called.
    pub fn next(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.index = self.index.wrapping_add(1);
            while self.index < self.handlers.len() {
                let handler = Arc::clone(&self.handlers[self.index]);
                handler.call(self).await;
                self.index = self.index.wrapping_add(1);
            }
        })
    }

    /// Aborts the chain: no handler after the current one runs.
    pub fn end(&mut self) {
        self.index = INDEX_ABORT;
    }

    pub fn is_ended(&self) -> bool {
        self.index != usize::MAX && self.index >= INDEX_ABORT
    }

    /// Index of the running handler.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn handlers(&self) -> &[HandlerFunc] {
        &self.handlers
    }

    /// Replaces the chain from `index` onward with `handlers`; the next
    /// advance runs `handlers[0]`. Chains are capped at [`MAX_HANDLERS`].
    pub fn set_handlers(&mut self, index: usize, handlers: &[HandlerFunc]) {
        let keep = index.min(self.handlers.len());
        self.handlers.truncate(keep);
        self.handlers.extend(handlers.iter().cloned());
        if self.handlers.len() > MAX_HANDLERS {
            self.warn(format_args!("handler chain truncated to {MAX_HANDLERS}"));
            self.handlers.truncate(MAX_HANDLERS);
        }
        self.index = keep.wrapping_sub(1);
    }

    // ── Request ───────────────────────────────────────────────────────────────

    pub fn method(&self) -> &Method {
        &self.parts.method
    }

    pub fn uri(&self) -> &Uri {
        &self.parts.uri
    }

    pub fn path(&self) -> &str {
        self.parts.uri.path()
    }

    pub fn raw_query(&self) -> &str {
        self.parts.uri.query().unwrap_or_default()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.parts.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// `Host` header, falling back to the URI authority (HTTP/2).
    pub fn host(&self) -> &str {
        self.get_header(HOST.as_str())
            .or_else(|| self.parts.uri.authority().map(|a| a.as_str()))
            .unwrap_or_default()
    }

    pub fn content_type(&self) -> &str {
        self.get_header(CONTENT_TYPE.as_str()).unwrap_or_default()
    }

    /// The socket peer.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Client address honouring `X-Forwarded-For`.
    pub fn remote_addr(&self) -> Option<IpAddr> {
        request::real_ip(&self.parts.headers, self.peer)
    }

    /// Overrides the body cap for this request.
    pub fn set_body_limit(&mut self, limit: usize) {
        self.body_limit = limit;
    }

    /// The request body, read in full on first access.
    pub async fn body(&mut self) -> Result<Bytes, Error> {
        let limit = self.body_limit;
        self.read_body(limit).await
    }

    async fn read_body(&mut self, limit: usize) -> Result<Bytes, Error> {
        let state = std::mem::replace(self.body.get_mut(), BodyState::Ready(Bytes::new()));
        let bytes = match state {
            BodyState::Ready(bytes) => bytes,
            BodyState::Pending(body) => {
                if hyper::body::Body::size_hint(&body).lower() > limit as u64 {
                    return Err(Error::BindBodyTooLarge { limit });
                }
                // Boxed with an explicit `Send` bound so callers' futures stay `Send`.
                let collect: std::pin::Pin<
                    Box<dyn Future<Output = Result<http_body_util::Collected<Bytes>, BoxError>> + Send>,
                > = Box::pin(Limited::new(body, limit).collect());
                match collect.await {
                    Ok(collected) => collected.to_bytes(),
                    Err(e) if e.is::<LengthLimitError>() => return Err(Error::BindBodyTooLarge { limit }),
                    Err(e) => {
                        let e: BoxError = e;
                        return Err(Error::from(e));
                    }
                }
            }
        };
        *self.body.get_mut() = BodyState::Ready(bytes.clone());
        Ok(bytes)
    }

    /// Parsed URL query.
    pub fn query(&mut self) -> &Values {
        let raw = self.parts.uri.query().unwrap_or_default();
        self.query.get_or_insert_with(|| Values::parse(raw))
    }

    pub fn get_query(&mut self, key: &str) -> Option<&str> {
        self.query().get(key)
    }

    pub fn cookies(&mut self) -> &[Cookie] {
        let headers = &self.parts.headers;
        self.cookies.get_or_insert_with(|| request::parse_cookies(headers))
    }

    pub fn get_cookie(&mut self, name: &str) -> Option<&str> {
        self.cookies().iter().find(|c| c.name == name).map(|c| c.value.as_str())
    }

    pub fn set_cookie(&mut self, cookie: &SetCookie) {
        match HeaderValue::try_from(cookie.to_string()) {
            Ok(v) => {
                self.response.headers_mut().append(SET_COOKIE, v);
            }
            Err(err) => self.warn(format_args!("invalid cookie: {err}")),
        }
    }

    /// The url-encoded or multipart form body, parsed on first access.
    pub async fn form(&mut self) -> Result<&Form, Error> {
        if self.form.is_none() {
            let content_type = self.content_type().to_owned();
            let form = if content_type.to_ascii_lowercase().starts_with("multipart/form-data") {
                let boundary = multipart::parse_boundary(&content_type)?;
                let limit = self.services.multipart_limit;
                let body = self.read_body(limit.max(self.body_limit)).await?;
                multipart::parse(&body, &boundary, limit)?
            } else {
                let body = self.body().await?;
                let mut form = Form::default();
                form.values.extend_encoded(&body);
                form
            };
            self.form = Some(form);
        }
        Ok(self.form.get_or_insert_with(Form::default))
    }

    pub async fn form_value(&mut self, key: &str) -> Result<Option<&str>, Error> {
        Ok(self.form().await?.values.get(key))
    }

    pub async fn form_file(&mut self, name: &str) -> Result<Option<&FileHeader>, Error> {
        Ok(self.form().await?.file(name))
    }

    // ── Params and values ─────────────────────────────────────────────────────

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut Params {
        &mut self.params
    }

    /// Request head and params borrowed together, for route resolution.
    pub(crate) fn route_parts(&mut self) -> (&http::request::Parts, &mut Params) {
        (&self.parts, &mut self.params)
    }

    pub fn get_param(&self, key: &str) -> Option<&str> {
        self.params.get(key)
    }

    pub fn set_param(&mut self, key: &str, val: impl Into<String>) {
        self.params.set(key, val);
    }

    /// A typed per-request value set by an earlier handler.
    pub fn get_value<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.values.get::<T>()
    }

    pub fn set_value<T: Clone + Send + Sync + 'static>(&mut self, val: T) -> Option<T> {
        self.values.insert(val)
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn set_request_id(&mut self, id: impl Into<String>) {
        self.request_id = id.into();
        self.span.record("x_request_id", self.request_id.as_str());
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Cancelled when the application shuts down.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    // ── Bind, validate, render ────────────────────────────────────────────────

    /// Decodes the request with the configured binder, then validates the
    /// result if `T` has registered rules.
    pub async fn bind<T: DeserializeOwned + 'static>(&mut self) -> Result<T, Error> {
        let binder = Arc::clone(&self.services.binder);
        let doc = binder.bind(self).await?;
        let data: T = value::from_value(&doc)?;
        self.services.validator.check(&data, &doc)?;
        Ok(data)
    }

    /// Runs the registered rules for `T` against `data`.
    pub fn validate<T: Serialize + 'static>(&self, data: &T) -> Result<(), Error> {
        self.services.validator.validate(data)
    }

    /// Encodes `data` with the renderer chosen by `Accept`.
    pub fn render<T: Serialize + ?Sized>(&mut self, data: &T) -> Result<(), Error> {
        let data = serde_json::to_value(data)?;
        let renderer = Arc::clone(&self.services.renderer);
        renderer.render(self, &data)
    }

    // ── Response ──────────────────────────────────────────────────────────────

    pub fn response(&self) -> &ResponseWriter {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut ResponseWriter {
        &mut self.response
    }

    pub fn write_status(&mut self, status: StatusCode) {
        self.response.write_status(status);
    }

    /// Sets a response header; invalid values are logged and skipped.
    pub fn set_header<K: IntoHeaderName>(&mut self, key: K, value: &str) {
        match HeaderValue::from_str(value) {
            Ok(v) => {
                self.response.headers_mut().insert(key, v);
            }
            Err(err) => self.warn(format_args!("invalid header value `{value}`: {err}")),
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        self.response.write(data);
    }

    /// Writes text, defaulting the content type to `text/plain`.
    pub fn write_string(&mut self, s: &str) {
        self.response.set_header_default(CONTENT_TYPE, ContentType::Text.into());
        self.response.write(s.as_bytes());
    }

    pub fn redirect(&mut self, status: StatusCode, location: &str) {
        self.set_header(LOCATION, location);
        self.response.write_status(status);
    }

    pub(crate) fn take_response(&mut self) -> http::Response<http_body_util::Full<Bytes>> {
        self.response.take()
    }

    // ── Logging ───────────────────────────────────────────────────────────────

    #[track_caller]
    pub fn debug(&self, message: impl fmt::Display) {
        self.log(Level::DEBUG, &message, Location::caller());
    }

    #[track_caller]
    pub fn info(&self, message: impl fmt::Display) {
        self.log(Level::INFO, &message, Location::caller());
    }

    #[track_caller]
    pub fn warn(&self, message: impl fmt::Display) {
        self.log(Level::WARN, &message, Location::caller());
    }

    #[track_caller]
    pub fn error(&self, message: impl fmt::Display) {
        self.log(Level::ERROR, &message, Location::caller());
    }

    /// Logs `err`, writes it as a JSON error response unless a body has
    /// already been written, and aborts the chain.
    ///
    /// ```json
    /// {"status": 500, "x-request-id": "…", "message": "…"}
    /// ```
    #[track_caller]
    pub fn fatal(&mut self, err: Error) {
        self.log(Level::ERROR, &err, Location::caller());
        if self.response.size() == 0 {
            let status = err.status();
            let mut body = json!({
                "status": status.as_u16(),
                "x-request-id": self.request_id,
                "message": err.to_string(),
            });
            if let Some(code) = err.code() {
                body["code"] = code.into();
            }
            self.response.write_status(status);
            self.response.headers_mut().insert(CONTENT_TYPE, ContentType::Json.into());
            self.response.write(body.to_string().as_bytes());
        }
        self.end();
    }

    fn log(&self, level: Level, message: &dyn fmt::Display, at: &Location<'_>) {
        let emit = || {
            let _enter = self.span.enter();
            let id = self.request_id.as_str();
            let (file, line) = (at.file(), at.line());
            match level {
                Level::ERROR => tracing::error!(x_request_id = id, file, line, "{message}"),
                Level::WARN  => tracing::warn!(x_request_id = id, file, line, "{message}"),
                Level::INFO  => tracing::info!(x_request_id = id, file, line, "{message}"),
                Level::DEBUG => tracing::debug!(x_request_id = id, file, line, "{message}"),
                _            => tracing::trace!(x_request_id = id, file, line, "{message}"),
            }
        };
        match &self.services.logger {
            Some(d) => tracing::dispatcher::with_default(d, emit),
            None => emit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use http_body_util::Full;

    use super::*;
    use crate::handler::ErasedHandler;

    struct Record(usize, Arc<Mutex<Vec<usize>>>, bool);

    impl ErasedHandler for Record {
        fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                self.1.lock().push(self.0);
                if self.2 {
                    ctx.end();
                }
            })
        }
    }

    fn chain(log: &Arc<Mutex<Vec<usize>>>, stop_at: usize, n: usize) -> Vec<HandlerFunc> {
        (0..n)
            .map(|i| Arc::new(Record(i, Arc::clone(log), i == stop_at)) as HandlerFunc)
            .collect()
    }

    #[tokio::test]
    async fn next_runs_in_order_and_end_stops() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = Context::new();
        ctx.set_handlers(0, &chain(&log, 1, 4));
        ctx.next().await;
        assert_eq!(*log.lock(), [0, 1]);
        assert!(ctx.is_ended());
    }

    struct Around(Arc<AtomicUsize>);

    impl ErasedHandler for Around {
        fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                ctx.next().await;
                // Runs after every later handler.
                self.0.store(ctx.response().size(), Ordering::SeqCst);
            })
        }
    }

    struct Splice(Vec<HandlerFunc>);

    impl ErasedHandler for Splice {
        fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                let i = ctx.index();
                ctx.set_handlers(i, &self.0);
            })
        }
    }

    struct Write(&'static str);

    impl ErasedHandler for Write {
        fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
            Box::pin(async move { ctx.write_string(self.0) })
        }
    }

    #[tokio::test]
    async fn splice_replaces_tail_and_middleware_wraps() {
        let seen = Arc::new(AtomicUsize::new(0));
        let tail: Vec<HandlerFunc> = vec![Arc::new(Write("ab")), Arc::new(Write("c"))];
        let mut ctx = Context::new();
        ctx.set_handlers(0, &[Arc::new(Around(Arc::clone(&seen))), Arc::new(Splice(tail))]);
        ctx.next().await;
        assert_eq!(ctx.response().body(), b"abc");
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn body_is_capped() {
        let req = http::Request::new(Full::new(Bytes::from_static(b"0123456789")));
        let mut ctx = Context::from_request(req);
        ctx.set_body_limit(4);
        assert!(matches!(ctx.body().await, Err(Error::BindBodyTooLarge { limit: 4 })));
    }

    #[tokio::test]
    async fn body_is_cached() {
        let req = http::Request::new(Full::new(Bytes::from_static(b"payload")));
        let mut ctx = Context::from_request(req);
        assert_eq!(ctx.body().await.unwrap(), "payload");
        assert_eq!(ctx.body().await.unwrap(), "payload");
    }

    #[test]
    fn fatal_writes_json_and_aborts() {
        let req = http::Request::builder()
            .header("x-request-id", "rid-1")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let mut ctx = Context::from_request(req);
        ctx.fatal(Error::msg("boom"));
        assert!(ctx.is_ended());
        let res = ctx.take_response();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ctx.request_id(), "rid-1");
    }

    #[test]
    fn lazy_query_and_cookies() {
        let req = http::Request::builder()
            .uri("/p?a=1&b=2&a=3")
            .header("cookie", "sid=xyz")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let mut ctx = Context::from_request(req);
        assert_eq!(ctx.query().get_all("a"), ["1", "3"]);
        assert_eq!(ctx.get_cookie("sid"), Some("xyz"));
        ctx.set_cookie(&SetCookie::new("n", "v").path("/"));
        assert_eq!(ctx.response().headers()[SET_COOKIE], "n=v; Path=/");
    }
}
