//! Built-in middleware.
//!
//! Each constructor returns a [`HandlerFunc`] meant for
//! [`App::add_middleware`](crate::App::add_middleware) or
//! [`Router::add_middleware`](crate::Router::add_middleware). Middleware that
//! needs to see the outcome of the rest of the chain calls
//! [`Context::next`] itself and inspects the response afterwards.
//!
//! ```rust,no_run
//! use eudore::{App, middleware};
//!
//! let app = App::new();
//! app.add_middleware([
//!     middleware::recover(),
//!     middleware::request_id(),
//!     middleware::logger(),
//! ]);
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use http::HeaderValue;

use crate::context::Context;
use crate::error::Error;
use crate::handler::{BoxFuture, ErasedHandler, HandlerFunc};

pub const HEADER_REQUEST_ID: &str = "x-request-id";

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

// ── Recover ───────────────────────────────────────────────────────────────────

struct Recover;

impl ErasedHandler for Recover {
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if let Err(payload) = AssertUnwindSafe(ctx.next()).catch_unwind().await {
                let message = panic_message(payload.as_ref()).to_owned();
                let backtrace = std::backtrace::Backtrace::force_capture();
                ctx.error(format_args!("handler panicked: {message}\n{backtrace}"));
                ctx.fatal(Error::msg(format!("panic: {message}")));
            }
        })
    }

    fn name(&self) -> &'static str {
        "eudore::middleware::recover"
    }
}

/// Catches a panic in any later handler and turns it into a 500 response
/// (unless a body was already written). The chain ends after a panic.
pub fn recover() -> HandlerFunc {
    Arc::new(Recover)
}

// ── Request id ────────────────────────────────────────────────────────────────

struct RequestId;

impl ErasedHandler for RequestId {
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if ctx.request_id().is_empty() {
                ctx.set_request_id(uuid::Uuid::new_v4().to_string());
            }
            if let Ok(value) = HeaderValue::from_str(ctx.request_id()) {
                ctx.response_mut().headers_mut().insert(HEADER_REQUEST_ID, value);
            }
        })
    }

    fn name(&self) -> &'static str {
        "eudore::middleware::request_id"
    }
}

/// Gives every request an id. An incoming `X-Request-ID` is kept, otherwise
/// a UUID v4 is generated; the id is echoed in the response header and
/// attached to every log line of the request.
pub fn request_id() -> HandlerFunc {
    Arc::new(RequestId)
}

// ── Access log ────────────────────────────────────────────────────────────────

struct Logger;

impl ErasedHandler for Logger {
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let start = Instant::now();
            ctx.next().await;

            let status = ctx.response().status().as_u16();
            let size = ctx.response().size();
            let elapsed = start.elapsed();
            let route = ctx.get_param(crate::params::PARAM_ROUTE).unwrap_or_default().to_owned();
            let remote = ctx.remote_addr().map(|ip| ip.to_string()).unwrap_or_default();
            let line = format!(
                "{} {} {status} {size}B {elapsed:?} route={route} remote={remote}",
                ctx.method(),
                ctx.uri(),
            );
            match status {
                500.. => ctx.error(line),
                400.. => ctx.warn(line),
                _     => ctx.info(line),
            }
        })
    }

    fn name(&self) -> &'static str {
        "eudore::middleware::logger"
    }
}

/// Writes one access-log line per request once the rest of the chain has
/// run: method, uri, status, body size, latency, matched route and client
/// address. 5xx responses log at error level and 4xx at warn.
pub fn logger() -> HandlerFunc {
    Arc::new(Logger)
}

// ── Body limit ────────────────────────────────────────────────────────────────

struct BodyLimit(usize);

impl ErasedHandler for BodyLimit {
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move { ctx.set_body_limit(self.0) })
    }

    fn name(&self) -> &'static str {
        "eudore::middleware::body_limit"
    }
}

/// Overrides the request body cap for the routes below this middleware.
/// Reads past the cap fail with a 413.
pub fn body_limit(limit: usize) -> HandlerFunc {
    Arc::new(BodyLimit(limit))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::StatusCode;
    use http_body_util::Full;
    use serde_json::Value;

    use super::*;

    struct Boom;

    impl ErasedHandler for Boom {
        fn call<'a>(&'a self, _ctx: &'a mut Context) -> BoxFuture<'a, ()> {
            Box::pin(async move { panic!("boom") })
        }
    }

    struct ReadBody;

    impl ErasedHandler for ReadBody {
        fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                match ctx.body().await {
                    Ok(body) => ctx.write(&body),
                    Err(err) => ctx.fatal(err),
                }
            })
        }
    }

    fn context(body: &'static str, handlers: &[HandlerFunc]) -> Context {
        let req = http::Request::builder()
            .uri("/x")
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .unwrap();
        let mut ctx = Context::from_request(req);
        ctx.set_handlers(0, handlers);
        ctx
    }

    #[tokio::test]
    async fn recover_turns_panic_into_500() {
        let mut ctx = context("", &[recover(), Arc::new(Boom)]);
        ctx.next().await;
        assert_eq!(ctx.response().status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = serde_json::from_slice(ctx.response().body()).unwrap();
        assert_eq!(body["message"], "panic: boom");
        assert!(ctx.is_ended());
    }

    #[tokio::test]
    async fn request_id_generated_or_kept() {
        let mut ctx = context("", &[request_id()]);
        ctx.next().await;
        let id = ctx.request_id().to_owned();
        assert_eq!(id.len(), 36);
        assert_eq!(ctx.response().headers()[HEADER_REQUEST_ID], id.as_str());

        let req = http::Request::builder()
            .header("X-Request-ID", "abc")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let mut ctx = Context::from_request(req);
        ctx.set_handlers(0, &[request_id()]);
        ctx.next().await;
        assert_eq!(ctx.request_id(), "abc");
    }

    #[tokio::test]
    async fn body_limit_rejects_large_bodies() {
        let mut ctx = context("0123456789", &[body_limit(4), Arc::new(ReadBody)]);
        ctx.next().await;
        assert_eq!(ctx.response().status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn logger_runs_rest_of_chain() {
        let mut ctx = context("hi", &[logger(), Arc::new(ReadBody)]);
        ctx.next().await;
        assert_eq!(ctx.response().body(), b"hi");
    }
}
