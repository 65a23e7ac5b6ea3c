//! Runtime handler conversion.
//!
//! [`IntoHandler`](crate::IntoHandler) covers every shape known at compile
//! time. The extender covers the rest: values whose concrete type is only
//! known at runtime (handlers loaded from a table, plugin registrations) are
//! passed as `Box<dyn Any>` and converted by the first registered conversion
//! whose input type matches.
//!
//! Default conversions, in order:
//!
//! | Input | Behaviour |
//! |---|---|
//! | [`HandlerFunc`] | used as is |
//! | `fn()` / `fn() -> Value` / `fn() -> Result<(), Error>` / `fn() -> Result<Value, Error>` | call, reply |
//! | `fn(&mut Context)` and the same three return shapes | call, reply |
//! | `fn(&mut Context, Map<String, Value>) -> Result<Value, Error>` | bind a map, call, reply |

use std::any::{Any, TypeId, type_name};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::context::Context;
use crate::error::Error;
use crate::handler::{BoxFuture, ErasedHandler, HandlerFunc, Reply};

/// A type-erased handler value awaiting conversion.
pub type AnyHandler = Box<dyn Any + Send + Sync>;

type Conversion = Arc<dyn Fn(AnyHandler) -> Option<HandlerFunc> + Send + Sync>;

struct Entry {
    type_id: TypeId,
    type_name: &'static str,
    convert: Conversion,
}

/// Ordered registry of runtime handler conversions.
pub struct HandlerExtender {
    entries: RwLock<Vec<Entry>>,
}

impl Default for HandlerExtender {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerExtender {
    /// An extender with the default conversions installed.
    pub fn new() -> Self {
        let ext = Self::empty();
        register_defaults(&ext);
        ext
    }

    pub fn empty() -> Self {
        Self { entries: RwLock::new(Vec::new()) }
    }

    /// Appends a conversion for values of type `T`. An earlier conversion for
    /// the same type keeps precedence.
    pub fn register<T, F>(&self, convert: F)
    where
        T: Any + Send + Sync,
        F: Fn(T) -> HandlerFunc + Send + Sync + 'static,
    {
        let convert: Conversion = Arc::new(move |value: AnyHandler| {
            value.downcast::<T>().ok().map(|v| convert(*v))
        });
        self.entries.write().push(Entry {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            convert,
        });
    }

    /// Converts `value` with the first conversion registered for its type.
    pub fn create(&self, value: AnyHandler) -> Result<HandlerFunc, Error> {
        let id = (*value).type_id();
        let convert = self
            .entries
            .read()
            .iter()
            .find(|e| e.type_id == id)
            .map(|e| Arc::clone(&e.convert));
        match convert.and_then(|c| c(value)) {
            Some(h) => Ok(h),
            None => {
                tracing::warn!(?id, "handler extender: no conversion for handler value");
                Err(Error::msg("handler extender: unsupported handler type"))
            }
        }
    }

    /// Input type names of the registered conversions, in order.
    pub fn metadata(&self) -> Vec<&'static str> {
        self.entries.read().iter().map(|e| e.type_name).collect()
    }
}

// ── Default conversions ───────────────────────────────────────────────────────

struct SyncHandler<F> {
    f: F,
    name: &'static str,
}

impl<F> ErasedHandler for SyncHandler<F>
where
    F: Fn(&mut Context) + Send + Sync + 'static,
{
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        (self.f)(ctx);
        Box::pin(std::future::ready(()))
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

fn sync_handler<T>(f: impl Fn(&mut Context) + Send + Sync + 'static) -> HandlerFunc {
    Arc::new(SyncHandler { f, name: type_name::<T>() })
}

type MapFn = fn(&mut Context, Map<String, Value>) -> Result<Value, Error>;

struct MapHandler(MapFn);

impl ErasedHandler for MapHandler {
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            match ctx.bind::<Map<String, Value>>().await {
                Ok(data) => (self.0)(ctx, data).reply(ctx),
                Err(err) => ctx.fatal(err),
            }
        })
    }

    fn name(&self) -> &'static str {
        type_name::<MapFn>()
    }
}

macro_rules! no_context {
    ($ext:ident, $($ty:ty),+) => {$(
        $ext.register(|f: $ty| sync_handler::<$ty>(move |ctx: &mut Context| f().reply(ctx)));
    )+};
}

macro_rules! with_context {
    ($ext:ident, $($ty:ty),+) => {$(
        $ext.register(|f: $ty| {
            sync_handler::<$ty>(move |ctx: &mut Context| {
                let out = f(ctx);
                out.reply(ctx)
            })
        });
    )+};
}

fn register_defaults(ext: &HandlerExtender) {
    ext.register(|h: HandlerFunc| h);
    no_context!(
        ext,
        fn(),
        fn() -> Value,
        fn() -> Result<(), Error>,
        fn() -> Result<Value, Error>
    );
    with_context!(
        ext,
        fn(&mut Context),
        fn(&mut Context) -> Value,
        fn(&mut Context) -> Result<(), Error>,
        fn(&mut Context) -> Result<Value, Error>
    );
    ext.register(|f: MapFn| Arc::new(MapHandler(f)) as HandlerFunc);
}

#[cfg(test)]
mod tests {
    use http::StatusCode;
    use serde_json::json;

    use super::*;

    fn ping(ctx: &mut Context) {
        ctx.write_string("pong");
    }

    fn fails(_: &mut Context) -> Result<Value, Error> {
        Err(Error::msg("nope").with_status(StatusCode::CONFLICT, 7))
    }

    fn version() -> Value {
        json!({"version": 1})
    }

    async fn run(h: HandlerFunc) -> Context {
        let mut ctx = Context::new();
        ctx.set_handlers(0, &[h]);
        ctx.next().await;
        ctx
    }

    #[tokio::test]
    async fn fn_pointer_shapes() {
        let ext = HandlerExtender::new();

        let h = ext.create(Box::new(ping as fn(&mut Context))).unwrap();
        assert_eq!(run(h).await.response().body(), b"pong");

        let h = ext.create(Box::new(fails as fn(&mut Context) -> Result<Value, Error>)).unwrap();
        assert_eq!(run(h).await.response().status(), StatusCode::CONFLICT);

        let h = ext.create(Box::new(version as fn() -> Value)).unwrap();
        let ctx = run(h).await;
        let body: Value = serde_json::from_slice(ctx.response().body()).unwrap();
        assert_eq!(body, json!({"version": 1}));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let ext = HandlerExtender::new();
        assert!(ext.create(Box::new(42u32)).is_err());
    }

    struct Text(&'static str);

    impl ErasedHandler for Text {
        fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
            ctx.write_string(self.0);
            Box::pin(std::future::ready(()))
        }
    }

    #[tokio::test]
    async fn first_registration_wins() {
        let ext = HandlerExtender::empty();
        ext.register(|_: u8| Arc::new(Text("first")) as HandlerFunc);
        ext.register(|_: u8| Arc::new(Text("second")) as HandlerFunc);
        assert_eq!(ext.metadata(), ["u8", "u8"]);
        let h = ext.create(Box::new(1u8)).unwrap();
        assert_eq!(run(h).await.response().body(), b"first");
    }
}
