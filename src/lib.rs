//! # eudore
//!
//! An HTTP application framework on hyper and tokio.
//!
//! - Radix routing with typed parameter rules, wildcards, host patterns and
//!   route groups. Route strings carry their own parameters:
//!   `/users/:id|min=1 action=show`.
//! - One handler chain per request. Middleware and handlers share the same
//!   shape and run over a pooled [`Context`]; any handler can call
//!   [`Context::next`] to wrap the rest of the chain or [`Context::end`] to
//!   stop it.
//! - Content-negotiated bind and render with per-type validation rules.
//! - TLS, mutual TLS, graceful shutdown and live restart with listener
//!   hand-over.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use eudore::{App, Context, Error, middleware};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Deserialize, Serialize)]
//! struct User {
//!     #[serde(rename = "Name")]
//!     name: String,
//! }
//!
//! async fn get_user(ctx: &mut Context) -> Result<User, Error> {
//!     let name = ctx.get_param("id").unwrap_or_default().to_owned();
//!     Ok(User { name })
//! }
//!
//! async fn create_user(_ctx: &mut Context, user: User) -> Result<User, Error> {
//!     Ok(user)
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let app = App::new();
//!     app.add_middleware([middleware::recover(), middleware::request_id(), middleware::logger()]);
//!
//!     let api = app.router().group("/api");
//!     api.get("/users/:id|min=1", get_user);
//!     api.post("/users", create_user);
//!
//!     app.listen("0.0.0.0:8080").await;
//!     app.run().await
//! }
//! ```

mod app;
mod bind;
mod context;
mod error;
mod extender;
mod handler;
mod method;
mod multipart;
mod params;
mod render;
mod request;
mod response;
mod validate;

pub mod config;
pub mod funcs;
pub mod logging;
pub mod middleware;
pub mod router;
pub mod server;
pub mod value;

pub use app::{App, AppOption};
pub use bind::{Bind, BindForm, BindJson, BindQuery, BindXml, Binder, StatusBinder, bind_values};
pub use config::Config;
pub use context::{Context, DEFAULT_BODY_LIMIT, DEFAULT_MULTIPART_LIMIT, MAX_HANDLERS};
pub use error::{BoxError, Error};
pub use extender::{AnyHandler, HandlerExtender};
pub use funcs::{Func, FuncCreator, FuncCreatorExpr, FuncCreatorStd, FuncKind};
pub use handler::{BoxFuture, ErasedHandler, HandlerFunc, HttpHandler, IntoHandler, Reply, StaticFiles, handler_func};
pub use method::Method;
pub use multipart::{FileHeader, Form};
pub use params::{PARAM_ALLOW, PARAM_HOST, PARAM_REGISTER, PARAM_ROUTE, PARAM_TEMPLATE, Params};
pub use render::{
    HtmlTemplates, Render, RenderHtml, RenderJson, RenderText, RenderXml, Renderer, StatusRender, accept_entries,
};
pub use request::{Cookie, SameSite, SetCookie, Values};
pub use response::{ContentType, ResponseWriter};
pub use router::{Router, RouterCore, RouterMetadata};
pub use server::{Server, ServerConfig, ServerListenConfig, TlsMode};
pub use validate::Validator;
