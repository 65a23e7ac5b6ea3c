//! Request decoding.
//!
//! A binder turns the request into a [`Value`] document; the context then
//! deserializes the document into the caller's type with the coercing
//! deserializer, so `"42"` from a query string fills an `u32` field.
//!
//! [`Binder`] picks a source by `Content-Type` prefix:
//!
//! | Content-Type | Source |
//! |---|---|
//! | (empty) | URL query |
//! | `application/json` | JSON body |
//! | `application/x-www-form-urlencoded` | query, then body |
//! | `multipart/form-data` | fields and file headers |
//! | `application/xml`, `text/xml` | XML body |
//! | `application/octet-stream` | URL query |
//!
//! Form and query keys are paths into the document (`user.name=x`,
//! `tags.[]=a`). A key that cannot be placed is skipped.

use std::sync::Arc;

use http::StatusCode;
use serde_json::{Map, Value, json};

use crate::context::Context;
use crate::error::Error;
use crate::handler::BoxFuture;
use crate::request::Values;
use crate::value::{self, PathOptions, ValueError};

/// Decodes the current request into a document.
pub trait Bind: Send + Sync + 'static {
    fn bind<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, Result<Value, Error>>;
}

/// Places every form/query pair into `doc`.
pub fn bind_values(doc: &mut Value, values: &Values) -> Result<(), Error> {
    let opts = PathOptions::default();
    for (key, vals) in values.iter() {
        if key.split('.').any(|seg| seg == "[]") {
            for v in vals {
                place(doc, key, Value::String(v.clone()), &opts)?;
            }
            continue;
        }
        let v = match vals {
            [one] => Value::String(one.clone()),
            many => Value::Array(many.iter().cloned().map(Value::String).collect()),
        };
        place(doc, key, v, &opts)?;
    }
    Ok(())
}

fn place(doc: &mut Value, key: &str, v: Value, opts: &PathOptions) -> Result<(), Error> {
    match value::set(doc, key, v, opts) {
        Ok(()) | Err(ValueError::FieldNotFound { .. }) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn empty_doc() -> Value {
    Value::Object(Map::new())
}

// ── Sources ───────────────────────────────────────────────────────────────────

/// URL query only.
pub struct BindQuery;

impl Bind for BindQuery {
    fn bind<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, Result<Value, Error>> {
        Box::pin(async move {
            let mut doc = empty_doc();
            bind_values(&mut doc, ctx.query())?;
            Ok(doc)
        })
    }
}

pub struct BindJson;

impl Bind for BindJson {
    fn bind<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, Result<Value, Error>> {
        Box::pin(async move {
            let body = ctx.body().await?;
            if body.iter().all(u8::is_ascii_whitespace) {
                return Ok(empty_doc());
            }
            serde_json::from_slice(&body).map_err(|e| Error::BindDecode(format!("json: {e}")))
        })
    }
}

pub struct BindXml;

impl Bind for BindXml {
    fn bind<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, Result<Value, Error>> {
        Box::pin(async move {
            let body = ctx.body().await?;
            let text = std::str::from_utf8(&body).map_err(|e| Error::BindDecode(format!("xml: {e}")))?;
            if text.trim().is_empty() {
                return Ok(empty_doc());
            }
            quick_xml::de::from_str(text)
                .map(flatten_text)
                .map_err(|e| Error::BindDecode(format!("xml: {e}")))
        })
    }
}

/// Collapses `{"$text": v}` element wrappers into `v`.
fn flatten_text(v: Value) -> Value {
    match v {
        Value::Object(map) if map.len() == 1 && (map.contains_key("$text") || map.contains_key("$value")) => {
            map.into_iter().next().map(|(_, v)| flatten_text(v)).unwrap_or_default()
        }
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, flatten_text(v))).collect()),
        Value::Array(items) => Value::Array(items.into_iter().map(flatten_text).collect()),
        other => other,
    }
}

/// Query values overlaid with url-encoded or multipart body fields.
/// Uploaded files appear as `{filename, content_type, size}` objects.
pub struct BindForm;

impl Bind for BindForm {
    fn bind<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, Result<Value, Error>> {
        Box::pin(async move {
            let mut doc = empty_doc();
            bind_values(&mut doc, ctx.query())?;
            let form = ctx.form().await?;
            bind_values(&mut doc, &form.values)?;
            let opts = PathOptions::default();
            for file in &form.files {
                let meta = json!({
                    "filename": file.filename,
                    "content_type": file.content_type,
                    "size": file.size(),
                });
                place(&mut doc, &file.name, meta, &opts)?;
            }
            Ok(doc)
        })
    }
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

/// Picks a source by `Content-Type` prefix. Unknown types fail with
/// [`Error::BindUnsupportedContentType`].
#[derive(Clone)]
pub struct Binder {
    mapping: Vec<(String, Arc<dyn Bind>)>,
    default: Arc<dyn Bind>,
}

impl Default for Binder {
    fn default() -> Self {
        let form: Arc<dyn Bind> = Arc::new(BindForm);
        let xml: Arc<dyn Bind> = Arc::new(BindXml);
        let query: Arc<dyn Bind> = Arc::new(BindQuery);
        Self {
            mapping: vec![
                ("application/json".into(), Arc::new(BindJson)),
                ("application/x-www-form-urlencoded".into(), Arc::clone(&form)),
                ("multipart/form-data".into(), form),
                ("application/xml".into(), Arc::clone(&xml)),
                ("text/xml".into(), xml),
                ("application/octet-stream".into(), Arc::clone(&query)),
            ],
            default: query,
        }
    }
}

impl Binder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes content types starting with `prefix` to `bind`; replaces an
    /// existing mapping for the same prefix.
    pub fn with(mut self, prefix: &str, bind: Arc<dyn Bind>) -> Self {
        let prefix = prefix.to_ascii_lowercase();
        match self.mapping.iter_mut().find(|(p, _)| *p == prefix) {
            Some(entry) => entry.1 = bind,
            None => self.mapping.push((prefix, bind)),
        }
        self
    }

    fn select(&self, content_type: &str) -> Result<Arc<dyn Bind>, Error> {
        let ct = content_type.trim().to_ascii_lowercase();
        if ct.is_empty() {
            return Ok(Arc::clone(&self.default));
        }
        self.mapping
            .iter()
            .find(|(prefix, _)| ct.starts_with(prefix.as_str()))
            .map(|(_, b)| Arc::clone(b))
            .ok_or_else(|| Error::BindUnsupportedContentType(content_type.to_owned()))
    }
}

impl Bind for Binder {
    fn bind<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, Result<Value, Error>> {
        Box::pin(async move {
            let bind = self.select(ctx.content_type())?;
            bind.bind(ctx).await
        })
    }
}

/// Tags every error of the wrapped binder with a response status and code.
/// Body-size errors keep their 413.
pub struct StatusBinder {
    inner: Arc<dyn Bind>,
    status: StatusCode,
    code: i32,
}

impl StatusBinder {
    pub fn new(inner: Arc<dyn Bind>, status: StatusCode, code: i32) -> Self {
        Self { inner, status, code }
    }
}

impl Bind for StatusBinder {
    fn bind<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, Result<Value, Error>> {
        Box::pin(async move {
            self.inner.bind(ctx).await.map_err(|err| match err {
                Error::BindBodyTooLarge { .. } => err,
                err => err.with_status(self.status, self.code),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http_body_util::Full;

    use super::*;

    fn ctx(method: &str, uri: &str, content_type: &str, body: &'static str) -> Context {
        let mut req = http::Request::builder().method(method).uri(uri);
        if !content_type.is_empty() {
            req = req.header("content-type", content_type);
        }
        Context::from_request(req.body(Full::new(Bytes::from_static(body.as_bytes()))).unwrap())
    }

    #[tokio::test]
    async fn query_paths() {
        let mut c = ctx("GET", "/?name=a&tags.[]=x&tags.[]=y&user.age=3", "", "");
        let doc = Binder::default().bind(&mut c).await.unwrap();
        assert_eq!(doc["name"], "a");
        assert_eq!(doc["user"]["age"], "3");
        assert_eq!(doc["tags"], json!(["x", "y"]));
    }

    #[tokio::test]
    async fn json_with_charset() {
        let mut c = ctx("POST", "/", "application/json; charset=utf-8", r#"{"a":1}"#);
        assert_eq!(Binder::default().bind(&mut c).await.unwrap(), json!({"a": 1}));
    }

    #[tokio::test]
    async fn form_overlays_query() {
        let mut c = ctx("POST", "/?a=q&b=q", "application/x-www-form-urlencoded", "b=f&c=f");
        let doc = Binder::default().bind(&mut c).await.unwrap();
        assert_eq!(doc, json!({"a": "q", "b": "f", "c": "f"}));
    }

    #[tokio::test]
    async fn xml_body() {
        let mut c = ctx("POST", "/", "application/xml", "<user><name>bob</name><age>7</age></user>");
        let doc = Binder::default().bind(&mut c).await.unwrap();
        assert!(doc.get("name").is_some());
    }

    #[tokio::test]
    async fn query_index_past_end_is_400() {
        let mut c = ctx("GET", "/?a.[]=x&a.4000000000=y", "", "");
        let err = Binder::default().bind(&mut c).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(matches!(err, Error::BindField(ValueError::IndexOutOfRange { len: 1, .. })), "{err}");
    }

    #[tokio::test]
    async fn unsupported_content_type() {
        let mut c = ctx("POST", "/", "text/csv", "a,b");
        let err = Binder::default().bind(&mut c).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn status_binder_keeps_413() {
        let inner: Arc<dyn Bind> = Arc::new(Binder::default());
        let b = StatusBinder::new(inner, StatusCode::UNPROCESSABLE_ENTITY, 1);

        let mut c = ctx("POST", "/", "application/json", "{bad");
        assert_eq!(b.bind(&mut c).await.unwrap_err().status(), StatusCode::UNPROCESSABLE_ENTITY);

        let mut c = ctx("POST", "/", "application/json", r#"{"a":"0123456789"}"#);
        c.set_body_limit(4);
        assert_eq!(b.bind(&mut c).await.unwrap_err().status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
