//! Response encoding.
//!
//! [`Renderer`] walks the `Accept` header left to right, skipping `q=0`
//! entries, and hands the value to the first renderer registered for the
//! media type. A renderer that fails before writing anything lets the next
//! entry try; one that fails after writing surfaces its error. When nothing
//! matches, the `*/*` renderer (JSON) answers.
//!
//! Every render appends `Accept` to `Vary` and sets `Content-Type` only when
//! the handler has not set one.

use std::io::Write as _;
use std::sync::Arc;

use http::StatusCode;
use http::header::{ACCEPT, CONTENT_TYPE, HeaderValue, VARY};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::{Value, json};

use crate::context::Context;
use crate::error::Error;
use crate::params::PARAM_TEMPLATE;
use crate::response::ContentType;

/// Encodes a value into the response.
pub trait Render: Send + Sync + 'static {
    fn render(&self, ctx: &mut Context, data: &Value) -> Result<(), Error>;
}

/// Named HTML templates. No engine ships with the crate; applications plug
/// one in through this trait.
pub trait HtmlTemplates: Send + Sync + 'static {
    fn render(&self, name: &str, data: &Value) -> Result<String, Error>;
}

fn set_content_type(ctx: &mut Context, ct: ContentType) {
    ctx.response_mut().set_header_default(CONTENT_TYPE, ct.into());
}

// ── Renderers ─────────────────────────────────────────────────────────────────

/// JSON. Indented with tabs when the client did not ask for JSON explicitly
/// (a browser hitting the `*/*` fallback). Scalars are wrapped as
/// `{status, x-request-id, message}`.
pub struct RenderJson;

impl Render for RenderJson {
    fn render(&self, ctx: &mut Context, data: &Value) -> Result<(), Error> {
        set_content_type(ctx, ContentType::Json);
        let wrapped;
        let data = match data {
            Value::Object(_) | Value::Array(_) => data,
            scalar => {
                wrapped = json!({
                    "status": ctx.response().status().as_u16(),
                    "x-request-id": ctx.request_id(),
                    "message": scalar,
                });
                &wrapped
            }
        };

        let accept = ctx.get_header(ACCEPT.as_str()).unwrap_or_default();
        let mut buf = Vec::with_capacity(128);
        if accept.contains("application/json") {
            serde_json::to_writer(&mut buf, data)?;
        } else {
            let mut ser = serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"\t"));
            data.serialize(&mut ser)?;
            buf.write_all(b"\n")?;
        }
        ctx.write(&buf);
        Ok(())
    }
}

/// XML with a `<response>` root element.
pub struct RenderXml;

impl Render for RenderXml {
    fn render(&self, ctx: &mut Context, data: &Value) -> Result<(), Error> {
        let xml = quick_xml::se::to_string_with_root("response", data).map_err(|e| Error::Render(e.to_string()))?;
        set_content_type(ctx, ContentType::Xml);
        ctx.write(xml.as_bytes());
        Ok(())
    }
}

/// Plain text: strings as is, anything else as compact JSON.
pub struct RenderText;

impl Render for RenderText {
    fn render(&self, ctx: &mut Context, data: &Value) -> Result<(), Error> {
        set_content_type(ctx, ContentType::Text);
        match data {
            Value::String(s) => ctx.write(s.as_bytes()),
            other => ctx.write(other.to_string().as_bytes()),
        }
        Ok(())
    }
}

/// HTML through the template named by the route's `template` param.
pub struct RenderHtml {
    templates: Option<Arc<dyn HtmlTemplates>>,
}

impl RenderHtml {
    pub fn new(templates: Option<Arc<dyn HtmlTemplates>>) -> Self {
        Self { templates }
    }
}

impl Render for RenderHtml {
    fn render(&self, ctx: &mut Context, data: &Value) -> Result<(), Error> {
        let name = ctx.get_param(PARAM_TEMPLATE).unwrap_or_default().to_owned();
        let templates = match &self.templates {
            Some(t) if !name.is_empty() => t,
            _ => return Err(Error::RenderTemplateMissing(name)),
        };
        let html = templates.render(&name, data)?;
        let headers = ctx.response_mut().headers_mut();
        headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
        headers.insert("x-frame-options", HeaderValue::from_static("SAMEORIGIN"));
        headers.insert("x-xss-protection", HeaderValue::from_static("1; mode=block"));
        set_content_type(ctx, ContentType::Html);
        ctx.write(html.as_bytes());
        Ok(())
    }
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

/// Accept-driven renderer table.
#[derive(Clone)]
pub struct Renderer {
    mapping: Vec<(String, Arc<dyn Render>)>,
    fallback: Arc<dyn Render>,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Renderer {
    /// The default table; HTML is served only when `templates` is given.
    pub fn new(templates: Option<Arc<dyn HtmlTemplates>>) -> Self {
        let json: Arc<dyn Render> = Arc::new(RenderJson);
        let xml: Arc<dyn Render> = Arc::new(RenderXml);
        Self {
            mapping: vec![
                ("application/json".into(), Arc::clone(&json)),
                ("application/xml".into(), Arc::clone(&xml)),
                ("text/xml".into(), xml),
                ("text/plain".into(), Arc::new(RenderText)),
                ("text/html".into(), Arc::new(RenderHtml::new(templates))),
            ],
            fallback: json,
        }
    }

    /// Registers `render` for `media_type`; `*/*` replaces the fallback.
    pub fn with(mut self, media_type: &str, render: Arc<dyn Render>) -> Self {
        let media_type = media_type.to_ascii_lowercase();
        if media_type == "*/*" {
            self.fallback = render;
            return self;
        }
        match self.mapping.iter_mut().find(|(m, _)| *m == media_type) {
            Some(entry) => entry.1 = render,
            None => self.mapping.push((media_type, render)),
        }
        self
    }

    fn lookup(&self, media_type: &str) -> Option<&Arc<dyn Render>> {
        self.mapping.iter().find(|(m, _)| m == media_type).map(|(_, r)| r)
    }
}

/// Media types of an `Accept` header in order, without `q=0` entries.
pub fn accept_entries(accept: &str) -> Vec<String> {
    accept
        .split(',')
        .filter_map(|entry| {
            let mut parts = entry.split(';');
            let media = parts.next()?.trim().to_ascii_lowercase();
            let refused = parts.any(|p| {
                p.trim()
                    .strip_prefix("q=")
                    .and_then(|q| q.trim().parse::<f32>().ok())
                    .is_some_and(|q| q == 0.0)
            });
            (!media.is_empty() && !refused).then_some(media)
        })
        .collect()
}

impl Render for Renderer {
    fn render(&self, ctx: &mut Context, data: &Value) -> Result<(), Error> {
        ctx.response_mut().headers_mut().append(VARY, HeaderValue::from_static("Accept"));
        let accept = ctx.get_header(ACCEPT.as_str()).unwrap_or_default().to_owned();
        for media in accept_entries(&accept) {
            if media == "*/*" {
                break;
            }
            let Some(render) = self.lookup(&media) else { continue };
            match render.render(ctx, data) {
                Ok(()) => return Ok(()),
                Err(err) if ctx.response().size() > 0 => return Err(err),
                Err(err) => ctx.debug(format_args!("render {media}: {err}, trying next")),
            }
        }
        self.fallback.render(ctx, data)
    }
}

/// Tags every error of the wrapped renderer with a response status and code.
pub struct StatusRender {
    inner: Arc<dyn Render>,
    status: StatusCode,
    code: i32,
}

impl StatusRender {
    pub fn new(inner: Arc<dyn Render>, status: StatusCode, code: i32) -> Self {
        Self { inner, status, code }
    }
}

impl Render for StatusRender {
    fn render(&self, ctx: &mut Context, data: &Value) -> Result<(), Error> {
        self.inner
            .render(ctx, data)
            .map_err(|err| err.with_status(self.status, self.code))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http_body_util::Full;

    use super::*;

    fn ctx(accept: &str) -> Context {
        let req = http::Request::builder()
            .header(ACCEPT, accept)
            .body(Full::new(Bytes::new()))
            .unwrap();
        Context::from_request(req)
    }

    #[test]
    fn accept_order_and_q0() {
        assert_eq!(
            accept_entries("text/html;q=0, application/xml, */*;q=0.8"),
            ["application/xml", "*/*"]
        );
    }

    #[test]
    fn html_without_template_falls_back_to_pretty_json() {
        let mut c = ctx("text/html");
        Renderer::default().render(&mut c, &json!({"a": 1})).unwrap();
        let res = c.response();
        assert_eq!(res.headers()[CONTENT_TYPE], "application/json; charset=utf-8");
        assert_eq!(res.headers()[VARY], "Accept");
        assert_eq!(res.body(), b"{\n\t\"a\": 1\n}\n");
    }

    #[test]
    fn explicit_json_is_compact_and_scalars_wrapped() {
        let mut c = ctx("application/json");
        Renderer::default().render(&mut c, &json!("done")).unwrap();
        let body: Value = serde_json::from_slice(c.response().body()).unwrap();
        assert_eq!(body["message"], "done");
        assert_eq!(body["status"], 200);
    }

    #[test]
    fn xml_and_text() {
        let mut c = ctx("application/xml");
        Renderer::default().render(&mut c, &json!({"name": "x"})).unwrap();
        assert_eq!(c.response().body(), b"<response><name>x</name></response>");

        let mut c = ctx("text/plain");
        Renderer::default().render(&mut c, &json!("hi")).unwrap();
        assert_eq!(c.response().body(), b"hi");
    }

    struct Echo;

    impl HtmlTemplates for Echo {
        fn render(&self, name: &str, data: &Value) -> Result<String, Error> {
            Ok(format!("<p>{name}:{data}</p>"))
        }
    }

    #[test]
    fn html_with_template_sets_security_headers() {
        let mut c = ctx("text/html");
        c.set_param(PARAM_TEMPLATE, "index");
        Renderer::new(Some(Arc::new(Echo))).render(&mut c, &json!(1)).unwrap();
        let res = c.response();
        assert_eq!(res.headers()["x-frame-options"], "SAMEORIGIN");
        assert_eq!(res.body(), b"<p>index:1</p>");
    }
}
