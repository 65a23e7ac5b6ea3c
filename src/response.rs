//! Buffered response writer.
//!
//! Handlers write into a [`ResponseWriter`] owned by the
//! [`Context`](crate::Context); the server turns it into an
//! `http::Response` once the handler chain returns. [`ResponseWriter::size`]
//! tells renderers and error paths whether anything has been written yet.

use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use http_body_util::Full;

// ── ContentType ───────────────────────────────────────────────────────────────

/// Common content-type values written by renderers and helpers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContentType {
    Csv,          // text/csv
    EventStream,  // text/event-stream  (SSE)
    FormData,     // application/x-www-form-urlencoded
    Html,         // text/html; charset=utf-8
    Json,         // application/json; charset=utf-8
    OctetStream,  // application/octet-stream  (binary / file download)
    Pdf,          // application/pdf
    Text,         // text/plain; charset=utf-8
    Xml,          // application/xml; charset=utf-8
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv         => "text/csv",
            Self::EventStream => "text/event-stream",
            Self::FormData    => "application/x-www-form-urlencoded",
            Self::Html        => "text/html; charset=utf-8",
            Self::Json        => "application/json; charset=utf-8",
            Self::OctetStream => "application/octet-stream",
            Self::Pdf         => "application/pdf",
            Self::Text        => "text/plain; charset=utf-8",
            Self::Xml         => "application/xml; charset=utf-8",
        }
    }

    /// Guesses a content type from a file extension.
    pub fn from_extension(ext: &str) -> &'static str {
        match ext.to_ascii_lowercase().as_str() {
            "html" | "htm" => Self::Html.as_str(),
            "css"          => "text/css; charset=utf-8",
            "js" | "mjs"   => "text/javascript; charset=utf-8",
            "json"         => Self::Json.as_str(),
            "xml"          => Self::Xml.as_str(),
            "txt" | "md"   => Self::Text.as_str(),
            "csv"          => Self::Csv.as_str(),
            "pdf"          => Self::Pdf.as_str(),
            "png"          => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "gif"          => "image/gif",
            "svg"          => "image/svg+xml",
            "ico"          => "image/x-icon",
            "wasm"         => "application/wasm",
            _              => Self::OctetStream.as_str(),
        }
    }
}

impl From<ContentType> for HeaderValue {
    fn from(ct: ContentType) -> Self {
        HeaderValue::from_static(ct.as_str())
    }
}

// ── ResponseWriter ────────────────────────────────────────────────────────────

/// The response being built for the current request.
#[derive(Debug)]
pub struct ResponseWriter {
    status: StatusCode,
    status_written: bool,
    headers: HeaderMap,
    body: BytesMut,
}

impl Default for ResponseWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            status_written: false,
            headers: HeaderMap::new(),
            body: BytesMut::new(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Sets the status. Only the first explicit status sticks, matching a
    /// streaming writer where the status line is sent once.
    pub fn write_status(&mut self, status: StatusCode) {
        if !self.status_written {
            self.status = status;
            self.status_written = true;
        }
    }

    /// True once a status has been set explicitly.
    pub fn status_written(&self) -> bool {
        self.status_written
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Sets `name` unless it is already present.
    pub fn set_header_default(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.entry(name).or_insert(value);
    }

    pub fn write(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    /// Bytes written to the body so far.
    pub fn size(&self) -> usize {
        self.body.len()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Drops anything written while keeping the allocation.
    pub(crate) fn reset(&mut self) {
        self.status = StatusCode::OK;
        self.status_written = false;
        self.headers.clear();
        self.body.clear();
    }

    /// Moves the buffered response out, leaving this writer empty.
    ///
    /// A non-empty body without a `Content-Type` is sent as plain text.
    pub(crate) fn take(&mut self) -> http::Response<Full<Bytes>> {
        if !self.body.is_empty() {
            self.set_header_default(CONTENT_TYPE, ContentType::Text.into());
        }
        let body = self.body.split().freeze();
        let mut res = http::Response::new(Full::new(body));
        *res.status_mut() = self.status;
        *res.headers_mut() = std::mem::take(&mut self.headers);
        self.reset();
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_status_wins() {
        let mut w = ResponseWriter::new();
        w.write_status(StatusCode::CREATED);
        w.write_status(StatusCode::BAD_REQUEST);
        assert_eq!(w.status(), StatusCode::CREATED);
    }

    #[test]
    fn take_defaults_content_type() {
        let mut w = ResponseWriter::new();
        w.write(b"hi");
        let res = w.take();
        assert_eq!(res.headers()[CONTENT_TYPE], "text/plain; charset=utf-8");
        assert_eq!(w.size(), 0);
        assert!(!w.status_written());
    }

    #[test]
    fn empty_body_has_no_content_type() {
        let mut w = ResponseWriter::new();
        w.write_status(StatusCode::NO_CONTENT);
        let res = w.take();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        assert!(res.headers().get(CONTENT_TYPE).is_none());
    }
}
