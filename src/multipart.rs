//! `multipart/form-data` parsing.
//!
//! The body is already buffered (and capped) by the context, so parsing is a
//! single pass over a byte slice: find each `--boundary`, read the part's
//! headers, slice out its data.

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::Error;
use crate::request::Values;

/// An uploaded file.
#[derive(Clone, Debug)]
pub struct FileHeader {
    /// Form field name.
    pub name: String,
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl FileHeader {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// A parsed multipart form: text fields and uploaded files.
#[derive(Clone, Debug, Default)]
pub struct Form {
    pub values: Values,
    pub files: Vec<FileHeader>,
}

impl Form {
    pub fn file(&self, name: &str) -> Option<&FileHeader> {
        self.files.iter().find(|f| f.name == name)
    }
}

fn malformed(detail: &str) -> Error {
    Error::BindDecode(format!("multipart: {detail}"))
}

/// Extracts the boundary parameter from a `multipart/form-data` content type.
pub fn parse_boundary(content_type: &str) -> Result<String, Error> {
    if !content_type.to_ascii_lowercase().starts_with("multipart/form-data") {
        return Err(malformed("not multipart/form-data"));
    }
    content_type
        .split(';')
        .filter_map(|p| {
            let (k, v) = p.trim().split_once('=')?;
            k.eq_ignore_ascii_case("boundary").then(|| unquote(v))
        })
        .find(|b| !b.is_empty())
        .ok_or_else(|| malformed("missing boundary"))
}

/// Parses a buffered multipart body. Parts larger in total than `limit`
/// fail with [`Error::BindBodyTooLarge`].
pub fn parse(body: &Bytes, boundary: &str, limit: usize) -> Result<Form, Error> {
    let delimiter = format!("--{boundary}").into_bytes();
    let mut form = Form::default();
    let mut total = 0usize;
    let mut pos = find(body, &delimiter, 0).ok_or_else(|| malformed("no boundary"))?;

    loop {
        pos += delimiter.len();
        if body[pos..].starts_with(b"--") {
            break;
        }
        if !body[pos..].starts_with(b"\r\n") {
            return Err(malformed("expected CRLF after boundary"));
        }
        pos += 2;

        let (headers, data_start) = parse_headers(body, pos)?;
        let disposition = headers
            .get("content-disposition")
            .ok_or_else(|| malformed("part without content-disposition"))?;
        let (name, filename) = parse_content_disposition(disposition)?;

        let next = find(body, &delimiter, data_start).ok_or_else(|| malformed("unexpected end"))?;
        let data_end = if next >= data_start + 2 && &body[next - 2..next] == b"\r\n" { next - 2 } else { next };

        total += data_end - data_start;
        if total > limit {
            return Err(Error::BindBodyTooLarge { limit });
        }

        let data = body.slice(data_start..data_end);
        match filename {
            Some(filename) => form.files.push(FileHeader {
                name,
                filename,
                content_type: headers.get("content-type").cloned(),
                data,
            }),
            None => form.values.add(name, String::from_utf8_lossy(&data).into_owned()),
        }
        pos = next;
    }
    Ok(form)
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

fn parse_headers(body: &[u8], mut pos: usize) -> Result<(HashMap<String, String>, usize), Error> {
    let mut headers = HashMap::new();
    loop {
        let end = find(body, b"\r\n", pos).ok_or_else(|| malformed("unterminated part headers"))?;
        if end == pos {
            return Ok((headers, end + 2));
        }
        let line = std::str::from_utf8(&body[pos..end]).map_err(|_| malformed("non-UTF-8 part header"))?;
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_owned());
        }
        pos = end + 2;
    }
}

/// `form-data; name="field"; filename="a.txt"` → `("field", Some("a.txt"))`.
fn parse_content_disposition(value: &str) -> Result<(String, Option<String>), Error> {
    let mut name = None;
    let mut filename = None;
    for part in value.split(';').map(str::trim) {
        match part.split_once('=') {
            Some((k, v)) if k.eq_ignore_ascii_case("name") => name = Some(unquote(v)),
            Some((k, v)) if k.eq_ignore_ascii_case("filename") => filename = Some(unquote(v)),
            _ => {}
        }
    }
    let name = name.ok_or_else(|| malformed("content-disposition without name"))?;
    Ok((name, filename))
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = "--XYZ\r\n\
        Content-Disposition: form-data; name=\"title\"\r\n\r\n\
        hello\r\n\
        --XYZ\r\n\
        Content-Disposition: form-data; name=\"tags\"\r\n\r\n\
        a\r\n\
        --XYZ\r\n\
        Content-Disposition: form-data; name=\"tags\"\r\n\r\n\
        b\r\n\
        --XYZ\r\n\
        Content-Disposition: form-data; name=\"doc\"; filename=\"a.txt\"\r\n\
        Content-Type: text/plain\r\n\r\n\
        file body\r\n\
        --XYZ--\r\n";

    #[test]
    fn boundary_from_content_type() {
        assert_eq!(parse_boundary("multipart/form-data; boundary=\"XYZ\"").unwrap(), "XYZ");
        assert!(parse_boundary("multipart/form-data").is_err());
        assert!(parse_boundary("application/json").is_err());
    }

    #[test]
    fn fields_and_files() {
        let form = parse(&Bytes::from_static(BODY.as_bytes()), "XYZ", 1 << 20).unwrap();
        assert_eq!(form.values.get("title"), Some("hello"));
        assert_eq!(form.values.get_all("tags"), ["a", "b"]);
        let doc = form.file("doc").unwrap();
        assert_eq!(doc.filename, "a.txt");
        assert_eq!(doc.content_type.as_deref(), Some("text/plain"));
        assert_eq!(&doc.data[..], b"file body");
    }

    #[test]
    fn limit_is_enforced() {
        let err = parse(&Bytes::from_static(BODY.as_bytes()), "XYZ", 8).unwrap_err();
        assert!(matches!(err, Error::BindBodyTooLarge { limit: 8 }));
    }
}
