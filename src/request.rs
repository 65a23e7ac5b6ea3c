//! Request-side helpers: ordered query/form values, cookies and the remote
//! address.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use chrono::{DateTime, Utc};
use http::HeaderMap;
use http::header::COOKIE;
use serde_json::{Map, Value};

/// An ordered multimap of form or query values.
///
/// Keys keep the order of their first appearance; repeated keys accumulate
/// their values in insertion order.
#[derive(Clone, Debug, Default)]
pub struct Values {
    entries: Vec<(String, Vec<String>)>,
    index: HashMap<String, usize>,
}

impl PartialEq for Values {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses an `application/x-www-form-urlencoded` string.
    pub fn parse(raw: &str) -> Self {
        let mut v = Self::new();
        v.extend_encoded(raw.as_bytes());
        v
    }

    /// Appends every pair of a url-encoded byte string.
    pub fn extend_encoded(&mut self, raw: &[u8]) {
        for (k, val) in url::form_urlencoded::parse(raw) {
            self.add(k.into_owned(), val.into_owned());
        }
    }

    pub fn add(&mut self, key: String, val: String) {
        match self.index.get(&key) {
            Some(&pos) => self.entries[pos].1.push(val),
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, vec![val]));
            }
        }
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key).first().map(String::as_str)
    }

    pub fn get_all(&self, key: &str) -> &[String] {
        self.index
            .get(key)
            .map(|&pos| self.entries[pos].1.as_slice())
            .unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flat document view: single values as strings, repeated keys as arrays.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        for (k, vals) in self.iter() {
            let v = match vals {
                [one] => Value::String(one.clone()),
                many => Value::Array(many.iter().cloned().map(Value::String).collect()),
            };
            map.insert(k.to_owned(), v);
        }
        Value::Object(map)
    }
}

// ── Cookies ───────────────────────────────────────────────────────────────────

/// A request cookie.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

/// Parses every `Cookie` header. Malformed pairs are skipped.
pub fn parse_cookies(headers: &HeaderMap) -> Vec<Cookie> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|line| line.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some(Cookie { name: name.to_owned(), value: value.trim().trim_matches('"').to_owned() })
        })
        .collect()
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

/// Builder for a `Set-Cookie` header value.
///
/// ```rust
/// use std::time::Duration;
/// use eudore::SetCookie;
///
/// let c = SetCookie::new("sid", "abc").path("/").max_age(Duration::from_secs(60)).http_only(true);
/// assert_eq!(c.to_string(), "sid=abc; Path=/; Max-Age=60; HttpOnly");
/// ```
#[derive(Clone, Debug, Default)]
pub struct SetCookie {
    name: String,
    value: String,
    path: Option<String>,
    domain: Option<String>,
    expires: Option<DateTime<Utc>>,
    max_age: Option<Duration>,
    secure: bool,
    http_only: bool,
    same_site: Option<SameSite>,
}

impl SetCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into(), ..Self::default() }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn expires(mut self, at: DateTime<Utc>) -> Self {
        self.expires = Some(at);
        self
    }

    pub fn max_age(mut self, age: Duration) -> Self {
        self.max_age = Some(age);
        self
    }

    pub fn secure(mut self, on: bool) -> Self {
        self.secure = on;
        self
    }

    pub fn http_only(mut self, on: bool) -> Self {
        self.http_only = on;
        self
    }

    pub fn same_site(mut self, mode: SameSite) -> Self {
        self.same_site = Some(mode);
        self
    }
}

impl fmt::Display for SetCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)?;
        if let Some(p) = &self.path {
            write!(f, "; Path={p}")?;
        }
        if let Some(d) = &self.domain {
            write!(f, "; Domain={d}")?;
        }
        if let Some(at) = &self.expires {
            write!(f, "; Expires={}", at.format("%a, %d %b %Y %H:%M:%S GMT"))?;
        }
        if let Some(age) = self.max_age {
            write!(f, "; Max-Age={}", age.as_secs())?;
        }
        if self.secure {
            f.write_str("; Secure")?;
        }
        if self.http_only {
            f.write_str("; HttpOnly")?;
        }
        match self.same_site {
            Some(SameSite::Strict) => f.write_str("; SameSite=Strict")?,
            Some(SameSite::Lax)    => f.write_str("; SameSite=Lax")?,
            Some(SameSite::None)   => f.write_str("; SameSite=None")?,
            None => {}
        }
        Ok(())
    }
}

// ── Remote address ────────────────────────────────────────────────────────────

/// The client address: the first `X-Forwarded-For` entry, then `X-Real-IP`,
/// then the socket peer.
pub fn real_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse().ok());
    forwarded
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
        })
        .or(peer.map(|p| p.ip()))
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;
    use serde_json::json;

    use super::*;

    #[test]
    fn query_order_and_accumulation() {
        let v = Values::parse("b=2&a=1&b=3&c=%E4%BD%A0");
        let keys: Vec<_> = v.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["b", "a", "c"]);
        assert_eq!(v.get_all("b"), ["2", "3"]);
        assert_eq!(v.get("c"), Some("你"));
        assert_eq!(v.to_value(), json!({"b": ["2", "3"], "a": "1", "c": "你"}));
    }

    #[test]
    fn many_distinct_keys_keep_order() {
        let raw: String = (0..20_000).map(|i| format!("k{i}=v{i}&")).collect();
        let v = Values::parse(&raw);
        assert_eq!(v.len(), 20_000);
        assert_eq!(v.iter().next().map(|(k, _)| k), Some("k0"));
        assert_eq!(v.iter().last().map(|(k, _)| k), Some("k19999"));
        assert_eq!(v.get("k12345"), Some("v12345"));
    }

    #[test]
    fn cookie_header() {
        let mut h = HeaderMap::new();
        h.append(COOKIE, HeaderValue::from_static("a=1; b=\"two\""));
        h.append(COOKIE, HeaderValue::from_static("c=3; broken"));
        let names: Vec<_> = parse_cookies(&h).into_iter().map(|c| (c.name, c.value)).collect();
        assert_eq!(names, [("a".into(), "1".into()), ("b".into(), "two".into()), ("c".into(), "3".into())]);
    }

    #[test]
    fn forwarded_for_wins() {
        let mut h = HeaderMap::new();
        h.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1, 10.0.0.2"));
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(real_ip(&h, Some(peer)), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(real_ip(&HeaderMap::new(), Some(peer)), Some(peer.ip()));
    }
}
