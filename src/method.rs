//! Route methods.
//!
//! The nine RFC 9110 methods a route can be registered under, plus three
//! registration-only names: `ANY` (expands to [`ANY_METHODS`]) and the
//! `NotFound` / `MethodNotAllowed` sentinels that replace the router's
//! default 404 and 405 handlers.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A method accepted by [`Router::add_handler`](crate::Router::add_handler).
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Method {
    // Canonical order; `Allow` headers list methods in this order.
    Get,
    Post,
    Put,
    Delete,
    Head,
    Patch,
    Options,
    Connect,
    Trace,
    // Registration only ────────────────────────────────────────────────────────
    Any,
    NotFound,
    MethodNotAllowed,
}

/// Methods a route registered under `ANY` answers to.
pub const ANY_METHODS: [Method; 6] = [
    Method::Get,
    Method::Post,
    Method::Put,
    Method::Delete,
    Method::Head,
    Method::Patch,
];

/// Every concrete method, in canonical order.
pub const ALL_METHODS: [Method; 9] = [
    Method::Get,
    Method::Post,
    Method::Put,
    Method::Delete,
    Method::Head,
    Method::Patch,
    Method::Options,
    Method::Connect,
    Method::Trace,
];

impl Method {
    /// Returns the registration name (e.g. `"GET"`, `"ANY"`, `"NotFound"`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect          => "CONNECT",
            Self::Delete           => "DELETE",
            Self::Get              => "GET",
            Self::Head             => "HEAD",
            Self::Options          => "OPTIONS",
            Self::Patch            => "PATCH",
            Self::Post             => "POST",
            Self::Put              => "PUT",
            Self::Trace            => "TRACE",
            Self::Any              => "ANY",
            Self::NotFound         => "NotFound",
            Self::MethodNotAllowed => "MethodNotAllowed",
        }
    }

    /// Maps a request method; extension methods have no route and yield `None`.
    pub fn from_http(method: &http::Method) -> Option<Self> {
        match *method {
            http::Method::CONNECT => Some(Self::Connect),
            http::Method::DELETE  => Some(Self::Delete),
            http::Method::GET     => Some(Self::Get),
            http::Method::HEAD    => Some(Self::Head),
            http::Method::OPTIONS => Some(Self::Options),
            http::Method::PATCH   => Some(Self::Patch),
            http::Method::POST    => Some(Self::Post),
            http::Method::PUT     => Some(Self::Put),
            http::Method::TRACE   => Some(Self::Trace),
            _                     => None,
        }
    }

    /// True for the nine methods a request can carry.
    pub fn is_concrete(self) -> bool {
        !matches!(self, Self::Any | Self::NotFound | Self::MethodNotAllowed)
    }
}

/// Parses a registration name. Request methods are case-sensitive per
/// RFC 9110 §9.1; `ANY` and the sentinels also accept their status codes.
impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONNECT"                   => Ok(Self::Connect),
            "DELETE"                    => Ok(Self::Delete),
            "GET"                       => Ok(Self::Get),
            "HEAD"                      => Ok(Self::Head),
            "OPTIONS"                   => Ok(Self::Options),
            "PATCH"                     => Ok(Self::Patch),
            "POST"                      => Ok(Self::Post),
            "PUT"                       => Ok(Self::Put),
            "TRACE"                     => Ok(Self::Trace),
            "ANY"                       => Ok(Self::Any),
            "NotFound" | "404"          => Ok(Self::NotFound),
            "MethodNotAllowed" | "405"  => Ok(Self::MethodNotAllowed),
            other                       => Err(Error::RouteMethodInvalid(other.to_owned())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_registration_names() {
        assert_eq!("GET".parse::<Method>().unwrap(), Method::Get);
        assert_eq!("404".parse::<Method>().unwrap(), Method::NotFound);
        assert_eq!("MethodNotAllowed".parse::<Method>().unwrap(), Method::MethodNotAllowed);
        assert!(matches!("get".parse::<Method>(), Err(Error::RouteMethodInvalid(_))));
    }

    #[test]
    fn http_mapping() {
        assert_eq!(Method::from_http(&http::Method::PATCH), Some(Method::Patch));
        assert_eq!(Method::from_http(&http::Method::from_bytes(b"PURGE").unwrap()), None);
        assert!(ANY_METHODS.iter().all(|m| m.is_concrete()));
    }
}
