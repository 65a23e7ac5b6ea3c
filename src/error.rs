//! Unified error type.
//!
//! Every fallible operation in the crate returns [`Error`]. Each variant is
//! one error kind and knows the HTTP status it maps to, so a handler can hand
//! any error to [`Context::fatal`](crate::Context::fatal) and get the right
//! response without matching on it.

use std::convert::Infallible;

use http::StatusCode;
use thiserror::Error;

use crate::config::ConfigError;
use crate::funcs::FuncError;
use crate::value::ValueError;

/// A boxed error from user code or a third-party crate.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The error type returned by eudore's fallible operations.
#[derive(Debug, Error)]
pub enum Error {
    // ── Registration ──────────────────────────────────────────────────────────
    #[error("route `{path}`: {message}")]
    RouteSyntax { path: String, message: String },

    #[error("route method `{0}` is not supported")]
    RouteMethodInvalid(String),

    #[error("route `{method} {path}` is already registered")]
    RouteConflict { method: String, path: String },

    // ── Bind ──────────────────────────────────────────────────────────────────
    #[error("bind: unsupported content type `{0}`")]
    BindUnsupportedContentType(String),

    #[error("bind: request body exceeds {limit} bytes")]
    BindBodyTooLarge { limit: usize },

    #[error("bind: {0}")]
    BindField(#[from] ValueError),

    #[error("bind: {0}")]
    BindDecode(String),

    // ── Render ────────────────────────────────────────────────────────────────
    #[error("render: no renderer for accept `{0}`")]
    RenderNotAcceptable(String),

    #[error("render: template `{0}` is not registered")]
    RenderTemplateMissing(String),

    #[error("render: {0}")]
    Render(String),

    // ── Validate ──────────────────────────────────────────────────────────────
    #[error("validate {package}.{type_name}.{field} rule {rule} fail")]
    Validate {
        package: String,
        type_name: String,
        field: String,
        rule: String,
    },

    #[error(transparent)]
    Func(#[from] FuncError),

    // ── Server ────────────────────────────────────────────────────────────────
    #[error("listen {addr}: {source}")]
    ServerListen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tls: {0}")]
    Tls(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    // ── Handler ───────────────────────────────────────────────────────────────
    /// An error tagged with an explicit response status and business code.
    #[error("{source}")]
    Status {
        status: StatusCode,
        code: i32,
        #[source]
        source: Box<Error>,
    },

    #[error("{0}")]
    Message(String),

    #[error("{0}")]
    Handler(BoxError),
}

impl Error {
    /// Plain message error; maps to 500.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// Wraps any foreign error as a handler error.
    pub fn handler(err: impl Into<BoxError>) -> Self {
        Self::Handler(err.into())
    }

    /// Tags the error with a response status and a business code.
    pub fn with_status(self, status: StatusCode, code: i32) -> Self {
        Self::Status { status, code, source: Box::new(self) }
    }

    /// The HTTP status this error is reported with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BindUnsupportedContentType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::BindBodyTooLarge { .. }       => StatusCode::PAYLOAD_TOO_LARGE,
            Self::BindField(_)                  => StatusCode::BAD_REQUEST,
            Self::BindDecode(_)                 => StatusCode::BAD_REQUEST,
            Self::Json(_)                       => StatusCode::BAD_REQUEST,
            Self::Validate { .. }               => StatusCode::BAD_REQUEST,
            Self::RenderNotAcceptable(_)        => StatusCode::NOT_ACCEPTABLE,
            Self::Status { status, .. }         => *status,
            _                                   => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The business code attached by [`Error::with_status`], if any.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<Infallible> for Error {
    fn from(e: Infallible) -> Self {
        match e {}
    }
}

impl From<BoxError> for Error {
    fn from(e: BoxError) -> Self {
        match e.downcast::<Error>() {
            Ok(err) => *err,
            Err(other) => Self::Handler(other),
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Self::Message(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Self::Message(s.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(Error::BindBodyTooLarge { limit: 1 }.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            Error::BindUnsupportedContentType("text/csv".into()).status(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(Error::msg("boom").status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn with_status_overrides() {
        let err = Error::msg("denied").with_status(StatusCode::FORBIDDEN, 10001);
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(err.code(), Some(10001));
        assert_eq!(err.to_string(), "denied");
    }

    #[test]
    fn boxed_error_unwraps_crate_error() {
        let boxed: BoxError = Box::new(Error::BindBodyTooLarge { limit: 8 });
        let err: Error = boxed.into();
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
