//! Route string syntax.
//!
//! ```text
//! /users/:id|min=1/*rest  action=show host=*.example.com
//! └──────── path ───────┘ └─────────── params ──────────┘
//! ```
//!
//! `:` and `*` open a capture only at the start of a segment; anywhere else
//! they are literal. A `|` after a capture name starts its rule, which runs to
//! the next `/` unless wrapped in braces (`:id|{regexp=^\d{1,3}/\d+$}`). A
//! rule written as `^…$` is shorthand for `regexp=^…$`.

use crate::error::Error;
use crate::params::Params;

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Segment {
    Const(String),
    Param { name: String, rule: Option<String> },
    Wildcard { name: String, rule: Option<String> },
}

/// Splits a route into its path and trailing `key=value` params. Whitespace
/// inside braces belongs to the path.
pub(crate) fn split_route(route: &str) -> (&str, Params) {
    let route = route.trim_start();
    let mut depth = 0i32;
    for (i, c) in route.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => depth -= 1,
            c if c.is_whitespace() && depth <= 0 => return (&route[..i], Params::parse(&route[i..])),
            _ => {}
        }
    }
    (route, Params::new())
}

fn syntax(path: &str, message: impl Into<String>) -> Error {
    Error::RouteSyntax { path: path.to_owned(), message: message.into() }
}

fn normalize_rule(rule: String) -> String {
    if rule.starts_with('^') && rule.ends_with('$') {
        format!("regexp={rule}")
    } else {
        rule
    }
}

/// Splits a path into constant runs and captures.
pub(crate) fn split_path(path: &str) -> Result<Vec<Segment>, Error> {
    let bytes = path.as_bytes();
    let mut out = Vec::new();
    let mut text = String::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let at_start = i == 0 || bytes[i - 1] == b'/';
        if !(at_start && (c == b':' || c == b'*')) {
            let next = path[i..].char_indices().nth(1).map_or(path.len(), |(n, _)| i + n);
            text.push_str(&path[i..next]);
            i = next;
            continue;
        }

        if !text.is_empty() {
            out.push(Segment::Const(std::mem::take(&mut text)));
        }
        i += 1;
        let name_end = path[i..].find(['/', '|']).map_or(path.len(), |n| i + n);
        let name = &path[i..name_end];
        i = name_end;

        let mut rule = None;
        if bytes.get(i) == Some(&b'|') {
            i += 1;
            let raw = if bytes.get(i) == Some(&b'{') {
                let mut depth = 0;
                let close = path[i..]
                    .char_indices()
                    .find(|&(_, c)| {
                        match c {
                            '{' => depth += 1,
                            '}' => depth -= 1,
                            _ => {}
                        }
                        depth == 0
                    })
                    .map(|(n, _)| i + n)
                    .ok_or_else(|| syntax(path, "unclosed `{` in rule"))?;
                let raw = &path[i + 1..close];
                i = close + 1;
                raw
            } else {
                let end = path[i..].find('/').map_or(path.len(), |n| i + n);
                let raw = &path[i..end];
                i = end;
                raw
            };
            if raw.is_empty() {
                return Err(syntax(path, "empty rule"));
            }
            rule = Some(normalize_rule(raw.to_owned()));
        }

        if c == b':' {
            if name.is_empty() {
                return Err(syntax(path, "parameter without a name"));
            }
            out.push(Segment::Param { name: name.to_owned(), rule });
        } else {
            if i < bytes.len() {
                return Err(syntax(path, "wildcard must be the last segment"));
            }
            let name = if name.is_empty() { "*" } else { name };
            out.push(Segment::Wildcard { name: name.to_owned(), rule });
        }
    }
    if !text.is_empty() {
        out.push(Segment::Const(text));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::Segment::*;
    use super::*;

    fn param(name: &str, rule: Option<&str>) -> Segment {
        Param { name: name.into(), rule: rule.map(Into::into) }
    }

    #[test]
    fn route_and_params() {
        let (path, params) = split_route("/users/:id|min=1 action=show");
        assert_eq!(path, "/users/:id|min=1");
        assert_eq!(params.get("action"), Some("show"));

        let (path, params) = split_route("/a/:x|{regexp=^a b$} k=v");
        assert_eq!(path, "/a/:x|{regexp=^a b$}");
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn segments() {
        assert_eq!(
            split_path("/users/:id|min=1/files/*").unwrap(),
            [
                Const("/users/".into()),
                param("id", Some("min=1")),
                Const("/files/".into()),
                Wildcard { name: "*".into(), rule: None },
            ]
        );
    }

    #[test]
    fn special_chars_mid_segment_are_literal() {
        assert_eq!(split_path("/a:b/c*d").unwrap(), [Const("/a:b/c*d".into())]);
    }

    #[test]
    fn braces_and_anchored_rules() {
        assert_eq!(
            split_path("/:ip|{^\\d+/\\d+$}/x").unwrap(),
            [Const("/".into()), param("ip", Some("regexp=^\\d+/\\d+$")), Const("/x".into())]
        );
    }

    #[test]
    fn syntax_errors() {
        assert!(split_path("/*rest/more").is_err());
        assert!(split_path("/:/x").is_err());
        assert!(split_path("/:id|{min=1").is_err());
        assert!(split_path("/:id|/x").is_err());
    }
}
