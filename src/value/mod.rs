//! Value path engine.
//!
//! Reads and writes nested values addressed by a dot-separated path such as
//! `user.tags.0` or `items.[]`. The engine works on [`serde_json::Value`]
//! trees: struct fields and map entries are both JSON objects, sequences are
//! arrays. Typed targets go through [`get_field`] / [`set_field`], which
//! serialize the target, operate on the tree and deserialize it back with the
//! string-coercing [`Coerce`] deserializer.
//!
//! | Segment on | `get` | `set` |
//! |---|---|---|
//! | object | key lookup, absent is an error | key lookup, absent keys are created |
//! | array | signed index, negative counts from the end | index up to the length (which appends); `[]` appends |
//! | null | `nil-input` | becomes an empty object |
//! | scalar | `field-not-found` | `field-not-found` |
//!
//! Owned trees cannot contain cycles, so no visited-pointer bookkeeping is
//! needed while walking.

mod coerce;
mod time;

use serde::Serialize;
use serde::de::DeserializeOwned;
pub use serde_json::{Map, Value};
use thiserror::Error;

pub use coerce::{Coerce, from_value};
pub use time::{
    deserialize_duration, deserialize_time, format_duration, parse_bool, parse_duration,
    parse_time, serialize_duration, set_time_layouts, time_layouts,
};

/// Failure taxonomy of the path engine.
///
/// Every variant carries the path prefix that failed so a caller can report
/// `items.3.name` rather than just `name`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValueError {
    #[error("value is null at `{path}`")]
    NilInput { path: String },

    #[error("field `{path}` not found in {kind}")]
    FieldNotFound { path: String, kind: &'static str },

    #[error("field `{path}` is private")]
    FieldPrivate { path: String },

    #[error("index `{segment}` at `{path}` is not an integer")]
    IndexUnparseable { path: String, segment: String },

    #[error("value `{path}` is absent")]
    ValueAbsent { path: String },

    #[error("index {index} at `{path}` out of range for length {len}")]
    IndexOutOfRange { path: String, index: i64, len: usize },

    #[error("cannot set {kind} at `{path}` from `{value}`")]
    TypeIncompatible { path: String, kind: &'static str, value: String },

    #[error("decode: {0}")]
    Decode(String),
}

impl serde::de::Error for ValueError {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        Self::Decode(msg.to_string())
    }
}

/// Traversal options.
#[derive(Clone, Debug, Default)]
pub struct PathOptions {
    /// Allow keys beginning with `_`.
    pub allow_private: bool,
    /// When an exact key is missing, retry with an ASCII case-insensitive match.
    pub fold_case: bool,
}

impl PathOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_private(mut self, allow: bool) -> Self {
        self.allow_private = allow;
        self
    }

    pub fn fold_case(mut self, fold: bool) -> Self {
        self.fold_case = fold;
        self
    }
}

/// Name of a value's kind, used in error messages.
pub fn kind_name(v: &Value) -> &'static str {
    match v {
        Value::Null      => "null",
        Value::Bool(_)   => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_)  => "array",
        Value::Object(_) => "object",
    }
}

fn prefix(segments: &[&str], i: usize) -> String {
    segments[..=i].join(".")
}

fn split(path: &str) -> Vec<&str> {
    if path.is_empty() {
        Vec::new()
    } else {
        path.split('.').collect()
    }
}

fn find_key<'a>(map: &'a Map<String, Value>, key: &str, opts: &PathOptions) -> Option<&'a str> {
    if let Some((k, _)) = map.get_key_value(key) {
        return Some(k.as_str());
    }
    if opts.fold_case {
        return map.keys().find(|k| k.eq_ignore_ascii_case(key)).map(String::as_str);
    }
    None
}

fn check_private(key: &str, opts: &PathOptions, path: impl FnOnce() -> String) -> Result<(), ValueError> {
    if !opts.allow_private && key.starts_with('_') {
        return Err(ValueError::FieldPrivate { path: path() });
    }
    Ok(())
}

fn parse_index(segment: &str, path: impl FnOnce() -> String) -> Result<i64, ValueError> {
    segment.parse::<i64>().map_err(|_| ValueError::IndexUnparseable {
        path: path(),
        segment: segment.to_owned(),
    })
}

// ── get ──────────────────────────────────────────────────────────────────────

/// Returns the value at `path` inside `root`. An empty path returns `root`.
pub fn get<'a>(root: &'a Value, path: &str, opts: &PathOptions) -> Result<&'a Value, ValueError> {
    let segments = split(path);
    let mut cur = root;
    for (i, seg) in segments.iter().enumerate() {
        cur = match cur {
            Value::Null => return Err(ValueError::NilInput { path: prefix(&segments, i) }),
            Value::Object(map) => {
                check_private(seg, opts, || prefix(&segments, i))?;
                let key = find_key(map, seg, opts)
                    .ok_or_else(|| ValueError::ValueAbsent { path: prefix(&segments, i) })?;
                &map[key]
            }
            Value::Array(items) => {
                let index = parse_index(seg, || prefix(&segments, i))?;
                let len = items.len();
                let pos = if index < 0 { len as i64 + index } else { index };
                if pos < 0 || pos as usize >= len {
                    return Err(ValueError::IndexOutOfRange { path: prefix(&segments, i), index, len });
                }
                &items[pos as usize]
            }
            other => {
                return Err(ValueError::FieldNotFound {
                    path: prefix(&segments, i),
                    kind: kind_name(other),
                });
            }
        };
    }
    Ok(cur)
}

// ── set ──────────────────────────────────────────────────────────────────────

/// Stores `value` at `path`, creating intermediate objects and appending to arrays.
pub fn set(root: &mut Value, path: &str, value: Value, opts: &PathOptions) -> Result<(), ValueError> {
    let slot = slot(root, path, opts)?;
    *slot = value;
    Ok(())
}

/// Stores a raw string at `path`, coerced to the kind already present there.
///
/// Null and string slots take the string as is; booleans and numbers parse it;
/// arrays receive it as a new element coerced like their last element.
pub fn set_str(root: &mut Value, path: &str, raw: &str, opts: &PathOptions) -> Result<(), ValueError> {
    let slot = slot(root, path, opts)?;
    match slot {
        Value::Array(items) => {
            let elem = match items.last() {
                Some(last) => coerce_like(last, raw, path)?,
                None => Value::String(raw.to_owned()),
            };
            items.push(elem);
        }
        other => *other = coerce_like(other, raw, path)?,
    }
    Ok(())
}

/// Converts `raw` to the same kind as `like`.
pub fn coerce_like(like: &Value, raw: &str, path: &str) -> Result<Value, ValueError> {
    let incompatible = || ValueError::TypeIncompatible {
        path: path.to_owned(),
        kind: kind_name(like),
        value: raw.to_owned(),
    };
    match like {
        Value::Null | Value::String(_) => Ok(Value::String(raw.to_owned())),
        Value::Bool(_) => parse_bool(raw).map(Value::Bool).ok_or_else(incompatible),
        Value::Number(n) => {
            let raw = raw.trim();
            if n.is_u64() || n.is_i64() {
                raw.parse::<u64>()
                    .map(Value::from)
                    .or_else(|_| raw.parse::<i64>().map(Value::from))
                    .map_err(|_| incompatible())
            } else {
                raw.parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(incompatible)
            }
        }
        Value::Array(_) | Value::Object(_) => Err(incompatible()),
    }
}

fn slot<'a>(root: &'a mut Value, path: &str, opts: &PathOptions) -> Result<&'a mut Value, ValueError> {
    let segments = split(path);
    let mut cur = root;
    for (i, seg) in segments.iter().enumerate() {
        if cur.is_null() {
            *cur = if *seg == "[]" { Value::Array(Vec::new()) } else { Value::Object(Map::new()) };
        }
        cur = match cur {
            Value::Object(map) => {
                check_private(seg, opts, || prefix(&segments, i))?;
                let key = find_key(map, seg, opts).unwrap_or(*seg).to_owned();
                map.entry(key).or_insert(Value::Null)
            }
            Value::Array(items) => {
                if *seg == "[]" {
                    items.push(Value::Null);
                    let last = items.len() - 1;
                    &mut items[last]
                } else {
                    let index = parse_index(seg, || prefix(&segments, i))?;
                    let len = items.len();
                    let pos = if index < 0 { len as i64 + index } else { index };
                    if pos < 0 {
                        return Err(ValueError::IndexOutOfRange { path: prefix(&segments, i), index, len });
                    }
                    let pos = pos as usize;
                    if pos > len {
                        return Err(ValueError::IndexOutOfRange { path: prefix(&segments, i), index, len });
                    }
                    if pos == len {
                        items.push(Value::Null);
                    }
                    &mut items[pos]
                }
            }
            other => {
                return Err(ValueError::FieldNotFound {
                    path: prefix(&segments, i),
                    kind: kind_name(other),
                });
            }
        };
    }
    Ok(cur)
}

// ── Typed targets ─────────────────────────────────────────────────────────────

/// Reads `path` out of any serializable value.
pub fn get_field<T: Serialize>(target: &T, path: &str, opts: &PathOptions) -> Result<Value, crate::Error> {
    let tree = serde_json::to_value(target)?;
    Ok(get(&tree, path, opts)?.clone())
}

/// Writes a raw string into `path` of a typed value.
///
/// The target is serialized, the string stored with [`set_str`], and the tree
/// decoded back through [`Coerce`], so `"42"` lands in a `u32` field as `42`.
pub fn set_field<T>(target: &mut T, path: &str, raw: &str, opts: &PathOptions) -> Result<(), crate::Error>
where
    T: Serialize + DeserializeOwned,
{
    let mut tree = serde_json::to_value(&*target)?;
    set_str(&mut tree, path, raw, opts)?;
    *target = from_value(&tree)?;
    Ok(())
}
