//! String-coercing deserializer over a [`Value`].
//!
//! Query strings, form fields, path parameters and XML text all arrive as
//! strings. [`Coerce`] lets any `Deserialize` type read such a tree: when the
//! target asks for a number, boolean or duration and finds a string, the
//! string is parsed instead of rejected.

use serde::de::{self, DeserializeOwned, DeserializeSeed, IntoDeserializer, MapAccess, SeqAccess, Visitor};
use serde::Deserializer;
use serde_json::{Map, Value};

use super::ValueError;
use super::time::{parse_bool, parse_duration};

/// Deserializes `T` from `value`, coercing strings to the requested scalars.
pub fn from_value<T: DeserializeOwned>(value: &Value) -> Result<T, ValueError> {
    T::deserialize(Coerce(value))
}

/// A [`Deserializer`] over a borrowed [`Value`] that parses strings on demand.
#[derive(Clone, Copy, Debug)]
pub struct Coerce<'a>(pub &'a Value);

impl<'a> Coerce<'a> {
    fn invalid(&self, expected: &str) -> ValueError {
        ValueError::Decode(format!("expected {expected}, found {}", super::kind_name(self.0)))
    }

    fn parse<T: std::str::FromStr>(&self, expected: &str) -> Result<T, ValueError> {
        match self.0 {
            Value::String(s) => s
                .trim()
                .parse::<T>()
                .map_err(|_| ValueError::Decode(format!("invalid {expected} `{s}`"))),
            Value::Number(n) => n
                .to_string()
                .parse::<T>()
                .map_err(|_| ValueError::Decode(format!("invalid {expected} `{n}`"))),
            Value::Bool(b) => u8::from(*b)
                .to_string()
                .parse::<T>()
                .map_err(|_| self.invalid(expected)),
            _ => Err(self.invalid(expected)),
        }
    }
}

macro_rules! coerce_number {
    ($($method:ident => $ty:ty, $visit:ident;)*) => {
        $(
            fn $method<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Self::Error> {
                visitor.$visit(self.parse::<$ty>(stringify!($ty))?)
            }
        )*
    };
}

impl<'a> Deserializer<'a> for Coerce<'a> {
    type Error = ValueError;

    fn deserialize_any<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.0 {
            Value::Null => visitor.visit_unit(),
            Value::Bool(b) => visitor.visit_bool(*b),
            Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    visitor.visit_u64(u)
                } else if let Some(i) = n.as_i64() {
                    visitor.visit_i64(i)
                } else {
                    visitor.visit_f64(n.as_f64().unwrap_or_default())
                }
            }
            Value::String(s) => visitor.visit_borrowed_str(s),
            Value::Array(items) => visitor.visit_seq(CoerceSeq::new(items.iter())),
            Value::Object(map) => visitor.visit_map(CoerceMap::new(map)),
        }
    }

    fn deserialize_bool<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.0 {
            Value::Bool(b) => visitor.visit_bool(*b),
            Value::String(s) => match parse_bool(s) {
                Some(b) => visitor.visit_bool(b),
                None => Err(ValueError::Decode(format!("invalid bool `{s}`"))),
            },
            Value::Number(n) => visitor.visit_bool(n.as_f64().is_some_and(|f| f != 0.0)),
            _ => Err(self.invalid("bool")),
        }
    }

    coerce_number! {
        deserialize_i8   => i8,   visit_i8;
        deserialize_i16  => i16,  visit_i16;
        deserialize_i32  => i32,  visit_i32;
        deserialize_i64  => i64,  visit_i64;
        deserialize_i128 => i128, visit_i128;
        deserialize_u8   => u8,   visit_u8;
        deserialize_u16  => u16,  visit_u16;
        deserialize_u32  => u32,  visit_u32;
        deserialize_u64  => u64,  visit_u64;
        deserialize_u128 => u128, visit_u128;
        deserialize_f32  => f32,  visit_f32;
        deserialize_f64  => f64,  visit_f64;
    }

    fn deserialize_char<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.deserialize_str(visitor)
    }

    fn deserialize_str<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.0 {
            Value::String(s) => visitor.visit_borrowed_str(s),
            Value::Number(n) => visitor.visit_string(n.to_string()),
            Value::Bool(b) => visitor.visit_string(b.to_string()),
            _ => Err(self.invalid("string")),
        }
    }

    fn deserialize_string<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.deserialize_str(visitor)
    }

    fn deserialize_bytes<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.0 {
            Value::String(s) => visitor.visit_borrowed_bytes(s.as_bytes()),
            _ => self.deserialize_seq(visitor),
        }
    }

    fn deserialize_byte_buf<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.deserialize_bytes(visitor)
    }

    fn deserialize_option<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.0 {
            Value::Null => visitor.visit_none(),
            Value::String(s) if s.is_empty() => visitor.visit_none(),
            _ => visitor.visit_some(self),
        }
    }

    fn deserialize_unit<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V: Visitor<'a>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V: Visitor<'a>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.0 {
            Value::Null => visitor.visit_seq(CoerceSeq::new([].iter())),
            Value::Array(items) => visitor.visit_seq(CoerceSeq::new(items.iter())),
            Value::Object(map) => match indexed(map) {
                Some(items) => visitor.visit_seq(CoerceSeq::new(items.into_iter())),
                None => Err(self.invalid("sequence")),
            },
            // A lone scalar binds as a one-element sequence.
            scalar => visitor.visit_seq(CoerceSeq::new(std::slice::from_ref(scalar).iter())),
        }
    }

    fn deserialize_tuple<V: Visitor<'a>>(self, _len: usize, visitor: V) -> Result<V::Value, Self::Error> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_tuple_struct<V: Visitor<'a>>(
        self,
        _name: &'static str,
        _len: usize,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_map<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.0 {
            Value::Null => visitor.visit_map(CoerceMap::empty()),
            Value::Object(map) => visitor.visit_map(CoerceMap::new(map)),
            _ => Err(self.invalid("map")),
        }
    }

    fn deserialize_struct<V: Visitor<'a>>(
        self,
        name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        // std's Duration visits a `[secs, nanos]` sequence.
        if name == "Duration" && fields == ["secs", "nanos"] {
            let d = match self.0 {
                Value::String(s) => parse_duration(s)
                    .ok_or_else(|| ValueError::Decode(format!("invalid duration `{s}`")))?,
                Value::Number(n) => std::time::Duration::from_nanos(n.as_u64().unwrap_or_default()),
                _ => return self.deserialize_map(visitor),
            };
            let parts = [d.as_secs(), u64::from(d.subsec_nanos())];
            return visitor.visit_seq(de::value::SeqDeserializer::<_, ValueError>::new(parts.into_iter()));
        }
        self.deserialize_map(visitor)
    }

    fn deserialize_enum<V: Visitor<'a>>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        match self.0 {
            Value::String(s) => visitor.visit_enum(s.as_str().into_deserializer()),
            other => other
                .deserialize_enum(name, variants, visitor)
                .map_err(|e| ValueError::Decode(e.to_string())),
        }
    }

    fn deserialize_identifier<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.deserialize_str(visitor)
    }

    fn deserialize_ignored_any<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_unit()
    }
}

/// Objects whose keys are all integers read as sequences ordered by key.
fn indexed(map: &Map<String, Value>) -> Option<Vec<&Value>> {
    let mut items = map
        .iter()
        .map(|(k, v)| k.parse::<usize>().ok().map(|i| (i, v)))
        .collect::<Option<Vec<_>>>()?;
    items.sort_by_key(|(i, _)| *i);
    Some(items.into_iter().map(|(_, v)| v).collect())
}

// ── Access helpers ────────────────────────────────────────────────────────────

struct CoerceSeq<I> {
    iter: I,
}

impl<I> CoerceSeq<I> {
    fn new(iter: I) -> Self {
        Self { iter }
    }
}

impl<'a, I> SeqAccess<'a> for CoerceSeq<I>
where
    I: Iterator<Item = &'a Value>,
{
    type Error = ValueError;

    fn next_element_seed<T: DeserializeSeed<'a>>(&mut self, seed: T) -> Result<Option<T::Value>, Self::Error> {
        match self.iter.next() {
            Some(v) => seed.deserialize(Coerce(v)).map(Some),
            None => Ok(None),
        }
    }
}

struct CoerceMap<'a> {
    iter: Option<serde_json::map::Iter<'a>>,
    value: Option<&'a Value>,
}

impl<'a> CoerceMap<'a> {
    fn new(map: &'a Map<String, Value>) -> Self {
        Self { iter: Some(map.iter()), value: None }
    }

    fn empty() -> Self {
        Self { iter: None, value: None }
    }
}

impl<'a> MapAccess<'a> for CoerceMap<'a> {
    type Error = ValueError;

    fn next_key_seed<K: DeserializeSeed<'a>>(&mut self, seed: K) -> Result<Option<K::Value>, Self::Error> {
        let Some((k, v)) = self.iter.as_mut().and_then(Iterator::next) else {
            return Ok(None);
        };
        self.value = Some(v);
        seed.deserialize(KeyDeserializer(k)).map(Some)
    }

    fn next_value_seed<T: DeserializeSeed<'a>>(&mut self, seed: T) -> Result<T::Value, Self::Error> {
        match self.value.take() {
            Some(v) => seed.deserialize(Coerce(v)),
            None => Err(de::Error::custom("value requested before key")),
        }
    }
}

/// Map keys are strings on the wire but may be numbers or enums in the target.
struct KeyDeserializer<'a>(&'a str);

impl<'a> Deserializer<'a> for KeyDeserializer<'a> {
    type Error = ValueError;

    fn deserialize_any<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_borrowed_str(self.0)
    }

    fn deserialize_enum<V: Visitor<'a>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_enum(self.0.into_deserializer())
    }

    fn deserialize_option<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_some(self)
    }

    fn deserialize_newtype_struct<V: Visitor<'a>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_bool<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match parse_bool(self.0) {
            Some(b) => visitor.visit_bool(b),
            None => Err(ValueError::Decode(format!("invalid bool `{}`", self.0))),
        }
    }

    fn deserialize_i64<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_i64(self.parse()?)
    }

    fn deserialize_i32<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_i32(self.parse()?)
    }

    fn deserialize_u64<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_u64(self.parse()?)
    }

    fn deserialize_u32<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_u32(self.parse()?)
    }

    serde::forward_to_deserialize_any! {
        <W: Visitor<'a>>
        i8 i16 i128 u8 u16 u128 f32 f64 char str string bytes byte_buf unit unit_struct
        seq tuple tuple_struct map struct identifier ignored_any
    }
}

impl KeyDeserializer<'_> {
    fn parse<T: std::str::FromStr>(&self) -> Result<T, ValueError> {
        self.0
            .parse::<T>()
            .map_err(|_| ValueError::Decode(format!("invalid map key `{}`", self.0)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Query {
        page: u32,
        size: Option<i64>,
        debug: bool,
        ratio: f64,
        ids: Vec<u8>,
        timeout: Duration,
        kind: Kind,
    }

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(rename_all = "lowercase")]
    enum Kind {
        Full,
        Short,
    }

    #[test]
    fn strings_coerce_to_scalars() {
        let v = json!({
            "page": "3",
            "size": "",
            "debug": "",
            "ratio": "0.75",
            "ids": {"1": "20", "0": "10"},
            "timeout": "1m30s",
            "kind": "short",
        });
        let q: Query = from_value(&v).unwrap();
        assert_eq!(q, Query {
            page: 3,
            size: None,
            debug: true,
            ratio: 0.75,
            ids: vec![10, 20],
            timeout: Duration::from_secs(90),
            kind: Kind::Short,
        });
    }

    #[test]
    fn scalar_binds_as_single_element_sequence() {
        let v: Vec<String> = from_value(&json!("one")).unwrap();
        assert_eq!(v, vec!["one"]);
    }

    #[test]
    fn numeric_map_keys() {
        let v: HashMap<u32, String> = from_value(&json!({"7": "seven"})).unwrap();
        assert_eq!(v[&7], "seven");
    }

    #[test]
    fn bad_number_reports_value() {
        let err = from_value::<u32>(&json!("x1")).unwrap_err();
        assert!(err.to_string().contains("x1"));
    }
}
