//! Ordered parameter bag.
//!
//! Route parameters are stored as two parallel vectors instead of a map: bags
//! are small, insertion order is observable (captures appear in segment
//! order) and duplicate keys are legal. [`Params::get`] returns the first
//! match; [`Params::set`] overwrites the first match or appends.

use std::fmt;

use serde::ser::{Serialize, SerializeMap, Serializer};

pub const PARAM_ROUTE: &str = "route";
pub const PARAM_HOST: &str = "host";
pub const PARAM_TEMPLATE: &str = "template";
pub const PARAM_REGISTER: &str = "register";
pub const PARAM_ALLOW: &str = "allow";

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Params {
    keys: Vec<String>,
    vals: Vec<String>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self { keys: Vec::with_capacity(n), vals: Vec::with_capacity(n) }
    }

    /// Parses the `key=value` pairs trailing a route, e.g. the
    /// `action=show host=*.a.com` in `/users/:id action=show host=*.a.com`.
    /// A bare word with no `=` is stored with an empty value.
    pub fn parse(pairs: &str) -> Self {
        let mut p = Self::new();
        for pair in pairs.split_whitespace() {
            match pair.split_once('=') {
                Some((k, v)) => p.add(k, v),
                None => p.add(pair, ""),
            }
        }
        p
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.keys.iter().position(|k| k == key).map(|i| self.vals[i].as_str())
    }

    /// All values for `key`, in insertion order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.iter().filter(move |(k, _)| *k == key).map(|(_, v)| v)
    }

    pub fn add(&mut self, key: impl Into<String>, val: impl Into<String>) {
        self.keys.push(key.into());
        self.vals.push(val.into());
    }

    /// Overwrites the first `key`, or appends it.
    pub fn set(&mut self, key: &str, val: impl Into<String>) {
        match self.keys.iter().position(|k| k == key) {
            Some(i) => self.vals[i] = val.into(),
            None => self.add(key, val),
        }
    }

    /// Removes every entry for `key`.
    pub fn del(&mut self, key: &str) {
        let mut i = 0;
        while i < self.keys.len() {
            if self.keys[i] == key {
                self.keys.remove(i);
                self.vals.remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// Sets every pair of `other` onto `self`.
    pub fn merge(&mut self, other: &Params) {
        for (k, v) in other.iter() {
            self.set(k, v);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.keys.iter().map(String::as_str).zip(self.vals.iter().map(String::as_str))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Empties the bag keeping its capacity.
    pub fn clear(&mut self) {
        self.keys.clear();
        self.vals.clear();
    }
}

/// Renders as `k1=v1 k2=v2`, the same form [`Params::parse`] reads.
impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

impl Serialize for Params {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut map = s.serialize_map(Some(self.len()))?;
        for (k, v) in self.iter() {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_match_semantics() {
        let mut p = Params::parse("route=/a action=show action=edit");
        assert_eq!(p.get("action"), Some("show"));
        assert_eq!(p.get_all("action").collect::<Vec<_>>(), ["show", "edit"]);
        p.set("action", "list");
        assert_eq!(p.to_string(), "route=/a action=list action=edit");
        p.set("id", "7");
        assert_eq!(p.get("id"), Some("7"));
        p.del("action");
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn clear_keeps_capacity() {
        let mut p = Params::with_capacity(8);
        p.add("a", "1");
        p.clear();
        assert!(p.is_empty());
        assert!(p.keys.capacity() >= 8);
    }
}
