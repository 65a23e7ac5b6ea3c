//! Radix-tree router core.
//!
//! One tree serves every method; each node that ends a route holds a
//! method → route table. Children are tiered and tried in this order, with
//! backtracking into the next candidate when a subtree does not match:
//!
//! ```text
//! consts      sorted by first byte, early exit once past the request byte
//! vparams     `:name|rule`, rule checked against the segment
//! param       `:name`
//! vwildcards  `*name|rule`, rule checked against the remaining path
//! wildcard    `*name`
//! ```
//!
//! Capture names live on the route rather than on the nodes, so `/u/:id` and
//! `/u/:name/x` share one param node.

use std::collections::BTreeMap;
use std::sync::Arc;

use http::Method as HttpMethod;

use crate::error::Error;
use crate::funcs::{Func, FuncCreator, FuncKind};
use crate::handler::HandlerFunc;
use crate::method::{ANY_METHODS, Method};
use crate::params::{PARAM_ALLOW, PARAM_REGISTER, PARAM_ROUTE, Params};

use super::RouterCore;
use super::path::{Segment, split_path};

#[derive(Clone)]
struct RouteEntry {
    path: String,
    names: Vec<String>,
    params: Params,
    handlers: Arc<[HandlerFunc]>,
    from_any: bool,
}

#[derive(Default)]
struct Node {
    path: String,
    rule: Option<String>,
    check: Option<Func>,
    consts: Vec<Node>,
    vparams: Vec<Node>,
    param: Option<Box<Node>>,
    vwildcards: Vec<Node>,
    wildcard: Option<Box<Node>>,
    routes: BTreeMap<Method, RouteEntry>,
}

fn common_prefix(a: &str, b: &str) -> usize {
    let n = a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count();
    // Never split inside a UTF-8 sequence.
    (0..=n).rev().find(|&i| a.is_char_boundary(i)).unwrap_or(0)
}

impl Node {
    fn with_path(path: &str) -> Self {
        Self { path: path.to_owned(), ..Self::default() }
    }

    fn is_empty(&self) -> bool {
        self.routes.is_empty()
            && self.consts.is_empty()
            && self.vparams.is_empty()
            && self.param.is_none()
            && self.vwildcards.is_empty()
            && self.wildcard.is_none()
    }

    fn passes(&self, s: &str) -> bool {
        self.check.as_ref().is_none_or(|f| f.check_str(s))
    }

    // ── Insert ────────────────────────────────────────────────────────────────

    fn first_char(&self) -> char {
        self.path.chars().next().unwrap_or_default()
    }

    fn insert_const(&mut self, text: &str) -> &mut Node {
        let Some(first) = text.chars().next() else {
            return self;
        };
        let idx = match self.consts.iter().position(|c| c.first_char() >= first) {
            Some(i) if self.consts[i].first_char() == first => i,
            Some(i) => {
                self.consts.insert(i, Node::with_path(text));
                return &mut self.consts[i];
            }
            None => {
                self.consts.push(Node::with_path(text));
                let last = self.consts.len() - 1;
                return &mut self.consts[last];
            }
        };

        let child = &mut self.consts[idx];
        let n = common_prefix(&child.path, text);
        if n < child.path.len() {
            let tail = child.path.split_off(n);
            let prefix = std::mem::take(&mut child.path);
            let mut old = std::mem::replace(child, Node::with_path(&prefix));
            old.path = tail;
            child.consts.push(old);
        }
        child.insert_const(&text[n..])
    }

    fn insert_capture(
        list: &mut Vec<Node>,
        rule: &str,
        creator: &dyn FuncCreator,
        route: &str,
    ) -> Result<usize, Error> {
        if let Some(i) = list.iter().position(|n| n.rule.as_deref() == Some(rule)) {
            return Ok(i);
        }
        let check = creator.create(FuncKind::String, rule).map_err(|e| Error::RouteSyntax {
            path: route.to_owned(),
            message: e.to_string(),
        })?;
        list.push(Node { rule: Some(rule.to_owned()), check: Some(check), ..Node::default() });
        Ok(list.len() - 1)
    }

    fn insert(&mut self, segs: &[Segment], creator: &dyn FuncCreator, route: &str) -> Result<&mut Node, Error> {
        let Some((seg, rest)) = segs.split_first() else {
            return Ok(self);
        };
        let next: &mut Node = match seg {
            Segment::Const(text) => self.insert_const(text),
            Segment::Param { rule: None, .. } => self.param.get_or_insert_with(Box::default),
            Segment::Param { rule: Some(rule), .. } => {
                let i = Self::insert_capture(&mut self.vparams, rule, creator, route)?;
                &mut self.vparams[i]
            }
            Segment::Wildcard { rule: None, .. } => self.wildcard.get_or_insert_with(Box::default),
            Segment::Wildcard { rule: Some(rule), .. } => {
                let i = Self::insert_capture(&mut self.vwildcards, rule, creator, route)?;
                &mut self.vwildcards[i]
            }
        };
        next.insert(rest, creator, route)
    }

    // ── Lookup ────────────────────────────────────────────────────────────────

    fn find<'n, 'p>(
        &'n self,
        path: &'p str,
        caps: &mut Vec<&'p str>,
        accept: &dyn Fn(&Node) -> bool,
    ) -> Option<&'n Node> {
        if path.is_empty() && accept(self) {
            return Some(self);
        }

        if let Some(&b) = path.as_bytes().first() {
            for c in &self.consts {
                let first = c.path.as_bytes()[0];
                if first > b {
                    break;
                }
                if first == b && path.starts_with(c.path.as_str()) {
                    if let Some(n) = c.find(&path[c.path.len()..], caps, accept) {
                        return Some(n);
                    }
                }
            }

            let end = path.find('/').unwrap_or(path.len());
            let seg = &path[..end];
            if !seg.is_empty() {
                let params = self.vparams.iter().filter(|p| p.passes(seg)).chain(self.param.as_deref());
                for p in params {
                    caps.push(seg);
                    if let Some(n) = p.find(&path[end..], caps, accept) {
                        return Some(n);
                    }
                    caps.pop();
                }
            }
        }

        let wildcards = self.vwildcards.iter().filter(|w| w.passes(path)).chain(self.wildcard.as_deref());
        for w in wildcards {
            if accept(w) {
                caps.push(path);
                return Some(w);
            }
        }
        None
    }

    // ── Delete ────────────────────────────────────────────────────────────────

    fn locate(&mut self, segs: &[Segment]) -> Option<&mut Node> {
        let Some((seg, rest)) = segs.split_first() else {
            return Some(self);
        };
        let next = match seg {
            Segment::Const(text) => return self.locate_const(text)?.locate(rest),
            Segment::Param { rule: None, .. } => self.param.as_deref_mut()?,
            Segment::Param { rule: Some(r), .. } => {
                self.vparams.iter_mut().find(|n| n.rule.as_deref() == Some(r.as_str()))?
            }
            Segment::Wildcard { rule: None, .. } => self.wildcard.as_deref_mut()?,
            Segment::Wildcard { rule: Some(r), .. } => {
                self.vwildcards.iter_mut().find(|n| n.rule.as_deref() == Some(r.as_str()))?
            }
        };
        next.locate(rest)
    }

    fn locate_const(&mut self, text: &str) -> Option<&mut Node> {
        if text.is_empty() {
            return Some(self);
        }
        let child = self.consts.iter_mut().find(|c| text.starts_with(c.path.as_str()))?;
        let n = child.path.len();
        child.locate_const(&text[n..])
    }

    /// Drops empty children and folds single-child constant chains.
    fn compact(&mut self) {
        for c in &mut self.consts {
            c.compact();
            if c.routes.is_empty()
                && c.consts.len() == 1
                && c.vparams.is_empty()
                && c.param.is_none()
                && c.vwildcards.is_empty()
                && c.wildcard.is_none()
            {
                let mut only = c.consts.remove(0);
                only.path.insert_str(0, &c.path);
                *c = only;
            }
        }
        self.consts.retain(|c| !c.is_empty());
        for v in &mut self.vparams {
            v.compact();
        }
        self.vparams.retain(|v| !v.is_empty());
        for v in &mut self.vwildcards {
            v.compact();
        }
        self.vwildcards.retain(|v| !v.is_empty());
        if let Some(p) = &mut self.param {
            p.compact();
            if p.is_empty() {
                self.param = None;
            }
        }
        if self.wildcard.as_ref().is_some_and(|w| w.is_empty()) {
            self.wildcard = None;
        }
    }

    fn collect(&self, out: &mut Vec<(Method, String)>) {
        for (m, e) in &self.routes {
            out.push((*m, e.path.clone()));
        }
        for c in self.consts.iter().chain(&self.vparams).chain(self.param.as_deref()) {
            c.collect(out);
        }
        for c in self.vwildcards.iter().chain(self.wildcard.as_deref()) {
            c.collect(out);
        }
    }
}

/// The default router core.
pub struct RouterCoreRadix {
    root: Node,
    not_found: Arc<[HandlerFunc]>,
    method_not_allowed: Arc<[HandlerFunc]>,
    creator: Arc<dyn FuncCreator>,
}

impl RouterCoreRadix {
    pub fn new(creator: Arc<dyn FuncCreator>) -> Self {
        Self {
            root: Node::default(),
            not_found: Arc::from(Vec::new()),
            method_not_allowed: Arc::from(Vec::new()),
            creator,
        }
    }

    fn delete(&mut self, method: Method, segs: &[Segment]) {
        if let Some(node) = self.root.locate(segs) {
            if method == Method::Any {
                node.routes.retain(|_, e| !e.from_any);
            } else {
                node.routes.remove(&method);
            }
        }
        self.root.compact();
    }
}

impl RouterCore for RouterCoreRadix {
    fn handle(&mut self, method: Method, path: &str, params: Params, handlers: Vec<HandlerFunc>) -> Result<(), Error> {
        match method {
            Method::NotFound => {
                self.not_found = Arc::from(handlers);
                return Ok(());
            }
            Method::MethodNotAllowed => {
                self.method_not_allowed = Arc::from(handlers);
                return Ok(());
            }
            _ => {}
        }

        let segs = split_path(path)?;
        if params.get(PARAM_REGISTER) == Some("off") {
            self.delete(method, &segs);
            return Ok(());
        }

        let names = segs
            .iter()
            .filter_map(|s| match s {
                Segment::Param { name, .. } | Segment::Wildcard { name, .. } => Some(name.clone()),
                Segment::Const(_) => None,
            })
            .collect();
        let entry = RouteEntry {
            path: path.to_owned(),
            names,
            params,
            handlers: Arc::from(handlers),
            from_any: method == Method::Any,
        };

        let node = self.root.insert(&segs, self.creator.as_ref(), path)?;
        if method == Method::Any {
            for m in ANY_METHODS {
                match node.routes.get(&m) {
                    None => {
                        node.routes.insert(m, entry.clone());
                    }
                    Some(e) if e.from_any => {
                        let err = Error::RouteConflict { method: "ANY".into(), path: path.to_owned() };
                        tracing::warn!(error = %err, "keeping the first ANY registration");
                        break;
                    }
                    Some(_) => {}
                }
            }
        } else {
            node.routes.insert(method, entry);
        }
        Ok(())
    }

    fn find(&self, method: &HttpMethod, _host: &str, path: &str, params: &mut Params) -> Arc<[HandlerFunc]> {
        let mut caps = Vec::new();
        let found = Method::from_http(method).and_then(|m| {
            let node = self.root.find(path, &mut caps, &|n: &Node| n.routes.contains_key(&m))?;
            node.routes.get(&m)
        });
        if let Some(entry) = found {
            params.set(PARAM_ROUTE, "");
            for (k, v) in entry.params.iter() {
                params.set(k, v);
            }
            for (name, val) in entry.names.iter().zip(caps) {
                params.add(name.as_str(), val);
            }
            return Arc::clone(&entry.handlers);
        }

        caps = Vec::new();
        if let Some(node) = self.root.find(path, &mut caps, &|n: &Node| !n.routes.is_empty()) {
            let allow: Vec<&str> = node.routes.keys().map(|m| m.as_str()).collect();
            params.set(PARAM_ALLOW, allow.join(", "));
            return Arc::clone(&self.method_not_allowed);
        }
        Arc::clone(&self.not_found)
    }

    fn routes(&self) -> Vec<(Method, String)> {
        let mut out = Vec::new();
        self.root.collect(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::funcs::FuncCreatorStd;
    use crate::handler::{BoxFuture, ErasedHandler};

    struct Tag(&'static str);

    impl ErasedHandler for Tag {
        fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
            Box::pin(async move { ctx.write_string(self.0) })
        }

        fn name(&self) -> &'static str {
            self.0
        }
    }

    fn h(tag: &'static str) -> Vec<HandlerFunc> {
        vec![Arc::new(Tag(tag))]
    }

    fn core() -> RouterCoreRadix {
        let mut c = RouterCoreRadix::new(Arc::new(FuncCreatorStd::new()));
        c.handle(Method::NotFound, "", Params::new(), h("404")).unwrap();
        c.handle(Method::MethodNotAllowed, "", Params::new(), h("405")).unwrap();
        c
    }

    fn add(c: &mut RouterCoreRadix, m: Method, route: &str, tag: &'static str) {
        let (path, mut params) = super::super::path::split_route(route);
        params.set(PARAM_ROUTE, path);
        c.handle(m, path, params, h(tag)).unwrap();
    }

    fn hit(c: &RouterCoreRadix, m: HttpMethod, path: &str) -> (&'static str, Params) {
        let mut p = Params::new();
        let hs = c.find(&m, "", path, &mut p);
        (hs[0].name(), p)
    }

    #[test]
    fn tier_priority() {
        let mut c = core();
        add(&mut c, Method::Get, "/a/*", "wild");
        add(&mut c, Method::Get, "/a/:x", "param");
        add(&mut c, Method::Get, "/a/:x|num", "vparam");
        add(&mut c, Method::Get, "/a/new", "const");
        add(&mut c, Method::Get, "/a/news", "const2");

        assert_eq!(hit(&c, HttpMethod::GET, "/a/new").0, "const");
        assert_eq!(hit(&c, HttpMethod::GET, "/a/news").0, "const2");
        assert_eq!(hit(&c, HttpMethod::GET, "/a/12").0, "vparam");
        assert_eq!(hit(&c, HttpMethod::GET, "/a/bob").0, "param");
        assert_eq!(hit(&c, HttpMethod::GET, "/a/b/c").0, "wild");
        assert_eq!(hit(&c, HttpMethod::GET, "/b").0, "404");
    }

    #[test]
    fn params_in_segment_order() {
        let mut c = core();
        add(&mut c, Method::Get, "/users/:id|min=1 action=show", "show");
        let (tag, p) = hit(&c, HttpMethod::GET, "/users/42");
        assert_eq!(tag, "show");
        assert_eq!(p.get("route"), Some("/users/:id|min=1"));
        assert_eq!(p.get("action"), Some("show"));
        assert_eq!(p.get("id"), Some("42"));
        assert_eq!(hit(&c, HttpMethod::GET, "/users/0").0, "404");
    }

    #[test]
    fn backtracks_out_of_dead_subtree() {
        let mut c = core();
        add(&mut c, Method::Get, "/f/:a/x", "ax");
        add(&mut c, Method::Get, "/f/*rest", "rest");
        let (tag, p) = hit(&c, HttpMethod::GET, "/f/1/y");
        assert_eq!(tag, "rest");
        assert_eq!(p.get("rest"), Some("1/y"));
        assert!(p.get("a").is_none());
    }

    #[test]
    fn method_not_allowed_lists_allow() {
        let mut c = core();
        add(&mut c, Method::Post, "/x", "post");
        add(&mut c, Method::Get, "/x", "get");
        let (tag, p) = hit(&c, HttpMethod::PUT, "/x");
        assert_eq!(tag, "405");
        assert_eq!(p.get("allow"), Some("GET, POST"));
    }

    #[test]
    fn specific_beats_any_and_any_is_first_wins() {
        let mut c = core();
        add(&mut c, Method::Get, "/m", "get");
        add(&mut c, Method::Any, "/m", "any1");
        add(&mut c, Method::Any, "/m", "any2");
        assert_eq!(hit(&c, HttpMethod::GET, "/m").0, "get");
        assert_eq!(hit(&c, HttpMethod::POST, "/m").0, "any1");
        add(&mut c, Method::Post, "/m", "post");
        assert_eq!(hit(&c, HttpMethod::POST, "/m").0, "post");
    }

    #[test]
    fn register_off_deletes_and_compacts() {
        let mut c = core();
        add(&mut c, Method::Get, "/api/v1/users", "users");
        add(&mut c, Method::Get, "/api/v1/uploads", "uploads");
        add(&mut c, Method::Get, "/api/v1/users register=off", "");
        assert_eq!(hit(&c, HttpMethod::GET, "/api/v1/users").0, "404");
        assert_eq!(hit(&c, HttpMethod::GET, "/api/v1/uploads").0, "uploads");
        assert_eq!(c.root.consts.len(), 1);
        assert_eq!(c.root.consts[0].path, "/api/v1/uploads");
        assert_eq!(c.routes(), [(Method::Get, "/api/v1/uploads".to_owned())]);
    }

    #[test]
    fn bad_rule_is_a_syntax_error() {
        let mut c = core();
        let err = c.handle(Method::Get, "/:id|nosuchrule", Params::new(), h("x")).unwrap_err();
        assert!(matches!(err, Error::RouteSyntax { .. }));
    }
}
