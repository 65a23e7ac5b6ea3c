//! Host-aware router core.
//!
//! Routes carrying `host=<patterns>` are stored in the inner core under the
//! synthetic path `{pattern}/path`, one copy per comma-separated pattern. A
//! request whose `Host` matches a registered pattern is looked up under that
//! prefix; any other request uses its plain path.
//!
//! In a pattern `*` matches one or more characters other than `.` and `:`.
//! Literal bytes are tried before `*` at every position, so the pattern with
//! the longest literal prefix wins.

use std::sync::Arc;

use http::Method as HttpMethod;

use crate::error::Error;
use crate::handler::HandlerFunc;
use crate::method::Method;
use crate::params::{PARAM_HOST, Params};

use super::RouterCore;

#[derive(Default)]
struct HostNode {
    byte: u8,
    children: Vec<HostNode>,
    pattern: Option<String>,
}

impl HostNode {
    fn insert(&mut self, pattern: &str) {
        let mut node = self;
        for b in pattern.bytes() {
            let i = match node.children.iter().position(|c| c.byte == b) {
                Some(i) => i,
                None => {
                    node.children.push(HostNode { byte: b, ..HostNode::default() });
                    node.children.len() - 1
                }
            };
            node = &mut node.children[i];
        }
        node.pattern.get_or_insert_with(|| pattern.to_owned());
    }

    fn find(&self, host: &[u8]) -> Option<&str> {
        let Some(&b) = host.first() else {
            return self.pattern.as_deref();
        };
        for c in self.children.iter().filter(|c| c.byte == b && c.byte != b'*') {
            if let Some(p) = c.find(&host[1..]) {
                return Some(p);
            }
        }
        let star = self.children.iter().find(|c| c.byte == b'*')?;
        let run = host.iter().take_while(|&&c| c != b'.' && c != b':').count();
        (1..=run).rev().find_map(|n| star.find(&host[n..]))
    }
}

/// Wraps another core and adds host routing.
pub struct RouterCoreHost {
    inner: Box<dyn RouterCore>,
    hosts: HostNode,
}

impl RouterCoreHost {
    pub fn new(inner: Box<dyn RouterCore>) -> Self {
        Self { inner, hosts: HostNode::default() }
    }

    fn lookup(&self, host: &str) -> Option<&str> {
        let host = host.to_ascii_lowercase();
        self.hosts.find(host.as_bytes()).or_else(|| {
            let (bare, _) = host.rsplit_once(':')?;
            self.hosts.find(bare.as_bytes())
        })
    }
}

impl RouterCore for RouterCoreHost {
    fn handle(&mut self, method: Method, path: &str, params: Params, handlers: Vec<HandlerFunc>) -> Result<(), Error> {
        let Some(hosts) = params.get(PARAM_HOST).filter(|h| !h.is_empty()).map(str::to_owned) else {
            return self.inner.handle(method, path, params, handlers);
        };
        for pattern in hosts.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let pattern = pattern.to_ascii_lowercase();
            self.hosts.insert(&pattern);
            self.inner
                .handle(method, &format!("{{{pattern}}}{path}"), params.clone(), handlers.clone())?;
        }
        Ok(())
    }

    fn find(&self, method: &HttpMethod, host: &str, path: &str, params: &mut Params) -> Arc<[HandlerFunc]> {
        match self.lookup(host) {
            Some(pattern) => self.inner.find(method, host, &format!("{{{pattern}}}{path}"), params),
            None => self.inner.find(method, host, path, params),
        }
    }

    fn routes(&self) -> Vec<(Method, String)> {
        self.inner.routes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trie(patterns: &[&str]) -> HostNode {
        let mut t = HostNode::default();
        for p in patterns {
            t.insert(p);
        }
        t
    }

    fn find<'a>(t: &'a HostNode, host: &str) -> Option<&'a str> {
        t.find(host.as_bytes())
    }

    #[test]
    fn wildcard_stops_at_dots() {
        let t = trie(&["*.a.com"]);
        assert_eq!(find(&t, "x.a.com"), Some("*.a.com"));
        assert_eq!(find(&t, "y.x.a.com"), None);
        assert_eq!(find(&t, "a.com"), None);
    }

    #[test]
    fn literal_prefix_wins() {
        let t = trie(&["*.a.com", "www.a.com", "*.*.a.com"]);
        assert_eq!(find(&t, "www.a.com"), Some("www.a.com"));
        assert_eq!(find(&t, "api.a.com"), Some("*.a.com"));
        assert_eq!(find(&t, "v1.api.a.com"), Some("*.*.a.com"));
    }

    #[test]
    fn port_is_retried_without() {
        let mut core = RouterCoreHost::new(Box::new(super::super::RouterCoreRadix::new(Arc::new(
            crate::funcs::FuncCreatorStd::new(),
        ))));
        core.hosts.insert("example.com");
        assert_eq!(core.lookup("Example.COM:8080"), Some("example.com"));
        assert_eq!(core.lookup("other.com"), None);
    }
}
