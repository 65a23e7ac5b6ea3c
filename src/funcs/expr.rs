//! Boolean rule expressions: `nozero AND (len>3 OR NOT prefix=tmp)`.
//!
//! Precedence from low to high: `OR`, `AND`, `NOT`, parentheses, atom.
//! Keywords are only recognised when bounded by whitespace, a parenthesis or
//! the end of input; an atom is everything up to the next keyword or `)`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{Func, FuncConstructor, FuncCreator, FuncCreatorMetadata, FuncCreatorStd, FuncError, FuncKind};

#[derive(Clone, Debug, PartialEq)]
enum Token<'a> {
    Open,
    Close,
    Not,
    And,
    Or,
    Atom(&'a str),
}

const KEYWORDS: [(&str, Token<'static>); 3] = [("NOT", Token::Not), ("AND", Token::And), ("OR", Token::Or)];

fn keyword_at(s: &str) -> Option<(Token<'static>, usize)> {
    KEYWORDS.iter().find_map(|(kw, tok)| {
        let rest = s.strip_prefix(kw)?;
        let bounded = rest
            .chars()
            .next()
            .is_none_or(|c| c.is_whitespace() || c == '(' || c == ')');
        bounded.then(|| (tok.clone(), kw.len()))
    })
}

fn tokenize(expr: &str) -> Vec<Token<'_>> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < expr.len() {
        let rest = &expr[i..];
        let Some(c) = rest.chars().next() else { break };
        if c.is_whitespace() {
            i += c.len_utf8();
            continue;
        }
        if c == '(' {
            out.push(Token::Open);
            i += 1;
            continue;
        }
        if c == ')' {
            out.push(Token::Close);
            i += 1;
            continue;
        }
        if let Some((tok, len)) = keyword_at(rest) {
            out.push(tok);
            i += len;
            continue;
        }

        // Atom: stop at `)` or at whitespace followed by a keyword.
        let mut end = 0;
        let mut depth = 0usize;
        for (j, ch) in rest.char_indices() {
            match ch {
                '(' => depth += 1,
                ')' if depth == 0 => break,
                ')' => depth -= 1,
                c if c.is_whitespace() && depth == 0 => {
                    let next = rest[j..].trim_start();
                    if next.is_empty() || next.starts_with(')') || keyword_at(next).is_some() {
                        break;
                    }
                }
                _ => {}
            }
            end = j + ch.len_utf8();
        }
        out.push(Token::Atom(rest[..end].trim_end()));
        i += end;
    }
    out
}

struct Parser<'a, 'c> {
    tokens: Vec<Token<'a>>,
    pos: usize,
    expr: &'a str,
    kind: FuncKind,
    creator: &'c dyn FuncCreator,
}

impl Parser<'_, '_> {
    fn error(&self, message: impl Into<String>) -> FuncError {
        FuncError::Expression { expr: self.expr.to_owned(), message: message.into() }
    }

    fn peek(&self) -> Option<&Token<'_>> {
        self.tokens.get(self.pos)
    }

    fn or(&mut self) -> Result<Func, FuncError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            left = left.combine(self.and()?, false)?;
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Func, FuncError> {
        let mut left = self.not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            left = left.combine(self.not()?, true)?;
        }
        Ok(left)
    }

    fn not(&mut self) -> Result<Func, FuncError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return self.not()?.not();
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Func, FuncError> {
        match self.tokens.get(self.pos).cloned() {
            Some(Token::Open) => {
                self.pos += 1;
                let inner = self.or()?;
                if self.peek() != Some(&Token::Close) {
                    return Err(self.error("missing `)`"));
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(Token::Atom(name)) => {
                self.pos += 1;
                self.creator.create(self.kind, name)
            }
            Some(tok) => Err(self.error(format!("unexpected {tok:?}"))),
            None => Err(self.error("unexpected end")),
        }
    }
}

/// A creator that compiles boolean expressions over the rules of an inner
/// creator. Plain rule names pass straight through.
pub struct FuncCreatorExpr {
    inner: Arc<dyn FuncCreator>,
    cache: RwLock<HashMap<(FuncKind, String), Func>>,
    errors: RwLock<Vec<String>>,
}

impl FuncCreatorExpr {
    pub fn new(inner: Arc<dyn FuncCreator>) -> Self {
        Self { inner, cache: RwLock::new(HashMap::new()), errors: RwLock::new(Vec::new()) }
    }
}

impl Default for FuncCreatorExpr {
    fn default() -> Self {
        Self::new(Arc::new(FuncCreatorStd::new()))
    }
}

impl FuncCreator for FuncCreatorExpr {
    fn register(&self, name: &str, func: Func) {
        self.inner.register(name, func);
    }

    fn register_constructor(&self, kind: FuncKind, name: &str, ctor: FuncConstructor) {
        self.inner.register_constructor(kind, name, ctor);
    }

    fn create(&self, kind: FuncKind, name: &str) -> Result<Func, FuncError> {
        let tokens = tokenize(name);
        if let [Token::Atom(atom)] = tokens.as_slice() {
            return self.inner.create(kind, atom);
        }

        let key = (kind, name.to_owned());
        if let Some(f) = self.cache.read().get(&key) {
            return Ok(f.clone());
        }
        if !kind.is_predicate() {
            return Err(FuncError::NotPredicate(kind));
        }

        let mut parser = Parser { tokens, pos: 0, expr: name, kind, creator: self.inner.as_ref() };
        let result = parser.or().and_then(|f| match parser.peek() {
            None => Ok(f),
            Some(tok) => Err(parser.error(format!("trailing {tok:?}"))),
        });
        match result {
            Ok(f) => {
                self.cache.write().insert(key, f.clone());
                Ok(f)
            }
            Err(err) => {
                self.errors.write().push(err.to_string());
                Err(err)
            }
        }
    }

    fn metadata(&self) -> FuncCreatorMetadata {
        let mut meta = self.inner.metadata();
        meta.name = "FuncCreatorExpr";
        let mut exprs: Vec<String> = self.cache.read().keys().map(|(k, n)| format!("{k} {n}")).collect();
        exprs.sort();
        meta.funcs.extend(exprs);
        meta.errors.extend(self.errors.read().iter().cloned());
        meta
    }
}
