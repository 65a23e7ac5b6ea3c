//! Function-creator registry.
//!
//! Validators and mutators are addressed by *rule strings* such as `nozero`,
//! `min=3`, `len>5` or `regexp=^\d+$`. A [`FuncCreator`] turns such a string
//! plus an operand [`FuncKind`] into a compiled [`Func`]:
//!
//! ```text
//! create(Int, "min=3")
//!   ├─ cached under (Int, "min=3")?            → return it
//!   ├─ direct function (Int, "min=3")?         → return it
//!   └─ split "min" + "3"
//!        └─ constructor (Int, "min")("3")      → cache under (Int, "min=3")
//! ```
//!
//! Constructors must be pure: a cached function is reused for the lifetime
//! of the creator.
//!
//! [`FuncCreatorStd`] is the plain registry; [`FuncCreatorExpr`] layers a
//! small `NOT`/`AND`/`OR` expression language over it.

mod expr;
pub(crate) mod rules;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub use expr::FuncCreatorExpr;

// ── Kinds and functions ───────────────────────────────────────────────────────

/// Operand kind a rule is compiled for.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
pub enum FuncKind {
    String,
    Int,
    Uint,
    Float,
    Bool,
    Any,
    StringMut,
    IntMut,
    UintMut,
    FloatMut,
    BoolMut,
    AnyMut,
}

impl FuncKind {
    /// Predicate kinds compile to `T -> bool`; the rest are mutators.
    pub fn is_predicate(self) -> bool {
        matches!(self, Self::String | Self::Int | Self::Uint | Self::Float | Self::Bool | Self::Any)
    }

    /// The predicate kind matching a value's runtime shape.
    pub fn of_value(v: &Value) -> Self {
        match v {
            Value::String(_) => Self::String,
            Value::Bool(_) => Self::Bool,
            Value::Number(n) if n.is_i64() => Self::Int,
            Value::Number(n) if n.is_u64() => Self::Uint,
            Value::Number(_) => Self::Float,
            _ => Self::Any,
        }
    }
}

impl fmt::Display for FuncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

type Pred<T> = Arc<dyn Fn(T) -> bool + Send + Sync>;
type Mutate<T, R> = Arc<dyn Fn(T) -> R + Send + Sync>;

/// A compiled rule: a predicate or mutator over one operand kind.
#[derive(Clone)]
pub enum Func {
    String(Arc<dyn Fn(&str) -> bool + Send + Sync>),
    Int(Pred<i64>),
    Uint(Pred<u64>),
    Float(Pred<f64>),
    Bool(Pred<bool>),
    Any(Arc<dyn Fn(&Value) -> bool + Send + Sync>),
    StringMut(Arc<dyn Fn(&str) -> String + Send + Sync>),
    IntMut(Mutate<i64, i64>),
    UintMut(Mutate<u64, u64>),
    FloatMut(Mutate<f64, f64>),
    BoolMut(Mutate<bool, bool>),
    AnyMut(Arc<dyn Fn(&Value) -> Value + Send + Sync>),
}

impl Func {
    pub fn string(f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self::String(Arc::new(f))
    }

    pub fn int(f: impl Fn(i64) -> bool + Send + Sync + 'static) -> Self {
        Self::Int(Arc::new(f))
    }

    pub fn uint(f: impl Fn(u64) -> bool + Send + Sync + 'static) -> Self {
        Self::Uint(Arc::new(f))
    }

    pub fn float(f: impl Fn(f64) -> bool + Send + Sync + 'static) -> Self {
        Self::Float(Arc::new(f))
    }

    pub fn boolean(f: impl Fn(bool) -> bool + Send + Sync + 'static) -> Self {
        Self::Bool(Arc::new(f))
    }

    pub fn any(f: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        Self::Any(Arc::new(f))
    }

    pub fn string_mut(f: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        Self::StringMut(Arc::new(f))
    }

    pub fn int_mut(f: impl Fn(i64) -> i64 + Send + Sync + 'static) -> Self {
        Self::IntMut(Arc::new(f))
    }

    pub fn uint_mut(f: impl Fn(u64) -> u64 + Send + Sync + 'static) -> Self {
        Self::UintMut(Arc::new(f))
    }

    pub fn float_mut(f: impl Fn(f64) -> f64 + Send + Sync + 'static) -> Self {
        Self::FloatMut(Arc::new(f))
    }

    pub fn any_mut(f: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        Self::AnyMut(Arc::new(f))
    }

    pub fn kind(&self) -> FuncKind {
        match self {
            Self::String(_)    => FuncKind::String,
            Self::Int(_)       => FuncKind::Int,
            Self::Uint(_)      => FuncKind::Uint,
            Self::Float(_)     => FuncKind::Float,
            Self::Bool(_)      => FuncKind::Bool,
            Self::Any(_)       => FuncKind::Any,
            Self::StringMut(_) => FuncKind::StringMut,
            Self::IntMut(_)    => FuncKind::IntMut,
            Self::UintMut(_)   => FuncKind::UintMut,
            Self::FloatMut(_)  => FuncKind::FloatMut,
            Self::BoolMut(_)   => FuncKind::BoolMut,
            Self::AnyMut(_)    => FuncKind::AnyMut,
        }
    }

    /// Runs a string predicate. Non-string functions reject.
    pub fn check_str(&self, s: &str) -> bool {
        match self {
            Self::String(f) => f(s),
            _ => false,
        }
    }

    /// Runs a predicate against a value, converting the value to the
    /// function's operand kind. Values that cannot convert reject.
    pub fn check(&self, v: &Value) -> bool {
        match (self, v) {
            (Self::Any(f), v)                     => f(v),
            (Self::String(_), Value::String(s))   => self.check_str(s),
            (Self::Bool(f), Value::Bool(b))       => f(*b),
            (Self::Int(f), Value::Number(n))      => n.as_i64().is_some_and(|i| f(i)),
            (Self::Uint(f), Value::Number(n))     => n.as_u64().is_some_and(|u| f(u)),
            (Self::Float(f), Value::Number(n))    => n.as_f64().is_some_and(|x| f(x)),
            _ => false,
        }
    }

    /// Applies a mutator to a value. Mismatched shapes are returned unchanged.
    pub fn apply(&self, v: &Value) -> Value {
        match (self, v) {
            (Self::AnyMut(f), v)                    => f(v),
            (Self::StringMut(f), Value::String(s))  => Value::String(f(s)),
            (Self::BoolMut(f), Value::Bool(b))      => Value::Bool(f(*b)),
            (Self::IntMut(f), Value::Number(n)) if n.is_i64() => {
                n.as_i64().map(|i| Value::from(f(i))).unwrap_or_else(|| v.clone())
            }
            (Self::UintMut(f), Value::Number(n)) if n.is_u64() => {
                n.as_u64().map(|u| Value::from(f(u))).unwrap_or_else(|| v.clone())
            }
            (Self::FloatMut(f), Value::Number(n)) => {
                n.as_f64().map(|x| Value::from(f(x))).unwrap_or_else(|| v.clone())
            }
            _ => v.clone(),
        }
    }

    pub(crate) fn not(self) -> Result<Self, FuncError> {
        Ok(match self {
            Self::String(f) => Self::String(Arc::new(move |s: &str| !f(s))),
            Self::Int(f)    => Self::Int(Arc::new(move |x| !f(x))),
            Self::Uint(f)   => Self::Uint(Arc::new(move |x| !f(x))),
            Self::Float(f)  => Self::Float(Arc::new(move |x| !f(x))),
            Self::Bool(f)   => Self::Bool(Arc::new(move |x| !f(x))),
            Self::Any(f)    => Self::Any(Arc::new(move |x: &Value| !f(x))),
            other => return Err(FuncError::NotPredicate(other.kind())),
        })
    }

    pub(crate) fn combine(self, other: Self, and: bool) -> Result<Self, FuncError> {
        macro_rules! join {
            ($variant:ident, $a:ident, $b:ident, $t:ty) => {
                Self::$variant(Arc::new(move |x: $t| if and { $a(x) && $b(x) } else { $a(x) || $b(x) }))
            };
        }
        Ok(match (self, other) {
            (Self::String(a), Self::String(b)) => join!(String, a, b, &str),
            (Self::Int(a), Self::Int(b))       => join!(Int, a, b, i64),
            (Self::Uint(a), Self::Uint(b))     => join!(Uint, a, b, u64),
            (Self::Float(a), Self::Float(b))   => join!(Float, a, b, f64),
            (Self::Bool(a), Self::Bool(b))     => join!(Bool, a, b, bool),
            (Self::Any(a), Self::Any(b))       => join!(Any, a, b, &Value),
            (a, _) => return Err(FuncError::NotPredicate(a.kind())),
        })
    }
}

impl fmt::Debug for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Func({})", self.kind())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why a rule could not be compiled.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum FuncError {
    #[error("func {kind} `{name}` is not registered")]
    NotFound { kind: FuncKind, name: String },

    #[error("func `{name}` argument `{arg}`: {message}")]
    Argument { name: String, arg: String, message: String },

    #[error("func `{name}` is registered as {found}, not {expected}")]
    KindMismatch { name: String, expected: FuncKind, found: FuncKind },

    #[error("func kind {0} cannot be combined in an expression")]
    NotPredicate(FuncKind),

    #[error("func expression `{expr}`: {message}")]
    Expression { expr: String, message: String },
}

impl FuncError {
    pub(crate) fn argument(name: &str, arg: &str, message: impl fmt::Display) -> Self {
        Self::Argument { name: name.to_owned(), arg: arg.to_owned(), message: message.to_string() }
    }
}

// ── Creator trait ─────────────────────────────────────────────────────────────

/// Compiles `arg` into a function. Registered per `(kind, base name)`.
pub type FuncConstructor = Arc<dyn Fn(&str) -> Result<Func, FuncError> + Send + Sync>;

/// Snapshot of a creator's registrations and failures.
#[derive(Clone, Debug, Default, Serialize)]
pub struct FuncCreatorMetadata {
    pub name: &'static str,
    pub funcs: Vec<String>,
    pub constructors: Vec<String>,
    pub errors: Vec<String>,
}

/// Registry resolving rule strings to compiled functions.
pub trait FuncCreator: Send + Sync + 'static {
    /// Registers a ready-made function under `name` for its own kind.
    fn register(&self, name: &str, func: Func);

    /// Registers a constructor compiling `name=<arg>` rules of `kind`.
    fn register_constructor(&self, kind: FuncKind, name: &str, ctor: FuncConstructor);

    /// Resolves `name` for `kind`, compiling and caching it on first use.
    fn create(&self, kind: FuncKind, name: &str) -> Result<Func, FuncError>;

    fn metadata(&self) -> FuncCreatorMetadata;
}

/// Splits `min=3` into `("min", "3")` and `len>5` into `("len", ">5")`.
pub fn split_rule(name: &str) -> (&str, &str) {
    let end = name
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(name.len());
    let (base, rest) = name.split_at(end);
    (base, rest.strip_prefix('=').unwrap_or(rest))
}

// ── Standard registry ─────────────────────────────────────────────────────────

#[derive(Default)]
struct Registry {
    funcs: HashMap<(FuncKind, String), Func>,
    ctors: HashMap<(FuncKind, String), FuncConstructor>,
    errors: Vec<String>,
}

/// The plain registry, preloaded with the default rule catalogue.
pub struct FuncCreatorStd {
    inner: RwLock<Registry>,
}

impl FuncCreatorStd {
    /// A registry with the default catalogue.
    pub fn new() -> Self {
        let creator = Self::empty();
        rules::register_defaults(&creator);
        creator
    }

    /// A registry with nothing registered.
    pub fn empty() -> Self {
        Self { inner: RwLock::new(Registry::default()) }
    }

    fn fail(&self, err: FuncError) -> FuncError {
        tracing::debug!(error = %err, "func creator");
        let mut reg = self.inner.write();
        if reg.errors.len() < 256 {
            reg.errors.push(err.to_string());
        }
        err
    }
}

impl Default for FuncCreatorStd {
    fn default() -> Self {
        Self::new()
    }
}

impl FuncCreator for FuncCreatorStd {
    fn register(&self, name: &str, func: Func) {
        self.inner.write().funcs.insert((func.kind(), name.to_owned()), func);
    }

    fn register_constructor(&self, kind: FuncKind, name: &str, ctor: FuncConstructor) {
        self.inner.write().ctors.insert((kind, name.to_owned()), ctor);
    }

    fn create(&self, kind: FuncKind, name: &str) -> Result<Func, FuncError> {
        let key = (kind, name.to_owned());
        let ctor = {
            let reg = self.inner.read();
            if let Some(f) = reg.funcs.get(&key) {
                return Ok(f.clone());
            }
            let (base, _) = split_rule(name);
            match reg.ctors.get(&(kind, base.to_owned())) {
                Some(ctor) => ctor.clone(),
                None => {
                    let found = reg
                        .funcs
                        .keys()
                        .chain(reg.ctors.keys())
                        .find(|(_, n)| n == name || n == base)
                        .map(|(k, _)| *k);
                    drop(reg);
                    return Err(self.fail(match found {
                        Some(found) => FuncError::KindMismatch { name: name.to_owned(), expected: kind, found },
                        None => FuncError::NotFound { kind, name: name.to_owned() },
                    }));
                }
            }
        };

        let (_, arg) = split_rule(name);
        let func = ctor(arg).map_err(|e| self.fail(e))?;
        if func.kind() != kind {
            return Err(self.fail(FuncError::KindMismatch {
                name: name.to_owned(),
                expected: kind,
                found: func.kind(),
            }));
        }
        self.inner.write().funcs.entry(key).or_insert(func.clone());
        Ok(func)
    }

    fn metadata(&self) -> FuncCreatorMetadata {
        let reg = self.inner.read();
        let mut funcs: Vec<String> = reg.funcs.keys().map(|(k, n)| format!("{k} {n}")).collect();
        let mut constructors: Vec<String> = reg.ctors.keys().map(|(k, n)| format!("{k} {n}")).collect();
        funcs.sort();
        constructors.sort();
        FuncCreatorMetadata {
            name: "FuncCreatorStd",
            funcs,
            constructors,
            errors: reg.errors.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn split_rule_names() {
        assert_eq!(split_rule("min=3"), ("min", "3"));
        assert_eq!(split_rule("len>5"), ("len", ">5"));
        assert_eq!(split_rule("equal!=x"), ("equal", "!=x"));
        assert_eq!(split_rule("nozero"), ("nozero", ""));
    }

    #[test]
    fn create_is_cached_and_idempotent() {
        let fc = FuncCreatorStd::new();
        let a = fc.create(FuncKind::Int, "min=3").unwrap();
        let b = fc.create(FuncKind::Int, "min=3").unwrap();
        for n in [-1, 2, 3, 100] {
            assert_eq!(a.check(&json!(n)), b.check(&json!(n)));
        }
        assert!(fc.metadata().funcs.iter().any(|f| f == "Int min=3"));
    }

    #[test]
    fn unknown_and_mismatched_rules_are_logged() {
        let fc = FuncCreatorStd::new();
        assert!(matches!(fc.create(FuncKind::Int, "nosuch"), Err(FuncError::NotFound { .. })));
        assert!(matches!(fc.create(FuncKind::Int, "mail"), Err(FuncError::KindMismatch { .. })));
        assert!(matches!(fc.create(FuncKind::Int, "min=abc"), Err(FuncError::Argument { .. })));
        assert_eq!(fc.metadata().errors.len(), 3);
    }

    #[test]
    fn custom_registration() {
        let fc = FuncCreatorStd::empty();
        fc.register("even", Func::int(|n| n % 2 == 0));
        let even = fc.create(FuncKind::Int, "even").unwrap();
        assert!(even.check(&json!(4)));
        assert!(!even.check(&json!(3)));
        assert!(!even.check(&json!("4")));
    }
}
