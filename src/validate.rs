//! Per-type validation rules.
//!
//! Rules are registered per Rust type as `(field path, rule list)` pairs,
//! the counterpart of a `valid:"…"` struct tag:
//!
//! ```rust
//! # use eudore::Validator;
//! #[derive(serde::Serialize)]
//! struct User { name: String, age: u32, tags: Vec<String> }
//!
//! let v = Validator::default();
//! v.register::<User>(&[
//!     ("name", "nozero"),
//!     ("age", "min=1,max=200"),
//!     ("tags", "len<4,omitempty"),
//! ]);
//! ```
//!
//! A rule list splits on commas outside parentheses; each atom is resolved by
//! the function creator for the field's runtime kind, falling back to the
//! `Any` kind. `omitempty` skips a field holding its zero value. Array fields
//! check every element, except for the length and zero rules which look at
//! the array itself. A check registered with [`Validator::register_check`]
//! runs before the field rules and short-circuits them.
//!
//! Rules are resolved against the creator when registered. A rule no operand
//! kind can compile (an unknown name, a bad argument) is logged and fails
//! every check with [`Error::Func`], reported as a 500 rather than as bad
//! input.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::error;

use crate::error::Error;
use crate::funcs::rules::is_zero;
use crate::funcs::{FuncCreator, FuncCreatorExpr, FuncError, FuncKind, split_rule};
use crate::value::{self, PathOptions};

/// Rules that look at an array as a whole.
const WHOLE_VALUE_RULES: [&str; 4] = ["len", "zero", "nozero", "must"];

const PREDICATE_KINDS: [FuncKind; 6] =
    [FuncKind::String, FuncKind::Int, FuncKind::Uint, FuncKind::Float, FuncKind::Bool, FuncKind::Any];

static NULL: Value = Value::Null;

type Check = Arc<dyn Fn(&dyn Any) -> Result<(), Error> + Send + Sync>;

#[derive(Clone)]
struct Rule {
    text: String,
    unresolved: Option<FuncError>,
}

#[derive(Clone)]
struct FieldRules {
    path: String,
    rules: Vec<Rule>,
    omitempty: bool,
}

#[derive(Default)]
struct TypePlan {
    package: String,
    type_name: String,
    fields: Vec<FieldRules>,
    check: Option<Check>,
}

/// Shared validator.
pub struct Validator {
    creator: Arc<dyn FuncCreator>,
    plans: RwLock<HashMap<TypeId, Arc<TypePlan>>>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(Arc::new(FuncCreatorExpr::default()))
    }
}

/// Splits `min=1,regexp=(a,b),omitempty` on commas outside parentheses.
pub fn split_rules(list: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let (mut depth, mut start) = (0i32, 0);
    for (i, c) in list.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                out.push(list[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(list[start..].trim());
    out.retain(|r| !r.is_empty());
    out
}

/// `my_app::models::User<T>` → `("models", "User")`.
fn split_type_name(full: &str) -> (String, String) {
    let base = full.split('<').next().unwrap_or(full);
    match base.rsplit_once("::") {
        Some((module, name)) => {
            let package = module.rsplit("::").next().unwrap_or(module);
            (package.to_owned(), name.to_owned())
        }
        None => (String::new(), base.to_owned()),
    }
}

impl Validator {
    pub fn new(creator: Arc<dyn FuncCreator>) -> Self {
        Self { creator, plans: RwLock::new(HashMap::new()) }
    }

    pub fn creator(&self) -> &Arc<dyn FuncCreator> {
        &self.creator
    }

    /// A validator with the same registrations resolving rules through
    /// `creator`.
    pub fn with_creator(&self, creator: Arc<dyn FuncCreator>) -> Self {
        let next = Self::new(creator);
        let mut plans = HashMap::new();
        for (id, plan) in self.plans.read().iter() {
            let fields = plan
                .fields
                .iter()
                .map(|f| FieldRules {
                    path: f.path.clone(),
                    rules: f.rules.iter().map(|r| next.resolve(&f.path, &r.text)).collect(),
                    omitempty: f.omitempty,
                })
                .collect();
            let plan = TypePlan {
                package: plan.package.clone(),
                type_name: plan.type_name.clone(),
                fields,
                check: plan.check.clone(),
            };
            plans.insert(*id, Arc::new(plan));
        }
        *next.plans.write() = plans;
        next
    }

    /// Compiles `text` for every predicate kind; it resolves if any kind accepts it.
    fn resolve(&self, path: &str, text: &str) -> Rule {
        let mut first = None;
        for kind in PREDICATE_KINDS {
            match self.creator.create(kind, text) {
                Ok(_) => return Rule { text: text.to_owned(), unresolved: None },
                Err(FuncError::KindMismatch { .. }) => {}
                Err(err) => {
                    first.get_or_insert(err);
                }
            }
        }
        let err = first.unwrap_or_else(|| FuncError::NotFound { kind: FuncKind::Any, name: text.to_owned() });
        error!(field = path, rule = text, error = %err, "validation rule cannot be resolved");
        Rule { text: text.to_owned(), unresolved: Some(err) }
    }

    fn update<T: 'static>(&self, f: impl FnOnce(&mut TypePlan)) {
        let mut plans = self.plans.write();
        let mut plan = match plans.get(&TypeId::of::<T>()) {
            Some(p) => TypePlan {
                package: p.package.clone(),
                type_name: p.type_name.clone(),
                fields: p.fields.clone(),
                check: p.check.clone(),
            },
            None => {
                let (package, type_name) = split_type_name(type_name::<T>());
                TypePlan { package, type_name, ..TypePlan::default() }
            }
        };
        f(&mut plan);
        plans.insert(TypeId::of::<T>(), Arc::new(plan));
    }

    /// Adds field rules for `T`. Each rule is compiled once here and cached
    /// by the function creator; rules that do not compile are logged.
    pub fn register<T: 'static>(&self, fields: &[(&str, &str)]) {
        let mut compiled = Vec::new();
        for (path, list) in fields {
            let mut rules = Vec::new();
            let mut omitempty = false;
            for atom in split_rules(list) {
                if atom == "omitempty" {
                    omitempty = true;
                } else {
                    rules.push(self.resolve(path, atom));
                }
            }
            compiled.push(FieldRules { path: (*path).to_owned(), rules, omitempty });
        }
        self.update::<T>(|plan| plan.fields.extend(compiled));
    }

    /// Adds a whole-value check for `T` that runs before the field rules.
    pub fn register_check<T, F>(&self, check: F)
    where
        T: 'static,
        F: Fn(&T) -> Result<(), Error> + Send + Sync + 'static,
    {
        let check: Check = Arc::new(move |data: &dyn Any| match data.downcast_ref::<T>() {
            Some(v) => check(v),
            None => Ok(()),
        });
        self.update::<T>(|plan| plan.check = Some(check));
    }

    /// Validates a serializable value.
    pub fn validate<T: Serialize + 'static>(&self, data: &T) -> Result<(), Error> {
        if !self.plans.read().contains_key(&TypeId::of::<T>()) {
            return Ok(());
        }
        let doc = serde_json::to_value(data)?;
        self.check(data, &doc)
    }

    /// Validates `data` whose document form is `doc`. Types without rules pass.
    pub fn check<T: 'static>(&self, data: &T, doc: &Value) -> Result<(), Error> {
        let Some(plan) = self.plans.read().get(&TypeId::of::<T>()).cloned() else {
            return Ok(());
        };
        if let Some(check) = &plan.check {
            check(data)?;
        }

        let opts = PathOptions::new().fold_case(true);
        for field in &plan.fields {
            let v = value::get(doc, &field.path, &opts).unwrap_or(&NULL);
            if field.omitempty && is_zero(v) {
                continue;
            }
            for rule in &field.rules {
                if let Some(err) = &rule.unresolved {
                    return Err(Error::Func(err.clone()));
                }
                let rule = rule.text.as_str();
                let (base, _) = split_rule(rule);
                let ok = match v {
                    Value::Array(items) if !WHOLE_VALUE_RULES.contains(&base) => {
                        items.iter().all(|item| self.apply(rule, item))
                    }
                    v => self.apply(rule, v),
                };
                if !ok {
                    return Err(Error::Validate {
                        package: plan.package.clone(),
                        type_name: plan.type_name.clone(),
                        field: field.path.clone(),
                        rule: rule.to_owned(),
                    });
                }
            }
        }
        Ok(())
    }

    fn apply(&self, rule: &str, v: &Value) -> bool {
        let kind = FuncKind::of_value(v);
        let func = self
            .creator
            .create(kind, rule)
            .or_else(|_| self.creator.create(FuncKind::Any, rule))
            .ok();
        match func {
            Some(f) => f.check(v),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Deserialize, Serialize)]
    struct User {
        #[serde(rename = "Name")]
        name: String,
        age: u32,
        tags: Vec<String>,
        email: String,
    }

    fn validator() -> Validator {
        let v = Validator::default();
        v.register::<User>(&[
            ("Name", "nozero"),
            ("age", "min=1,max=200"),
            ("tags", "len<3,prefix=a"),
            ("email", "omitempty,mail"),
        ]);
        v
    }

    fn user(name: &str, age: u32, tags: &[&str]) -> User {
        User {
            name: name.into(),
            age,
            tags: tags.iter().map(|s| s.to_string()).collect(),
            email: String::new(),
        }
    }

    #[test]
    fn split_outside_parens() {
        assert_eq!(split_rules("min=1, (a,b) ,omitempty"), ["min=1", "(a,b)", "omitempty"]);
    }

    #[test]
    fn passes_and_fails_with_field_and_rule() {
        let v = validator();
        v.validate(&user("bob", 30, &["a"])).unwrap();

        let err = v.validate(&user("", 30, &[])).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Name") && msg.contains("nozero"), "{msg}");
        assert_eq!(err.status(), http::StatusCode::BAD_REQUEST);

        let err = v.validate(&user("bob", 0, &[])).unwrap_err();
        assert!(err.to_string().contains("min=1"));
    }

    #[test]
    fn arrays_fan_out_except_len() {
        let v = validator();
        assert!(v.validate(&user("bob", 1, &["a", ""])).is_err());
        assert!(v.validate(&user("bob", 1, &["a", "b", "c"])).is_err());
    }

    #[test]
    fn omitempty_and_custom_check() {
        let v = validator();
        let mut u = user("bob", 1, &[]);
        u.email = "not-mail".into();
        assert!(v.validate(&u).is_err());

        v.register_check::<User, _>(|u| if u.age > 100 { Err(Error::msg("too old")) } else { Ok(()) });
        let err = v.validate(&user("bob", 150, &[])).unwrap_err();
        assert_eq!(err.to_string(), "too old");
    }

    #[test]
    fn unknown_rule_is_a_server_error() {
        let v = Validator::default();
        v.register::<User>(&[("age", "mni=1")]);
        let err = v.validate(&user("bob", 30, &[])).unwrap_err();
        assert!(matches!(err, Error::Func(FuncError::NotFound { .. })), "{err}");
        assert_eq!(err.status(), http::StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn with_creator_keeps_registrations() {
        let v = validator();
        let next = v.with_creator(Arc::new(FuncCreatorExpr::default()));
        assert!(next.validate(&user("", 30, &[])).is_err());
        next.validate(&user("bob", 30, &["a"])).unwrap();
    }

    #[test]
    fn type_names_and_unregistered_types() {
        assert_eq!(split_type_name("app::models::User<u8>"), ("models".into(), "User".into()));
        let v = Validator::default();
        v.check(&1u8, &json!(1)).unwrap();
    }
}
