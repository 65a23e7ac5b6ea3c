//! The default rule catalogue installed by [`FuncCreatorStd::new`].
//!
//! Predicates: `zero nozero must min max equal enum len num integer prefix
//! suffix contains fold regexp patten mail phone domain after before`.
//! Mutators: `default value add now replace tolower toupper trim trimprefix
//! trimsuffix md5 hide hidename hidemail hidephone`.

use std::fmt::Display;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use chrono::format::{Item, StrftimeItems};
use md5::{Digest, Md5};
use regex::Regex;
use serde_json::{Map, Value};

use super::{Func, FuncConstructor, FuncCreator, FuncCreatorStd, FuncError, FuncKind};
use crate::value::parse_time;

static MAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(\.[A-Za-z0-9\-]+)*\.[A-Za-z]{2,}$").expect("mail regex")
});
static PHONE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^1[3-9]\d{9}$").expect("phone regex"));
static DOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9]([A-Za-z0-9\-]{0,61}[A-Za-z0-9])?\.)+[A-Za-z]{2,}$").expect("domain regex")
});

const NOW_LAYOUT: &str = "%Y-%m-%d %H:%M:%S";

pub(super) fn register_defaults(fc: &FuncCreatorStd) {
    // ── zero / nozero ─────────────────────────────────────────────────────────
    for (name, want) in [("zero", true), ("nozero", false), ("must", false)] {
        fc.register(name, Func::string(move |s| s.is_empty() == want));
        fc.register(name, Func::int(move |n| (n == 0) == want));
        fc.register(name, Func::uint(move |n| (n == 0) == want));
        fc.register(name, Func::float(move |n| (n == 0.0) == want));
        fc.register(name, Func::boolean(move |b| !b == want));
        fc.register(name, Func::any(move |v| is_zero(v) == want));
    }

    // ── Numeric bounds ────────────────────────────────────────────────────────
    for (name, ge) in [("min", true), ("max", false)] {
        let cmp = move |x: f64, bound: f64| if ge { x >= bound } else { x <= bound };
        ctor(fc, FuncKind::Int, name, move |arg| {
            let bound: i64 = parse_arg(name, arg)?;
            Ok(Func::int(move |n| if ge { n >= bound } else { n <= bound }))
        });
        ctor(fc, FuncKind::Uint, name, move |arg| {
            let bound: u64 = parse_arg(name, arg)?;
            Ok(Func::uint(move |n| if ge { n >= bound } else { n <= bound }))
        });
        ctor(fc, FuncKind::Float, name, move |arg| {
            let bound: f64 = parse_arg(name, arg)?;
            Ok(Func::float(move |n| cmp(n, bound)))
        });
        // A string is compared by its numeric reading.
        ctor(fc, FuncKind::String, name, move |arg| {
            let bound: f64 = parse_arg(name, arg)?;
            Ok(Func::string(move |s| s.trim().parse::<f64>().is_ok_and(|n| cmp(n, bound))))
        });
        ctor(fc, FuncKind::Any, name, move |arg| {
            let bound: f64 = parse_arg(name, arg)?;
            Ok(Func::any(move |v| number_of(v).is_some_and(|n| cmp(n, bound))))
        });
    }

    // ── equal / enum ──────────────────────────────────────────────────────────
    ctor(fc, FuncKind::String, "equal", |arg| {
        let (neg, want) = negated(arg);
        let want = want.to_owned();
        Ok(Func::string(move |s| (s == want) != neg))
    });
    ctor(fc, FuncKind::Int, "equal", |arg| {
        let (neg, want) = negated(arg);
        let want: i64 = parse_arg("equal", want)?;
        Ok(Func::int(move |n| (n == want) != neg))
    });
    ctor(fc, FuncKind::Uint, "equal", |arg| {
        let (neg, want) = negated(arg);
        let want: u64 = parse_arg("equal", want)?;
        Ok(Func::uint(move |n| (n == want) != neg))
    });
    ctor(fc, FuncKind::Float, "equal", |arg| {
        let (neg, want) = negated(arg);
        let want: f64 = parse_arg("equal", want)?;
        Ok(Func::float(move |n| (n == want) != neg))
    });
    ctor(fc, FuncKind::Bool, "equal", |arg| {
        let (neg, want) = negated(arg);
        let want = crate::value::parse_bool(want)
            .ok_or_else(|| FuncError::argument("equal", want, "not a bool"))?;
        Ok(Func::boolean(move |b| (b == want) != neg))
    });
    ctor(fc, FuncKind::String, "enum", |arg| {
        let set: Vec<String> = arg.split(',').map(str::to_owned).collect();
        Ok(Func::string(move |s| set.iter().any(|e| e == s)))
    });
    ctor(fc, FuncKind::Int, "enum", |arg| {
        let set = parse_list::<i64>("enum", arg)?;
        Ok(Func::int(move |n| set.contains(&n)))
    });
    ctor(fc, FuncKind::Uint, "enum", |arg| {
        let set = parse_list::<u64>("enum", arg)?;
        Ok(Func::uint(move |n| set.contains(&n)))
    });
    ctor(fc, FuncKind::Float, "enum", |arg| {
        let set = parse_list::<f64>("enum", arg)?;
        Ok(Func::float(move |n| set.contains(&n)))
    });

    // ── len ───────────────────────────────────────────────────────────────────
    ctor(fc, FuncKind::String, "len", |arg| {
        let check = len_check(arg)?;
        Ok(Func::string(move |s| check(s.chars().count())))
    });
    ctor(fc, FuncKind::Any, "len", |arg| {
        let check = len_check(arg)?;
        Ok(Func::any(move |v| match v {
            Value::String(s) => check(s.chars().count()),
            Value::Array(a)  => check(a.len()),
            Value::Object(m) => check(m.len()),
            Value::Null      => check(0),
            _ => false,
        }))
    });

    // ── String shape ──────────────────────────────────────────────────────────
    fc.register("num", Func::string(is_num));
    fc.register("integer", Func::string(|s| s.parse::<i64>().is_ok()));
    fc.register("mail", Func::string(|s| MAIL.is_match(s)));
    fc.register("phone", Func::string(|s| PHONE.is_match(s)));
    fc.register("domain", Func::string(|s| DOMAIN.is_match(s)));

    ctor(fc, FuncKind::String, "prefix", |arg| {
        let p = arg.to_owned();
        Ok(Func::string(move |s| s.starts_with(&p)))
    });
    ctor(fc, FuncKind::String, "suffix", |arg| {
        let p = arg.to_owned();
        Ok(Func::string(move |s| s.ends_with(&p)))
    });
    ctor(fc, FuncKind::String, "contains", |arg| {
        let p = arg.to_owned();
        Ok(Func::string(move |s| s.contains(&p)))
    });
    ctor(fc, FuncKind::String, "fold", |arg| {
        let p = arg.to_lowercase();
        Ok(Func::string(move |s| s.to_lowercase() == p))
    });
    ctor(fc, FuncKind::String, "regexp", |arg| {
        let re = Regex::new(arg).map_err(|e| FuncError::argument("regexp", arg, e))?;
        Ok(Func::string(move |s| re.is_match(s)))
    });
    ctor(fc, FuncKind::String, "patten", |arg| {
        let pattern = arg.to_owned();
        Ok(Func::string(move |s| glob_match(&pattern, s)))
    });
    for (name, after) in [("after", true), ("before", false)] {
        ctor(fc, FuncKind::String, name, move |arg| {
            let at = parse_time(arg).ok_or_else(|| FuncError::argument(name, arg, "not a time"))?;
            Ok(Func::string(move |s| {
                parse_time(s).is_some_and(|t| if after { t > at } else { t < at })
            }))
        });
    }

    // ── Mutators ──────────────────────────────────────────────────────────────
    fc.register("default", Func::any_mut(|v| match v {
        Value::Null => Value::Object(Map::new()),
        other => other.clone(),
    }));
    ctor(fc, FuncKind::StringMut, "default", |arg| {
        let d = arg.to_owned();
        Ok(Func::string_mut(move |s| if s.is_empty() { d.clone() } else { s.to_owned() }))
    });
    ctor(fc, FuncKind::IntMut, "default", |arg| {
        let d: i64 = parse_arg("default", arg)?;
        Ok(Func::int_mut(move |n| if n == 0 { d } else { n }))
    });

    ctor(fc, FuncKind::StringMut, "value", |arg| {
        let v = arg.to_owned();
        Ok(Func::string_mut(move |_| v.clone()))
    });
    ctor(fc, FuncKind::IntMut, "value", |arg| {
        let v: i64 = parse_arg("value", arg)?;
        Ok(Func::int_mut(move |_| v))
    });
    ctor(fc, FuncKind::UintMut, "value", |arg| {
        let v: u64 = parse_arg("value", arg)?;
        Ok(Func::uint_mut(move |_| v))
    });
    ctor(fc, FuncKind::FloatMut, "value", |arg| {
        let v: f64 = parse_arg("value", arg)?;
        Ok(Func::float_mut(move |_| v))
    });
    ctor(fc, FuncKind::BoolMut, "value", |arg| {
        let v = crate::value::parse_bool(arg).ok_or_else(|| FuncError::argument("value", arg, "not a bool"))?;
        Ok(Func::BoolMut(Arc::new(move |_: bool| v)))
    });
    ctor(fc, FuncKind::AnyMut, "value", |arg| {
        let v = serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.to_owned()));
        Ok(Func::any_mut(move |_| v.clone()))
    });

    ctor(fc, FuncKind::IntMut, "add", |arg| {
        let d: i64 = parse_arg("add", arg)?;
        Ok(Func::int_mut(move |n| n.saturating_add(d)))
    });
    ctor(fc, FuncKind::UintMut, "add", |arg| {
        let d: u64 = parse_arg("add", arg)?;
        Ok(Func::uint_mut(move |n| n.saturating_add(d)))
    });
    ctor(fc, FuncKind::FloatMut, "add", |arg| {
        let d: f64 = parse_arg("add", arg)?;
        Ok(Func::float_mut(move |n| n + d))
    });

    ctor(fc, FuncKind::StringMut, "now", |arg| {
        let layout = if arg.is_empty() { NOW_LAYOUT.to_owned() } else { arg.to_owned() };
        if StrftimeItems::new(&layout).any(|i| matches!(i, Item::Error)) {
            return Err(FuncError::argument("now", arg, "invalid time layout"));
        }
        Ok(Func::string_mut(move |_| chrono::Local::now().format(&layout).to_string()))
    });
    ctor(fc, FuncKind::StringMut, "replace", |arg| {
        let (old, new) = arg
            .split_once(',')
            .ok_or_else(|| FuncError::argument("replace", arg, "expected `old,new`"))?;
        let (old, new) = (old.to_owned(), new.to_owned());
        Ok(Func::string_mut(move |s| s.replace(&old, &new)))
    });
    ctor(fc, FuncKind::StringMut, "trim", |arg| {
        let cut: Vec<char> = arg.chars().collect();
        Ok(Func::string_mut(move |s| {
            if cut.is_empty() { s.trim().to_owned() } else { s.trim_matches(cut.as_slice()).to_owned() }
        }))
    });
    ctor(fc, FuncKind::StringMut, "trimprefix", |arg| {
        let p = arg.to_owned();
        Ok(Func::string_mut(move |s| s.strip_prefix(p.as_str()).unwrap_or(s).to_owned()))
    });
    ctor(fc, FuncKind::StringMut, "trimsuffix", |arg| {
        let p = arg.to_owned();
        Ok(Func::string_mut(move |s| s.strip_suffix(p.as_str()).unwrap_or(s).to_owned()))
    });
    fc.register("tolower", Func::string_mut(str::to_lowercase));
    fc.register("toupper", Func::string_mut(str::to_uppercase));
    fc.register("md5", Func::string_mut(|s| hex::encode(Md5::digest(s.as_bytes()))));
    fc.register("hide", Func::string_mut(hide));
    fc.register("hidename", Func::string_mut(hide_name));
    fc.register("hidemail", Func::string_mut(hide_mail));
    fc.register("hidephone", Func::string_mut(hide_phone));
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn ctor<F>(fc: &FuncCreatorStd, kind: FuncKind, name: &str, f: F)
where
    F: Fn(&str) -> Result<Func, FuncError> + Send + Sync + 'static,
{
    let f: FuncConstructor = Arc::new(f);
    fc.register_constructor(kind, name, f);
}

fn parse_arg<T>(name: &str, arg: &str) -> Result<T, FuncError>
where
    T: FromStr,
    T::Err: Display,
{
    arg.trim().parse().map_err(|e| FuncError::argument(name, arg, e))
}

fn parse_list<T>(name: &str, arg: &str) -> Result<Vec<T>, FuncError>
where
    T: FromStr,
    T::Err: Display,
{
    arg.split(',').map(|s| parse_arg(name, s)).collect()
}

fn negated(arg: &str) -> (bool, &str) {
    match arg.strip_prefix("!=") {
        Some(rest) => (true, rest),
        None => (false, arg),
    }
}

fn len_check(arg: &str) -> Result<Arc<dyn Fn(usize) -> bool + Send + Sync>, FuncError> {
    let (op, num) = match arg.as_bytes().first() {
        Some(b'>') => ('>', &arg[1..]),
        Some(b'<') => ('<', &arg[1..]),
        _ => ('=', arg),
    };
    let n: usize = parse_arg("len", num)?;
    Ok(match op {
        '>' => Arc::new(move |l: usize| l > n),
        '<' => Arc::new(move |l: usize| l < n),
        _ => Arc::new(move |l: usize| l == n),
    })
}

pub(crate) fn is_zero(v: &Value) -> bool {
    match v {
        Value::Null      => true,
        Value::Bool(b)   => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a)  => a.is_empty(),
        Value::Object(m) => m.is_empty(),
    }
}

fn number_of(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Decimal digits with an optional sign and at most one dot.
fn is_num(s: &str) -> bool {
    let digits = s.strip_prefix(['-', '+']).unwrap_or(s);
    let mut dot = false;
    let mut any = false;
    for c in digits.chars() {
        match c {
            '0'..='9' => any = true,
            '.' if !dot => dot = true,
            _ => return false,
        }
    }
    any
}

/// `*` matches any run of characters; everything else is literal.
fn glob_match(pattern: &str, s: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else { return s.is_empty() };
    let Some(mut rest) = s.strip_prefix(first) else { return false };
    let parts: Vec<&str> = parts.collect();
    let Some((last, middle)) = parts.split_last() else {
        return rest.is_empty();
    };
    for part in middle {
        match rest.find(part) {
            Some(i) => rest = &rest[i + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

fn hide(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let n = chars.len();
    let q = n / 4;
    let mut out: String = chars[..q].iter().collect();
    out.push_str(&"*".repeat(n - 2 * q));
    out.extend(&chars[n - q..]);
    out
}

fn hide_name(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    match chars.len() {
        0 | 1 => s.to_owned(),
        2 => format!("{}*", chars[0]),
        n => format!("{}{}{}", chars[0], "*".repeat(n - 2), chars[n - 1]),
    }
}

fn hide_mail(s: &str) -> String {
    match s.rsplit_once('@') {
        Some((local, domain)) => format!("{}@{domain}", hide_name(local)),
        None => hide(s),
    }
}

fn hide_phone(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let n = chars.len();
    if n < 7 {
        return hide(s);
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[n - 4..].iter().collect();
    format!("{head}****{tail}")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn creator() -> FuncCreatorStd {
        FuncCreatorStd::new()
    }

    fn string(name: &str) -> Func {
        creator().create(FuncKind::String, name).unwrap()
    }

    fn mutate(kind: FuncKind, name: &str, v: Value) -> Value {
        creator().create(kind, name).unwrap().apply(&v)
    }

    #[test]
    fn zero_family() {
        let fc = creator();
        assert!(fc.create(FuncKind::String, "zero").unwrap().check_str(""));
        assert!(fc.create(FuncKind::String, "nozero").unwrap().check_str("x"));
        assert!(!fc.create(FuncKind::String, "must").unwrap().check_str(""));
        assert!(fc.create(FuncKind::Any, "nozero").unwrap().check(&json!([1])));
        assert!(!fc.create(FuncKind::Int, "nozero").unwrap().check(&json!(0)));
    }

    #[test]
    fn numeric_bounds() {
        let fc = creator();
        let min = fc.create(FuncKind::String, "min=1").unwrap();
        assert!(min.check_str("42"));
        assert!(!min.check_str("0"));
        assert!(!min.check_str("abc"));
        let max = fc.create(FuncKind::Float, "max=1.5").unwrap();
        assert!(max.check(&json!(1.5)));
        assert!(!max.check(&json!(2.0)));
    }

    #[test]
    fn equal_enum_len() {
        assert!(string("equal=abc").check_str("abc"));
        assert!(string("equal!=abc").check_str("abd"));
        assert!(string("enum=a,b,c").check_str("b"));
        assert!(!string("enum=a,b,c").check_str("d"));
        assert!(string("len=3").check_str("héé"));
        assert!(string("len>2").check_str("abc"));
        assert!(!string("len<3").check_str("abc"));
        let any_len = creator().create(FuncKind::Any, "len>1").unwrap();
        assert!(any_len.check(&json!([1, 2])));
    }

    #[test]
    fn string_shapes() {
        assert!(string("num").check_str("-12.5"));
        assert!(!string("num").check_str("1e5"));
        assert!(string("integer").check_str("-7"));
        assert!(string("prefix=ab").check_str("abc"));
        assert!(string("suffix=bc").check_str("abc"));
        assert!(string("contains=b").check_str("abc"));
        assert!(string("fold=HeLLo").check_str("hello"));
        assert!(string(r"regexp=^\d+$").check_str("123"));
        assert!(string("patten=img_*.png").check_str("img_01.png"));
        assert!(!string("patten=img_*.png").check_str("img_01.jpg"));
        assert!(string("mail").check_str("dev@example.com"));
        assert!(!string("mail").check_str("dev@"));
        assert!(string("phone").check_str("13800138000"));
        assert!(string("domain").check_str("api.example.com"));
        assert!(string("after=2020-01-01").check_str("2024-06-01"));
        assert!(string("before=2020-01-01").check_str("2019-06-01"));
    }

    #[test]
    fn mutators() {
        use FuncKind::{AnyMut, IntMut, StringMut};
        assert_eq!(mutate(AnyMut, "default", Value::Null), json!({}));
        assert_eq!(mutate(StringMut, "default=guest", json!("")), json!("guest"));
        assert_eq!(mutate(IntMut, "add=5", json!(10)), json!(15));
        assert_eq!(mutate(StringMut, "value=x", json!("y")), json!("x"));
        assert_eq!(mutate(StringMut, "replace=a,o", json!("banana")), json!("bonono"));
        assert_eq!(mutate(StringMut, "trim=-", json!("--a--")), json!("a"));
        assert_eq!(mutate(StringMut, "trimprefix=ab", json!("abc")), json!("c"));
        assert_eq!(mutate(StringMut, "trimsuffix=bc", json!("abc")), json!("a"));
        assert_eq!(mutate(StringMut, "toupper", json!("abc")), json!("ABC"));
        assert_eq!(
            mutate(StringMut, "md5", json!("eudore")),
            json!(hex::encode(Md5::digest(b"eudore")))
        );
        assert_eq!(mutate(StringMut, "now=%Y", json!("")).as_str().map(str::len), Some(4));
    }

    #[test]
    fn masking() {
        assert_eq!(hide("abcdefgh"), "ab****gh");
        assert_eq!(hide_name("王小明"), "王*明");
        assert_eq!(hide_name("ab"), "a*");
        assert_eq!(hide_mail("alice@example.com"), "a***e@example.com");
        assert_eq!(hide_phone("13800138000"), "138****8000");
    }

    #[test]
    fn bad_arguments() {
        let fc = creator();
        assert!(fc.create(FuncKind::String, "regexp=(").is_err());
        assert!(fc.create(FuncKind::StringMut, "replace=abc").is_err());
        assert!(fc.create(FuncKind::String, "after=someday").is_err());
    }
}
