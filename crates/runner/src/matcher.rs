//! Expected-value matchers
//!
//! An expected cell is one of three things: a literal compared by equality, a
//! predicate handed the actual value, or a negation that passes only when the
//! actual value differs from every wrapped value.
//!
//! In YAML scenarios predicates and negations are written as single-key
//! mappings:
//!
//! ```yaml
//! result:
//!   data:
//!     - id: 1
//!       token: { $not: [null, ""] }
//!       age: { $gte: 18 }
//!       email: { $regex: "^[^@]+@example\\.com$" }
//!       created_at: { $present: true }
//! ```

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::{RestamentError, RunResult};

/// Callable predicate over an actual column value
pub type PredicateFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Which comparison an expected value asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherKind {
    Literal,
    Predicate,
    Negation,
}

/// A predicate with a human-readable description for failure messages
#[derive(Clone)]
pub struct Predicate {
    description: String,
    check: PredicateFn,
}

impl Predicate {
    pub fn new<F>(description: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            check: Arc::new(check),
        }
    }

    pub fn test(&self, actual: &Value) -> bool {
        (self.check)(actual)
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Classified expected value
#[derive(Clone)]
pub enum Matcher {
    Literal(Value),
    Predicate(Predicate),
    Negation(Vec<Value>),
}

impl Matcher {
    pub fn literal(value: impl Into<Value>) -> Self {
        Matcher::Literal(value.into())
    }

    /// Predicate matcher; `check` receives the actual value
    pub fn predicate<F>(check: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Matcher::Predicate(Predicate::new("<predicate>", check))
    }

    /// Predicate matcher with a description used in failure messages
    pub fn described<F>(description: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Matcher::Predicate(Predicate::new(description, check))
    }

    /// Passes only when the actual value equals none of `values`
    pub fn not<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Matcher::Negation(values.into_iter().map(Into::into).collect())
    }

    pub fn kind(&self) -> MatcherKind {
        match self {
            Matcher::Literal(_) => MatcherKind::Literal,
            Matcher::Predicate(_) => MatcherKind::Predicate,
            Matcher::Negation(_) => MatcherKind::Negation,
        }
    }

    /// Evaluate this matcher against a single actual value
    pub fn matches(&self, actual: &Value) -> bool {
        match self {
            Matcher::Literal(expected) => json_eq(expected, actual),
            Matcher::Predicate(p) => p.test(actual),
            Matcher::Negation(values) => !values.iter().any(|v| json_eq(v, actual)),
        }
    }

    /// The literal value, if this is a literal matcher
    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            Matcher::Literal(v) => Some(v),
            _ => None,
        }
    }

    /// Classify a JSON value, recognising the `$not`/`$gt`/`$regex`/... forms
    pub fn classify(value: Value) -> RunResult<Self> {
        let Value::Object(map) = &value else {
            return Ok(Matcher::Literal(value));
        };
        if map.len() != 1 {
            return Ok(Matcher::Literal(value));
        }
        let Some((op, arg)) = map.iter().next() else {
            return Ok(Matcher::Literal(value));
        };

        match op.as_str() {
            "$not" => Ok(match arg {
                Value::Array(values) => Matcher::Negation(values.clone()),
                other => Matcher::Negation(vec![other.clone()]),
            }),
            "$gt" | "$gte" | "$lt" | "$lte" => numeric_predicate(op, arg),
            "$regex" => {
                let pattern = arg.as_str().ok_or_else(|| {
                    RestamentError::SpecParse(format!("$regex expects a string, got {}", arg))
                })?;
                let re = Regex::new(pattern).map_err(|e| {
                    RestamentError::SpecParse(format!("invalid $regex {:?}: {}", pattern, e))
                })?;
                Ok(Matcher::described(format!("matching /{}/", pattern), move |v| {
                    v.as_str().map(|s| re.is_match(s)).unwrap_or(false)
                }))
            }
            "$present" => {
                let want = arg.as_bool().ok_or_else(|| {
                    RestamentError::SpecParse(format!("$present expects a boolean, got {}", arg))
                })?;
                let description = if want { "a non-null value" } else { "null" };
                Ok(Matcher::described(description, move |v| v.is_null() != want))
            }
            _ => Ok(Matcher::Literal(value)),
        }
    }

    /// Rendering of the expectation for failure messages
    pub fn describe(&self) -> String {
        match self {
            Matcher::Literal(v) => v.to_string(),
            Matcher::Predicate(p) => p.description().to_string(),
            Matcher::Negation(values) => {
                let rendered: Vec<String> = values.iter().map(Value::to_string).collect();
                format!("not any of [{}]", rendered.join(", "))
            }
        }
    }
}

fn numeric_predicate(op: &str, arg: &Value) -> RunResult<Matcher> {
    let bound = arg.as_f64().ok_or_else(|| {
        RestamentError::SpecParse(format!("{} expects a number, got {}", op, arg))
    })?;

    let (symbol, cmp): (&str, fn(f64, f64) -> bool) = match op {
        "$gt" => (">", |a, b| a > b),
        "$gte" => (">=", |a, b| a >= b),
        "$lt" => ("<", |a, b| a < b),
        _ => ("<=", |a, b| a <= b),
    };

    Ok(Matcher::described(format!("{} {}", symbol, arg), move |v| {
        v.as_f64().map(|actual| cmp(actual, bound)).unwrap_or(false)
    }))
}

impl From<Value> for Matcher {
    fn from(value: Value) -> Self {
        Matcher::Literal(value)
    }
}

macro_rules! literal_from {
    ($($t:ty),*) => {
        $(impl From<$t> for Matcher {
            fn from(value: $t) -> Self {
                Matcher::Literal(Value::from(value))
            }
        })*
    };
}

literal_from!(&str, String, i64, i32, u64, f64, bool);

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Literal(v) => f.debug_tuple("Literal").field(v).finish(),
            Matcher::Predicate(p) => f.debug_tuple("Predicate").field(&p.description).finish(),
            Matcher::Negation(values) => f.debug_tuple("Negation").field(values).finish(),
        }
    }
}

impl<'de> Deserialize<'de> for Matcher {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Matcher::classify(value).map_err(serde::de::Error::custom)
    }
}

/// Structural JSON equality where `1` and `1.0` are the same number
pub fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                x == y
            } else if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                x == y
            } else {
                x.as_f64() == y.as_f64()
            }
        }
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(x, y)| json_eq(x, y))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).map(|other| json_eq(v, other)).unwrap_or(false))
        }
        _ => a == b,
    }
}
