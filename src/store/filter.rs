//! Boolean filter expressions over derived index values.
//!
//! Filters render to LDAP-style text for logs, for example
//! `(|(!(v=*))(v<=1))`. Stores evaluate the tree itself, never the text.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Present(String),
    Eq(String, Value),
    Le(String, Value),
    Ge(String, Value),
}

impl Filter {
    pub fn present(field: impl Into<String>) -> Self {
        Filter::Present(field.into())
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Le(field.into(), value.into())
    }

    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Ge(field.into(), value.into())
    }

    pub fn not(inner: Filter) -> Self {
        Filter::Not(Box::new(inner))
    }

    /// Every field name the expression refers to.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out.sort_unstable();
        out.dedup();
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Filter::And(items) | Filter::Or(items) => {
                items.iter().for_each(|f| f.collect_fields(out))
            }
            Filter::Not(inner) => inner.collect_fields(out),
            Filter::Present(field)
            | Filter::Eq(field, _)
            | Filter::Le(field, _)
            | Filter::Ge(field, _) => out.push(field),
        }
    }

    /// Evaluate against a record's index values.
    pub fn matches(&self, attrs: &BTreeMap<String, Value>) -> bool {
        match self {
            Filter::And(items) => items.iter().all(|f| f.matches(attrs)),
            Filter::Or(items) => items.iter().any(|f| f.matches(attrs)),
            Filter::Not(inner) => !inner.matches(attrs),
            Filter::Present(field) => attrs.contains_key(field),
            Filter::Eq(field, want) => any_value(attrs.get(field), |v| v == want),
            Filter::Le(field, bound) => any_value(attrs.get(field), |v| {
                matches!(compare(v, bound), Some(Ordering::Less | Ordering::Equal))
            }),
            Filter::Ge(field, bound) => any_value(attrs.get(field), |v| {
                matches!(compare(v, bound), Some(Ordering::Greater | Ordering::Equal))
            }),
        }
    }
}

fn any_value(attr: Option<&Value>, pred: impl Fn(&Value) -> bool) -> bool {
    match attr {
        None => false,
        Some(Value::Array(items)) => items.iter().any(pred),
        Some(v) => pred(v),
    }
}

/// Numbers compare numerically, strings lexically; mixed types never compare.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

// =============================================================================
// Rendering
// =============================================================================

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(items) => write_group(f, '&', items),
            Filter::Or(items) => write_group(f, '|', items),
            Filter::Not(inner) => write!(f, "(!{inner})"),
            Filter::Present(field) => write!(f, "({field}=*)"),
            Filter::Eq(field, v) => write!(f, "({field}={})", render_value(v)),
            Filter::Le(field, v) => write!(f, "({field}<={})", render_value(v)),
            Filter::Ge(field, v) => write!(f, "({field}>={})", render_value(v)),
        }
    }
}

fn write_group(f: &mut fmt::Formatter<'_>, op: char, items: &[Filter]) -> fmt::Result {
    write!(f, "({op}")?;
    for item in items {
        write!(f, "{item}")?;
    }
    f.write_str(")")
}

fn render_value(v: &Value) -> String {
    let raw = match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '(' | ')' | '*' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
