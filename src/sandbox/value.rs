//! Runtime values for the sandbox evaluator.
//!
//! The value model is a small EDN-flavoured universe: nil, booleans,
//! numbers, strings, keywords, vectors, string-keyed maps, sets, dates,
//! lambdas and atom cells. Values cross the tool boundary as JSON, so both
//! conversions live here.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;

use super::expr::Expr;

/// A user-defined function: parameter names plus body forms.
#[derive(Debug)]
pub struct Lambda {
    /// Parameter names in order.
    pub params: Vec<String>,
    /// Body forms, evaluated in sequence.
    pub body: Vec<Expr>,
}

/// A sandbox runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    /// The absent value.
    Nil,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating-point number.
    Float(f64),
    /// String.
    Str(String),
    /// Keyword (`:name`), used as map keys and accessors.
    Keyword(String),
    /// Ordered sequence.
    List(Vec<Value>),
    /// String-keyed map.
    Map(BTreeMap<String, Value>),
    /// Set under the total value order.
    Set(BTreeSet<Value>),
    /// Calendar date.
    Date(NaiveDate),
    /// User-defined function.
    Lambda(Arc<Lambda>),
    /// Mutable atom cell.
    Cell(Arc<Mutex<Value>>),
}

impl Value {
    /// Truthiness: only `nil` and `false` are falsey.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Self::Nil | Self::Bool(false))
    }

    /// Short type label for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::Keyword(_) => "keyword",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Set(_) => "set",
            Self::Date(_) => "date",
            Self::Lambda(_) => "fn",
            Self::Cell(_) => "atom",
        }
    }

    /// Numeric view, promoting ints to floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Convert from a JSON value (tool results enter this way).
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Nil,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Self::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Self::List(items.iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert to a JSON value (final answers leave this way).
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Nil => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => {
                serde_json::Number::from_f64(*f).map_or(serde_json::Value::Null, serde_json::Value::Number)
            }
            Self::Str(s) => serde_json::Value::String(s.clone()),
            Self::Keyword(k) => serde_json::Value::String(format!(":{k}")),
            Self::List(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_json).collect())
            }
            Self::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Self::Set(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_json).collect())
            }
            Self::Date(d) => serde_json::Value::String(d.format("%Y-%m-%d").to_string()),
            Self::Lambda(_) => serde_json::Value::String("#fn".to_owned()),
            Self::Cell(cell) => cell
                .lock()
                .map(|inner| inner.to_json())
                .unwrap_or(serde_json::Value::Null),
        }
    }

    /// Data rendering: strings quoted, keywords with a leading colon.
    pub fn render(&self) -> String {
        match self {
            Self::Nil => "nil".to_owned(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => format_float(*f),
            Self::Str(s) => format!("{s:?}"),
            Self::Keyword(k) => format!(":{k}"),
            Self::List(items) => {
                let inner: Vec<String> = items.iter().map(Self::render).collect();
                format!("[{}]", inner.join(" "))
            }
            Self::Map(map) => {
                let inner: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!(":{k} {}", v.render()))
                    .collect();
                format!("{{{}}}", inner.join(" "))
            }
            Self::Set(items) => {
                let inner: Vec<String> = items.iter().map(Self::render).collect();
                format!("#{{{}}}", inner.join(" "))
            }
            Self::Date(d) => format!("#date \"{}\"", d.format("%Y-%m-%d")),
            Self::Lambda(_) => "#fn".to_owned(),
            Self::Cell(cell) => cell
                .lock()
                .map(|inner| format!("#atom {}", inner.render()))
                .unwrap_or_else(|_| "#atom ?".to_owned()),
        }
    }

    /// Raw rendering for `print`: strings without quotes.
    pub fn render_raw(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            other => other.render(),
        }
    }
}

fn format_float(f: f64) -> String {
    if f.fract() == 0.0 && f.is_finite() {
        format!("{f:.1}")
    } else {
        f.to_string()
    }
}

// ---------------------------------------------------------------------------
// Equality and total order
// ---------------------------------------------------------------------------

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b) == std::cmp::Ordering::Equal,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Keyword(a), Self::Keyword(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Set(a), Self::Set(b)) => a == b,
            (Self::Date(a), Self::Date(b)) => a == b,
            (Self::Lambda(a), Self::Lambda(b)) => Arc::ptr_eq(a, b),
            (Self::Cell(a), Self::Cell(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Value {
    fn type_rank(&self) -> u8 {
        match self {
            Self::Nil => 0,
            Self::Bool(_) => 1,
            Self::Int(_) => 2,
            Self::Float(_) => 3,
            Self::Str(_) => 4,
            Self::Keyword(_) => 5,
            Self::Date(_) => 6,
            Self::List(_) => 7,
            Self::Map(_) => 8,
            Self::Set(_) => 9,
            Self::Lambda(_) => 10,
            Self::Cell(_) => 11,
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    /// Total order so values can live in sets: ranked by type, then by
    /// content. Lambdas and cells order by pointer address.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        let rank = self.type_rank().cmp(&other.type_rank());
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            (Self::Keyword(a), Self::Keyword(b)) => a.cmp(b),
            (Self::Date(a), Self::Date(b)) => a.cmp(b),
            (Self::List(a), Self::List(b)) => a.cmp(b),
            (Self::Map(a), Self::Map(b)) => a.cmp(b),
            (Self::Set(a), Self::Set(b)) => a.cmp(b),
            (Self::Lambda(a), Self::Lambda(b)) => {
                (Arc::as_ptr(a) as usize).cmp(&(Arc::as_ptr(b) as usize))
            }
            (Self::Cell(a), Self::Cell(b)) => {
                (Arc::as_ptr(a) as usize).cmp(&(Arc::as_ptr(b) as usize))
            }
            _ => std::cmp::Ordering::Equal,
        }
    }
}
