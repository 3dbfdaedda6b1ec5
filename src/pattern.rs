use std::collections::BTreeMap;
use std::fmt;

use crate::core::{PassStyle, Result, StoreError, Value};
use crate::marshal::{encode_plain_key, key_prefix};

/// Upper bound used when a rank cover has to reach past every key of a
/// given prefix.
const COVER_TOP: char = '\u{10FFFF}';

/// Shape constraint for keys, values and state properties.
#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Any,
    Scalar,
    Kind(PassStyle),
    Eq(Value),
    Lt(Value),
    Lte(Value),
    Gt(Value),
    Gte(Value),
    Not(Box<Pattern>),
    And(Vec<Pattern>),
    Or(Vec<Pattern>),
    /// A record with exactly these properties.
    Record(BTreeMap<String, Pattern>),
    List(Vec<Pattern>),
}

impl Pattern {
    pub fn string() -> Self {
        Self::Kind(PassStyle::String)
    }

    pub fn integer() -> Self {
        Self::Kind(PassStyle::Integer)
    }

    pub fn float() -> Self {
        Self::Kind(PassStyle::Float)
    }

    pub fn boolean() -> Self {
        Self::Kind(PassStyle::Boolean)
    }

    pub fn remotable() -> Self {
        Self::Kind(PassStyle::Remotable)
    }

    pub fn eq(value: impl Into<Value>) -> Self {
        Self::Eq(value.into())
    }

    pub fn lt(value: impl Into<Value>) -> Self {
        Self::Lt(value.into())
    }

    pub fn lte(value: impl Into<Value>) -> Self {
        Self::Lte(value.into())
    }

    pub fn gt(value: impl Into<Value>) -> Self {
        Self::Gt(value.into())
    }

    pub fn gte(value: impl Into<Value>) -> Self {
        Self::Gte(value.into())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(pattern: Pattern) -> Self {
        Self::Not(Box::new(pattern))
    }

    pub fn record<K, I>(props: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Pattern)>,
    {
        Self::Record(props.into_iter().map(|(k, p)| (k.into(), p)).collect())
    }

    pub fn matches(&self, value: &Value) -> bool {
        self.mismatch(value).is_none()
    }

    /// Fail with `"<label>: <reason>"` unless `value` matches.
    pub fn must_match(&self, value: &Value, label: &str) -> Result<()> {
        match self.mismatch(value) {
            None => Ok(()),
            Some(reason) => Err(StoreError::TypeMismatch(format!("{}: {}", label, reason))),
        }
    }

    fn compare_reason(value: &Value, bound: &Value, op: &str, ok: fn(std::cmp::Ordering) -> bool) -> Option<String> {
        match value.rank_compare(bound) {
            Some(ord) if ok(ord) => None,
            _ => Some(format!("{} - Must be {} {}", value, op, bound)),
        }
    }

    fn mismatch(&self, value: &Value) -> Option<String> {
        use std::cmp::Ordering::*;
        match self {
            Self::Any => None,
            Self::Scalar => {
                if value.is_scalar() {
                    None
                } else {
                    Some(format!("{} {} - Must be a scalar", value.type_name(), value))
                }
            }
            Self::Kind(style) => {
                if value.pass_style() == *style {
                    None
                } else {
                    Some(format!(
                        "{} {} - Must be a {}",
                        value.type_name(),
                        value,
                        style.name()
                    ))
                }
            }
            Self::Eq(expected) => {
                if value == expected {
                    None
                } else {
                    Some(format!("{} - Must be: {}", value, expected))
                }
            }
            Self::Lt(bound) => Self::compare_reason(value, bound, "<", |o| o == Less),
            Self::Lte(bound) => Self::compare_reason(value, bound, "<=", |o| o != Greater),
            Self::Gt(bound) => Self::compare_reason(value, bound, ">", |o| o == Greater),
            Self::Gte(bound) => Self::compare_reason(value, bound, ">=", |o| o != Less),
            Self::Not(inner) => {
                if inner.matches(value) {
                    Some(format!("{} - Must fail negated pattern: {}", value, inner))
                } else {
                    None
                }
            }
            Self::And(patterns) => patterns.iter().find_map(|p| p.mismatch(value)),
            Self::Or(patterns) => {
                if patterns.iter().any(|p| p.matches(value)) {
                    None
                } else {
                    Some(format!("{} - Must match one of {}", value, Self::list_display(patterns)))
                }
            }
            Self::Record(props) => {
                let Some(record) = value.as_record() else {
                    return Some(format!("{} {} - Must be a record", value.type_name(), value));
                };
                if record.len() != props.len() || !record.keys().all(|k| props.contains_key(k)) {
                    let names: Vec<&str> = props.keys().map(String::as_str).collect();
                    return Some(format!("{} - Must have properties [{}]", value, names.join(",")));
                }
                props.iter().find_map(|(name, pattern)| {
                    record
                        .get(name)
                        .and_then(|v| pattern.mismatch(v))
                        .map(|reason| format!("{}: {}", name, reason))
                })
            }
            Self::List(patterns) => {
                let Some(items) = value.as_list() else {
                    return Some(format!("{} {} - Must be a list", value.type_name(), value));
                };
                if items.len() != patterns.len() {
                    return Some(format!("{} - Must have length {}", value, patterns.len()));
                }
                items
                    .iter()
                    .zip(patterns)
                    .enumerate()
                    .find_map(|(i, (v, p))| p.mismatch(v).map(|r| format!("[{}]: {}", i, r)))
            }
        }
    }

    fn list_display(patterns: &[Pattern]) -> String {
        let parts: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        format!("[{}]", parts.join(","))
    }

    /// Bounds `[start, end)` on encoded keys that contain every key this
    /// pattern could match. Candidates inside the cover still have to be
    /// checked with [`Pattern::matches`].
    pub fn rank_cover(&self) -> (String, String) {
        let everything = || (String::new(), "{".to_string());
        let style_cover = |value: &Value| {
            key_prefix(value.pass_style())
                .map(|c| (c.to_string(), format!("{}{}", c, COVER_TOP)))
        };
        match self {
            Self::Kind(style) => match key_prefix(*style) {
                Some(c) => (c.to_string(), format!("{}{}", c, COVER_TOP)),
                None => everything(),
            },
            Self::Eq(v) => match encode_plain_key(v) {
                Ok(enc) => (enc.clone(), format!("{}{}", enc, COVER_TOP)),
                Err(_) => style_cover(v).unwrap_or_else(everything),
            },
            Self::Lt(v) | Self::Lte(v) => match (style_cover(v), encode_plain_key(v)) {
                (Some((start, _)), Ok(enc)) => {
                    let end = if matches!(self, Self::Lt(_)) {
                        enc
                    } else {
                        format!("{}{}", enc, COVER_TOP)
                    };
                    (start, end)
                }
                (Some(cover), Err(_)) => cover,
                (None, _) => everything(),
            },
            Self::Gt(v) | Self::Gte(v) => match (style_cover(v), encode_plain_key(v)) {
                (Some((_, end)), Ok(enc)) => (enc, end),
                (Some(cover), Err(_)) => cover,
                (None, _) => everything(),
            },
            Self::And(patterns) if !patterns.is_empty() => {
                let covers: Vec<(String, String)> = patterns.iter().map(|p| p.rank_cover()).collect();
                let start = covers.iter().map(|c| c.0.clone()).max().unwrap_or_default();
                let end = covers.iter().map(|c| c.1.clone()).min().unwrap_or_else(|| "{".to_string());
                (start, end)
            }
            Self::Or(patterns) if !patterns.is_empty() => {
                let covers: Vec<(String, String)> = patterns.iter().map(|p| p.rank_cover()).collect();
                let start = covers.iter().map(|c| c.0.clone()).min().unwrap_or_default();
                let end = covers.iter().map(|c| c.1.clone()).max().unwrap_or_else(|| "{".to_string());
                (start, end)
            }
            _ => everything(),
        }
    }

    /// Passable form, used to persist schemata and state shapes.
    pub fn to_value(&self) -> Value {
        let tagged = |tag: &str, payload: Value| Value::Tagged(tag.to_string(), Box::new(payload));
        match self {
            Self::Any => tagged("match:any", Value::Null),
            Self::Scalar => tagged("match:scalar", Value::Null),
            Self::Kind(style) => tagged("match:kind", Value::from(style.name())),
            Self::Eq(v) => tagged("match:eq", v.clone()),
            Self::Lt(v) => tagged("match:lt", v.clone()),
            Self::Lte(v) => tagged("match:lte", v.clone()),
            Self::Gt(v) => tagged("match:gt", v.clone()),
            Self::Gte(v) => tagged("match:gte", v.clone()),
            Self::Not(p) => tagged("match:not", p.to_value()),
            Self::And(ps) => tagged("match:and", Value::List(ps.iter().map(Pattern::to_value).collect())),
            Self::Or(ps) => tagged("match:or", Value::List(ps.iter().map(Pattern::to_value).collect())),
            Self::Record(props) => tagged(
                "match:record",
                Value::Record(props.iter().map(|(k, p)| (k.clone(), p.to_value())).collect()),
            ),
            Self::List(ps) => tagged("match:list", Value::List(ps.iter().map(Pattern::to_value).collect())),
        }
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let bad = || StoreError::Serialization(format!("not a pattern: {}", value));
        let Value::Tagged(tag, payload) = value else {
            return Err(bad());
        };
        let list = |payload: &Value| -> Result<Vec<Pattern>> {
            payload
                .as_list()
                .ok_or_else(bad)?
                .iter()
                .map(Pattern::from_value)
                .collect()
        };
        Ok(match tag.as_str() {
            "match:any" => Self::Any,
            "match:scalar" => Self::Scalar,
            "match:kind" => {
                let name = payload.as_str().ok_or_else(bad)?;
                Self::Kind(PassStyle::from_name(name).ok_or_else(bad)?)
            }
            "match:eq" => Self::Eq((**payload).clone()),
            "match:lt" => Self::Lt((**payload).clone()),
            "match:lte" => Self::Lte((**payload).clone()),
            "match:gt" => Self::Gt((**payload).clone()),
            "match:gte" => Self::Gte((**payload).clone()),
            "match:not" => Self::Not(Box::new(Self::from_value(payload)?)),
            "match:and" => Self::And(list(payload)?),
            "match:or" => Self::Or(list(payload)?),
            "match:record" => {
                let record = payload.as_record().ok_or_else(bad)?;
                let mut props = BTreeMap::new();
                for (k, v) in record {
                    props.insert(k.clone(), Self::from_value(v)?);
                }
                Self::Record(props)
            }
            "match:list" => Self::List(list(payload)?),
            _ => return Err(bad()),
        })
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "\"[match:any]\""),
            Self::Scalar => write!(f, "\"[match:scalar]\""),
            Self::Kind(style) => write!(f, "\"[match:{}]\"", style.name()),
            Self::Eq(v) => write!(f, "{}", v),
            Self::Lt(v) => write!(f, "\"[match:lt {}]\"", v),
            Self::Lte(v) => write!(f, "\"[match:lte {}]\"", v),
            Self::Gt(v) => write!(f, "\"[match:gt {}]\"", v),
            Self::Gte(v) => write!(f, "\"[match:gte {}]\"", v),
            Self::Not(p) => write!(f, "\"[match:not {}]\"", p),
            Self::And(ps) => write!(f, "\"[match:and {}]\"", Self::list_display(ps)),
            Self::Or(ps) => write!(f, "\"[match:or {}]\"", Self::list_display(ps)),
            Self::Record(props) => {
                write!(f, "{{")?;
                for (i, (k, p)) in props.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{:?}:{}", k, p)?;
                }
                write!(f, "}}")
            }
            Self::List(ps) => write!(f, "{}", Self::list_display(ps)),
        }
    }
}

impl From<Value> for Pattern {
    /// A plain value used as a pattern matches only itself.
    fn from(value: Value) -> Self {
        Self::Eq(value)
    }
}
