use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::handle::Handle;

/// The structural category of a passable value.
///
/// Patterns match on pass styles (`Pattern::Kind`) and key encoding uses
/// one prefix character per scalar style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PassStyle {
    Null,
    Boolean,
    Integer,
    Float,
    String,
    Symbol,
    Remotable,
    Promise,
    List,
    Record,
    Tagged,
}

impl PassStyle {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::String => "string",
            Self::Symbol => "symbol",
            Self::Remotable => "remotable",
            Self::Promise => "promise",
            Self::List => "list",
            Self::Record => "record",
            Self::Tagged => "tagged",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let style = match name {
            "null" => Self::Null,
            "boolean" => Self::Boolean,
            "integer" => Self::Integer,
            "float" => Self::Float,
            "string" => Self::String,
            "symbol" => Self::Symbol,
            "remotable" => Self::Remotable,
            "promise" => Self::Promise,
            "list" => Self::List,
            "record" => Self::Record,
            "tagged" => Self::Tagged,
            _ => return None,
        };
        Some(style)
    }

    /// Scalars are the styles usable as collection keys.
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Self::Null
                | Self::Boolean
                | Self::Integer
                | Self::Float
                | Self::String
                | Self::Symbol
                | Self::Remotable
        )
    }
}

/// A passable value: plain data plus references to objects.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Symbol(String),
    List(Vec<Value>),
    Record(BTreeMap<String, Value>),
    Tagged(String, Box<Value>),
    Ref(Handle),
}

impl Value {
    pub fn pass_style(&self) -> PassStyle {
        match self {
            Self::Null => PassStyle::Null,
            Self::Boolean(_) => PassStyle::Boolean,
            Self::Integer(_) => PassStyle::Integer,
            Self::Float(_) => PassStyle::Float,
            Self::Text(_) => PassStyle::String,
            Self::Symbol(_) => PassStyle::Symbol,
            Self::List(_) => PassStyle::List,
            Self::Record(_) => PassStyle::Record,
            Self::Tagged(_, _) => PassStyle::Tagged,
            Self::Ref(handle) if handle.is_promise() => PassStyle::Promise,
            Self::Ref(_) => PassStyle::Remotable,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.pass_style().name()
    }

    pub fn is_scalar(&self) -> bool {
        self.pass_style().is_scalar()
    }

    pub fn record<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Self::Record(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn symbol(name: &str) -> Self {
        Self::Symbol(name.to_string())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<&Handle> {
        match self {
            Self::Ref(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Record(map) => Some(map),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Rank comparison between values of the same pass style.
    ///
    /// Values of different styles are not comparable and yield `None`;
    /// so do references, which only have identity.
    pub fn rank_compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            (Self::Boolean(a), Self::Boolean(b)) => Some(a.cmp(b)),
            (Self::Integer(a), Self::Integer(b)) => Some(a.cmp(b)),
            (Self::Float(a), Self::Float(b)) => {
                // NaN sorts after every other float
                match (a.is_nan(), b.is_nan()) {
                    (true, true) => Some(Ordering::Equal),
                    (true, false) => Some(Ordering::Greater),
                    (false, true) => Some(Ordering::Less),
                    (false, false) => a.partial_cmp(b),
                }
            }
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (Self::Symbol(a), Self::Symbol(b)) => Some(a.cmp(b)),
            (Self::List(a), Self::List(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.rank_compare(y)? {
                        Ordering::Equal => continue,
                        other => return Some(other),
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => (a.is_nan() && b.is_nan()) || a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Symbol(a), Self::Symbol(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Record(a), Self::Record(b)) => a == b,
            (Self::Tagged(ta, pa), Self::Tagged(tb, pb)) => ta == tb && pa == pb,
            (Self::Ref(a), Self::Ref(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Boolean(b) => write!(f, "{}", b),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::Text(s) => write!(f, "{:?}", s),
            Self::Symbol(s) => write!(f, "\"[Symbol({})]\"", s),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Self::Record(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{:?}:{}", k, v)?;
                }
                write!(f, "}}")
            }
            Self::Tagged(tag, payload) => write!(f, "{}({})", tag, payload),
            Self::Ref(handle) => write!(f, "\"[Alleged: {}]\"", handle.iface()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Integer(i as i64)
    }
}

impl From<u64> for Value {
    fn from(i: u64) -> Self {
        Self::Integer(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Handle> for Value {
    fn from(h: Handle) -> Self {
        Self::Ref(h)
    }
}

impl From<&Handle> for Value {
    fn from(h: &Handle) -> Self {
        Self::Ref(h.clone())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}
