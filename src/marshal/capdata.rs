use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::core::{Result, StoreError, Value};
use crate::handle::Handle;

/// Serialized form of a value: an opaque body plus the vrefs it embeds.
///
/// The engine never looks inside `body`; reference tracking only needs
/// `slots`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapData {
    pub body: String,
    pub slots: Vec<String>,
}

impl CapData {
    pub fn new(body: impl Into<String>, slots: Vec<String>) -> Self {
        Self {
            body: body.into(),
            slots,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Encoded {
    Null,
    Bool(bool),
    Int(i64),
    // stored as raw bits so NaN and -0 survive the round trip
    Float(u64),
    Str(String),
    Sym(String),
    List(Vec<Encoded>),
    Record(BTreeMap<String, Encoded>),
    Tagged { tag: String, payload: Box<Encoded> },
    Slot { index: usize, iface: String },
}

struct SlotTable {
    slots: Vec<String>,
    index: HashMap<String, usize>,
}

impl SlotTable {
    fn intern(&mut self, vref: String) -> usize {
        if let Some(i) = self.index.get(&vref) {
            return *i;
        }
        let i = self.slots.len();
        self.index.insert(vref.clone(), i);
        self.slots.push(vref);
        i
    }
}

fn encode(
    value: &Value,
    table: &mut SlotTable,
    to_slot: &mut dyn FnMut(&Handle) -> Result<String>,
) -> Result<Encoded> {
    Ok(match value {
        Value::Null => Encoded::Null,
        Value::Boolean(b) => Encoded::Bool(*b),
        Value::Integer(i) => Encoded::Int(*i),
        Value::Float(f) => Encoded::Float(f.to_bits()),
        Value::Text(s) => Encoded::Str(s.clone()),
        Value::Symbol(s) => Encoded::Sym(s.clone()),
        Value::List(items) => Encoded::List(
            items
                .iter()
                .map(|item| encode(item, table, to_slot))
                .collect::<Result<Vec<_>>>()?,
        ),
        Value::Record(map) => {
            let mut out = BTreeMap::new();
            for (k, v) in map {
                out.insert(k.clone(), encode(v, table, to_slot)?);
            }
            Encoded::Record(out)
        }
        Value::Tagged(tag, payload) => Encoded::Tagged {
            tag: tag.clone(),
            payload: Box::new(encode(payload, table, to_slot)?),
        },
        Value::Ref(handle) => {
            let vref = to_slot(handle)?;
            Encoded::Slot {
                index: table.intern(vref),
                iface: handle.iface().to_string(),
            }
        }
    })
}

fn decode(
    encoded: &Encoded,
    slots: &[String],
    from_slot: &mut dyn FnMut(&str, &str) -> Result<Value>,
) -> Result<Value> {
    Ok(match encoded {
        Encoded::Null => Value::Null,
        Encoded::Bool(b) => Value::Boolean(*b),
        Encoded::Int(i) => Value::Integer(*i),
        Encoded::Float(bits) => Value::Float(f64::from_bits(*bits)),
        Encoded::Str(s) => Value::Text(s.clone()),
        Encoded::Sym(s) => Value::Symbol(s.clone()),
        Encoded::List(items) => Value::List(
            items
                .iter()
                .map(|item| decode(item, slots, from_slot))
                .collect::<Result<Vec<_>>>()?,
        ),
        Encoded::Record(map) => {
            let mut out = BTreeMap::new();
            for (k, v) in map {
                out.insert(k.clone(), decode(v, slots, from_slot)?);
            }
            Value::Record(out)
        }
        Encoded::Tagged { tag, payload } => {
            Value::Tagged(tag.clone(), Box::new(decode(payload, slots, from_slot)?))
        }
        Encoded::Slot { index, iface } => {
            let vref = slots.get(*index).ok_or_else(|| {
                StoreError::Serialization(format!("slot index {} out of range", index))
            })?;
            from_slot(vref, iface)?
        }
    })
}

/// Serialize `value`, asking `to_slot` for the vref of every embedded
/// reference. Repeated references share one slot.
pub fn serialize_with(
    value: &Value,
    to_slot: &mut dyn FnMut(&Handle) -> Result<String>,
) -> Result<CapData> {
    let mut table = SlotTable {
        slots: Vec::new(),
        index: HashMap::new(),
    };
    let encoded = encode(value, &mut table, to_slot)?;
    Ok(CapData {
        body: serde_json::to_string(&encoded)?,
        slots: table.slots,
    })
}

/// Inverse of [`serialize_with`]; `from_slot` gets each vref and the
/// interface name recorded for it.
pub fn unserialize_with(
    capdata: &CapData,
    from_slot: &mut dyn FnMut(&str, &str) -> Result<Value>,
) -> Result<Value> {
    let encoded: Encoded = serde_json::from_str(&capdata.body)?;
    decode(&encoded, &capdata.slots, from_slot)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_refs(_: &Handle) -> Result<String> {
        Err(StoreError::Serialization("unexpected reference".to_string()))
    }

    #[test]
    fn test_plain_data_has_no_slots() {
        let value = Value::record([
            ("name", Value::from("widget")),
            ("sizes", Value::List(vec![Value::from(1), Value::Float(-0.0)])),
        ]);
        let capdata = serialize_with(&value, &mut no_refs).unwrap();
        assert!(capdata.slots.is_empty());

        let back = unserialize_with(&capdata, &mut |_, _| Ok(Value::Null)).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_body_is_deterministic() {
        let a = Value::record([("b", Value::from(2)), ("a", Value::from(1))]);
        let b = Value::record([("a", Value::from(1)), ("b", Value::from(2))]);
        assert_eq!(
            serialize_with(&a, &mut no_refs).unwrap(),
            serialize_with(&b, &mut no_refs).unwrap()
        );
    }

    #[test]
    fn test_capdata_json() {
        let capdata = CapData::new("\"null\"", vec!["o-1".to_string()]);
        let text = capdata.to_json().unwrap();
        assert_eq!(CapData::from_json(&text).unwrap(), capdata);
    }
}
