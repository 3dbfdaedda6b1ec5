//! Order-preserving string encoding of scalar collection keys.
//!
//! Every encoding starts with one character naming the pass style, and
//! within a style the byte order of encodings matches rank order. This is
//! what makes a store's range walk come out sorted.

use crate::core::{PassStyle, Result, StoreError, Value};
use crate::handle::Handle;

pub const ORDINAL_WIDTH: usize = 10;

/// Prefix character for each style that can be a key.
pub fn key_prefix(style: PassStyle) -> Option<char> {
    match style {
        PassStyle::Boolean => Some('b'),
        PassStyle::Float => Some('f'),
        PassStyle::Integer => Some('p'),
        PassStyle::Remotable => Some('r'),
        PassStyle::String => Some('s'),
        PassStyle::Null => Some('v'),
        PassStyle::Symbol => Some('y'),
        _ => None,
    }
}

fn encode_float(f: f64) -> String {
    let f = if f.is_nan() {
        f64::NAN
    } else if f == 0.0 {
        0.0
    } else {
        f
    };
    let bits = f.to_bits();
    let ordered = if bits >> 63 == 1 { !bits } else { bits ^ (1 << 63) };
    format!("f{:016x}", ordered)
}

fn decode_float(hex: &str) -> Result<f64> {
    let ordered = u64::from_str_radix(hex, 16)
        .map_err(|_| StoreError::Serialization(format!("bad float key {:?}", hex)))?;
    let bits = if ordered >> 63 == 1 { ordered ^ (1 << 63) } else { !ordered };
    Ok(f64::from_bits(bits))
}

fn encode_integer(i: i64) -> String {
    format!("p{:016x}", (i as u64) ^ (1 << 63))
}

fn decode_integer(hex: &str) -> Result<i64> {
    let biased = u64::from_str_radix(hex, 16)
        .map_err(|_| StoreError::Serialization(format!("bad integer key {:?}", hex)))?;
    Ok((biased ^ (1 << 63)) as i64)
}

pub fn zero_pad(ordinal: u64) -> String {
    format!("{:0width$}", ordinal, width = ORDINAL_WIDTH)
}

pub fn encode_remotable_key(ordinal: u64, vref: &str) -> String {
    format!("r{}:{}", zero_pad(ordinal), vref)
}

pub fn is_encoded_remotable(db_key: &str) -> bool {
    db_key.starts_with('r')
}

/// Encode a key, delegating references to `encode_remotable`.
pub fn encode_key(
    key: &Value,
    encode_remotable: &mut dyn FnMut(&Handle) -> Result<String>,
) -> Result<String> {
    Ok(match key {
        Value::Null => "v".to_string(),
        Value::Boolean(b) => format!("b{}", b),
        Value::Integer(i) => encode_integer(*i),
        Value::Float(f) => encode_float(*f),
        Value::Text(s) => format!("s{}", s),
        Value::Symbol(s) => format!("y{}", s),
        Value::Ref(handle) if !handle.is_promise() => encode_remotable(handle)?,
        other => {
            return Err(StoreError::TypeMismatch(format!(
                "{} {} is not a scalar key",
                other.type_name(),
                other
            )));
        }
    })
}

/// Encode a key that cannot contain references.
pub fn encode_plain_key(key: &Value) -> Result<String> {
    encode_key(key, &mut |_| {
        Err(StoreError::TypeMismatch(
            "reference keys need a collection ordinal".to_string(),
        ))
    })
}

/// Decode a key, delegating `r` keys to `decode_remotable` with the vref.
pub fn decode_key(
    db_key: &str,
    decode_remotable: &mut dyn FnMut(&str) -> Result<Value>,
) -> Result<Value> {
    let mut chars = db_key.chars();
    let prefix = chars
        .next()
        .ok_or_else(|| StoreError::Serialization("empty key".to_string()))?;
    let rest = chars.as_str();
    Ok(match prefix {
        'v' => Value::Null,
        'b' => match rest {
            "true" => Value::Boolean(true),
            "false" => Value::Boolean(false),
            _ => return Err(StoreError::Serialization(format!("bad boolean key {:?}", db_key))),
        },
        'p' => Value::Integer(decode_integer(rest)?),
        'f' => Value::Float(decode_float(rest)?),
        's' => Value::Text(rest.to_string()),
        'y' => Value::Symbol(rest.to_string()),
        'r' => {
            let (_, vref) = rest.split_once(':').ok_or_else(|| {
                StoreError::Serialization(format!("bad reference key {:?}", db_key))
            })?;
            decode_remotable(vref)?
        }
        _ => return Err(StoreError::Serialization(format!("unknown key encoding {:?}", db_key))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_plain(key: &str) -> Value {
        decode_key(key, &mut |_| Ok(Value::Null)).unwrap()
    }

    #[test]
    fn test_integer_encoding_sorts_by_value() {
        let values = [i64::MIN, -1000, -1, 0, 1, 29, 47, i64::MAX];
        let encoded: Vec<String> = values
            .iter()
            .map(|v| encode_plain_key(&Value::from(*v)).unwrap())
            .collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
        for (v, e) in values.iter().zip(&encoded) {
            assert_eq!(decode_plain(e), Value::from(*v));
        }
    }

    #[test]
    fn test_float_encoding_sorts_by_value() {
        let values = [f64::NEG_INFINITY, -2.5, -0.0001, 0.0, 1.5, 1e300, f64::INFINITY];
        let encoded: Vec<String> = values
            .iter()
            .map(|v| encode_plain_key(&Value::Float(*v)).unwrap())
            .collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
        assert_eq!(decode_plain(&encoded[1]), Value::Float(-2.5));
    }

    #[test]
    fn test_negative_zero_normalizes() {
        assert_eq!(
            encode_plain_key(&Value::Float(-0.0)).unwrap(),
            encode_plain_key(&Value::Float(0.0)).unwrap()
        );
    }

    #[test]
    fn test_string_and_misc_keys() {
        assert_eq!(encode_plain_key(&Value::from("abc")).unwrap(), "sabc");
        assert_eq!(encode_plain_key(&Value::Null).unwrap(), "v");
        assert_eq!(encode_plain_key(&Value::from(true)).unwrap(), "btrue");
        assert_eq!(decode_plain("sabc"), Value::from("abc"));
        assert_eq!(decode_plain("yfoo"), Value::symbol("foo"));
    }

    #[test]
    fn test_remotable_key_layout() {
        assert_eq!(encode_remotable_key(3, "o+d12/1:0"), "r0000000003:o+d12/1:0");
        assert!(is_encoded_remotable("r0000000003:o-4"));
        let decoded = decode_key("r0000000003:o+d12/1:0", &mut |vref| Ok(Value::from(vref)))
            .unwrap();
        assert_eq!(decoded, Value::from("o+d12/1:0"));
    }

    #[test]
    fn test_non_scalar_rejected() {
        assert!(encode_plain_key(&Value::List(vec![])).is_err());
    }
}
