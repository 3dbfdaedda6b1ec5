//! Parsing and formatting of vrefs.
//!
//! A vref names an object, promise or device from the point of view of
//! this process:
//!
//! | form       | meaning                                        |
//! |------------|------------------------------------------------|
//! | `o-N`      | imported object (presence)                     |
//! | `o+N`      | ephemeral local object exported by us          |
//! | `o+vK/I`   | virtual object: instance I of kind K           |
//! | `o+dK/I`   | durable object                                 |
//! | `o+dK/I:F` | facet F of a multi-facet instance              |
//! | `p+N/p-N`  | promise allocated here / imported              |
//! | `d-N`      | imported device                                |

use crate::core::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotType {
    Object,
    Promise,
    Device,
}

impl SlotType {
    fn prefix(&self) -> char {
        match self {
            Self::Object => 'o',
            Self::Promise => 'p',
            Self::Device => 'd',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VatSlot {
    pub slot_type: SlotType,
    pub allocated_by_vat: bool,
    pub is_virtual: bool,
    pub durable: bool,
    pub id: u64,
    pub subid: Option<u64>,
    pub facet: Option<usize>,
    pub base_ref: String,
}

impl VatSlot {
    /// True for both virtual and durable objects, i.e. anything whose
    /// state lives in the store rather than in memory.
    pub fn is_stored(&self) -> bool {
        self.is_virtual || self.durable
    }
}

fn parse_number(text: &str, slot: &str) -> Result<u64> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(StoreError::UnknownReference(format!("invalid vat slot {:?}", slot)));
    }
    text.parse::<u64>()
        .map_err(|_| StoreError::UnknownReference(format!("invalid vat slot {:?}", slot)))
}

pub fn parse_vat_slot(slot: &str) -> Result<VatSlot> {
    let invalid = || StoreError::UnknownReference(format!("invalid vat slot {:?}", slot));
    let bytes = slot.as_bytes();
    if bytes.len() < 3 {
        return Err(invalid());
    }
    let slot_type = match bytes[0] {
        b'o' => SlotType::Object,
        b'p' => SlotType::Promise,
        b'd' => SlotType::Device,
        _ => return Err(invalid()),
    };
    let allocated_by_vat = match bytes[1] {
        b'+' => true,
        b'-' => false,
        _ => return Err(invalid()),
    };
    let mut rest = &slot[2..];

    let mut is_virtual = false;
    let mut durable = false;
    if slot_type == SlotType::Object && allocated_by_vat {
        match rest.as_bytes()[0] {
            b'v' => {
                is_virtual = true;
                rest = &rest[1..];
            }
            b'd' => {
                durable = true;
                rest = &rest[1..];
            }
            _ => {}
        }
    }

    let (main, facet) = match rest.split_once(':') {
        Some((main, facet)) => (main, Some(parse_number(facet, slot)? as usize)),
        None => (rest, None),
    };
    let (id, subid) = match main.split_once('/') {
        Some((id, subid)) => (parse_number(id, slot)?, Some(parse_number(subid, slot)?)),
        None => (parse_number(main, slot)?, None),
    };

    let stored = is_virtual || durable;
    if stored && subid.is_none() {
        return Err(invalid());
    }
    if !stored && (subid.is_some() || facet.is_some()) {
        return Err(invalid());
    }

    let base_ref = match slot.split_once(':') {
        Some((base, _)) => base.to_string(),
        None => slot.to_string(),
    };

    Ok(VatSlot {
        slot_type,
        allocated_by_vat,
        is_virtual,
        durable,
        id,
        subid,
        facet,
        base_ref,
    })
}

pub fn make_vat_slot(slot_type: SlotType, allocated_by_vat: bool, id: u64) -> String {
    let dir = if allocated_by_vat { '+' } else { '-' };
    format!("{}{}{}", slot_type.prefix(), dir, id)
}

pub fn make_base_ref(kind_id: u64, instance_id: u64, durable: bool) -> String {
    let flavor = if durable { 'd' } else { 'v' };
    format!("o+{}{}/{}", flavor, kind_id, instance_id)
}

pub fn make_facet_ref(base_ref: &str, facet: usize) -> String {
    format!("{}:{}", base_ref, facet)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_import() {
        let p = parse_vat_slot("o-12").unwrap();
        assert_eq!(p.slot_type, SlotType::Object);
        assert!(!p.allocated_by_vat);
        assert!(!p.is_stored());
        assert_eq!(p.id, 12);
        assert_eq!(p.base_ref, "o-12");
    }

    #[test]
    fn test_parse_durable_facet() {
        let p = parse_vat_slot("o+d14/3:1").unwrap();
        assert!(p.durable);
        assert!(!p.is_virtual);
        assert_eq!(p.id, 14);
        assert_eq!(p.subid, Some(3));
        assert_eq!(p.facet, Some(1));
        assert_eq!(p.base_ref, "o+d14/3");
    }

    #[test]
    fn test_parse_promise_and_device() {
        assert_eq!(parse_vat_slot("p+5").unwrap().slot_type, SlotType::Promise);
        let d = parse_vat_slot("d-2").unwrap();
        assert_eq!(d.slot_type, SlotType::Device);
        assert!(!d.allocated_by_vat);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_vat_slot("x+1").is_err());
        assert!(parse_vat_slot("o+v10").is_err());
        assert!(parse_vat_slot("o-1/2").is_err());
        assert!(parse_vat_slot("o+").is_err());
        assert!(parse_vat_slot("o+1:0").is_err());
    }

    #[test]
    fn test_make_refs() {
        assert_eq!(make_vat_slot(SlotType::Promise, true, 7), "p+7");
        assert_eq!(make_base_ref(10, 2, false), "o+v10/2");
        assert_eq!(make_facet_ref("o+d10/2", 1), "o+d10/2:1");
    }
}
