pub mod error;
pub mod slots;
pub mod value;

pub use error::{Result, StoreError};
pub use slots::{SlotType, VatSlot, make_base_ref, make_facet_ref, make_vat_slot, parse_vat_slot};
pub use value::{PassStyle, Value};
