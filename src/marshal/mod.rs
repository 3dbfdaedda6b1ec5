pub mod capdata;
pub mod encode_key;

pub use capdata::{CapData, serialize_with, unserialize_with};
pub use encode_key::{
    decode_key, encode_key, encode_plain_key, encode_remotable_key, is_encoded_remotable,
    key_prefix, zero_pad,
};
