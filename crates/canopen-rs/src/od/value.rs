// crates/canopen-rs/src/od/value.rs

use crate::hal::CanopenError;
use crate::types::{INTEGER8, INTEGER16, INTEGER32, UNSIGNED8, UNSIGNED16, UNSIGNED32};
use alloc::{string::String, vec::Vec};

/// Represents any value that can be stored in an Object Dictionary entry.
///
/// The variant carries both the size class and the signedness, so entries
/// need no separate format bits. Strings and domains are variable-sized.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectValue {
    Unsigned8(UNSIGNED8),
    Unsigned16(UNSIGNED16),
    Unsigned32(UNSIGNED32),
    Integer8(INTEGER8),
    Integer16(INTEGER16),
    Integer32(INTEGER32),
    VisibleString(String),
    Domain(Vec<u8>),
}

impl ObjectValue {
    /// Current size of the value in bytes.
    pub fn size(&self) -> usize {
        match self {
            ObjectValue::Unsigned8(_) | ObjectValue::Integer8(_) => 1,
            ObjectValue::Unsigned16(_) | ObjectValue::Integer16(_) => 2,
            ObjectValue::Unsigned32(_) | ObjectValue::Integer32(_) => 4,
            ObjectValue::VisibleString(s) => s.len(),
            ObjectValue::Domain(d) => d.len(),
        }
    }

    /// True for the fixed-size numeric variants.
    pub fn is_numeric(&self) -> bool {
        !matches!(
            self,
            ObjectValue::VisibleString(_) | ObjectValue::Domain(_)
        )
    }

    /// Serializes the inner value into a little-endian byte vector.
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            ObjectValue::Unsigned8(v) => v.to_le_bytes().to_vec(),
            ObjectValue::Unsigned16(v) => v.to_le_bytes().to_vec(),
            ObjectValue::Unsigned32(v) => v.to_le_bytes().to_vec(),
            ObjectValue::Integer8(v) => v.to_le_bytes().to_vec(),
            ObjectValue::Integer16(v) => v.to_le_bytes().to_vec(),
            ObjectValue::Integer32(v) => v.to_le_bytes().to_vec(),
            ObjectValue::VisibleString(v) => v.as_bytes().to_vec(),
            ObjectValue::Domain(v) => v.clone(),
        }
    }

    /// Deserializes a byte slice into a new ObjectValue, using an existing
    /// ObjectValue as a type template. Numeric variants require an exact
    /// length match; strings and domains take the slice as-is.
    pub fn deserialize(data: &[u8], type_template: &ObjectValue) -> Result<Self, CanopenError> {
        // Helper macro to handle fixed-size deserialization
        macro_rules! deserialize_fixed {
            ($data:expr, $template:expr, $variant:path, $type:ty) => {
                match $data.try_into() {
                    Ok(bytes) => Ok($variant(<$type>::from_le_bytes(bytes))),
                    Err(_) if $data.len() > $template.size() => Err(CanopenError::LengthTooHigh),
                    Err(_) => Err(CanopenError::LengthTooLow),
                }
            };
        }

        match type_template {
            ObjectValue::Unsigned8(_) => {
                deserialize_fixed!(data, type_template, ObjectValue::Unsigned8, u8)
            }
            ObjectValue::Unsigned16(_) => {
                deserialize_fixed!(data, type_template, ObjectValue::Unsigned16, u16)
            }
            ObjectValue::Unsigned32(_) => {
                deserialize_fixed!(data, type_template, ObjectValue::Unsigned32, u32)
            }
            ObjectValue::Integer8(_) => {
                deserialize_fixed!(data, type_template, ObjectValue::Integer8, i8)
            }
            ObjectValue::Integer16(_) => {
                deserialize_fixed!(data, type_template, ObjectValue::Integer16, i16)
            }
            ObjectValue::Integer32(_) => {
                deserialize_fixed!(data, type_template, ObjectValue::Integer32, i32)
            }
            ObjectValue::VisibleString(_) => Ok(ObjectValue::VisibleString(
                String::from_utf8(data.to_vec()).map_err(|_| CanopenError::Range)?,
            )),
            ObjectValue::Domain(_) => Ok(ObjectValue::Domain(data.to_vec())),
        }
    }

    /// Widens the value to u32. Signed variants are sign-extended first and
    /// then reinterpreted, matching the little-endian wire representation.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            ObjectValue::Unsigned8(v) => Some(*v as u32),
            ObjectValue::Unsigned16(v) => Some(*v as u32),
            ObjectValue::Unsigned32(v) => Some(*v),
            ObjectValue::Integer8(v) => Some(*v as i32 as u32),
            ObjectValue::Integer16(v) => Some(*v as i32 as u32),
            ObjectValue::Integer32(v) => Some(*v as u32),
            _ => None,
        }
    }

    /// Builds a value of the same variant from a u32, truncating to the
    /// template width.
    pub fn from_u32(template: &ObjectValue, raw: u32) -> Option<Self> {
        match template {
            ObjectValue::Unsigned8(_) => Some(ObjectValue::Unsigned8(raw as u8)),
            ObjectValue::Unsigned16(_) => Some(ObjectValue::Unsigned16(raw as u16)),
            ObjectValue::Unsigned32(_) => Some(ObjectValue::Unsigned32(raw)),
            ObjectValue::Integer8(_) => Some(ObjectValue::Integer8(raw as i8)),
            ObjectValue::Integer16(_) => Some(ObjectValue::Integer16(raw as i16)),
            ObjectValue::Integer32(_) => Some(ObjectValue::Integer32(raw as i32)),
            _ => None,
        }
    }
}
