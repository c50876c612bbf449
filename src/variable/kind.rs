//! Variable kinds.
//!
//! Each kind fixes the register footprint, the set of legal function
//! codes and the single-element read/write function codes. The wire
//! codec for each kind lives in [`crate::codec::registers`].

use serde::{Deserialize, Serialize};

use crate::core::error::{GatewayError, Result};

/// Function code: read coils.
pub const FC_READ_COILS: u8 = 1;
/// Function code: read discrete inputs.
pub const FC_READ_DISCRETE_INPUTS: u8 = 2;
/// Function code: read holding registers.
pub const FC_READ_HOLDING_REGISTERS: u8 = 3;
/// Function code: read input registers.
pub const FC_READ_INPUT_REGISTERS: u8 = 4;
/// Function code: write single coil.
pub const FC_WRITE_SINGLE_COIL: u8 = 5;
/// Function code: write multiple coils.
pub const FC_WRITE_MULTIPLE_COILS: u8 = 15;
/// Function code: write multiple registers.
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 16;

/// Closed set of variable kinds.
///
/// The discriminant strings are the payload `type` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariableKind {
    /// Single coil / discrete input, value 0 or 1.
    #[serde(rename = "boolean")]
    Boolean,

    /// Signed 16-bit register.
    #[serde(rename = "int16")]
    Int16,

    /// Unsigned 16-bit register.
    #[serde(rename = "uint16")]
    UInt16,

    /// Signed 32-bit quantity over two registers, natural word order.
    #[serde(rename = "int32")]
    Int32,

    /// Unsigned 32-bit quantity over two registers, natural word order.
    #[serde(rename = "uint32")]
    UInt32,

    /// Signed 32-bit quantity with low word transmitted first.
    #[serde(rename = "swappedInt32")]
    SwappedInt32,

    /// Unsigned 32-bit quantity with low word transmitted first.
    #[serde(rename = "swappedUInt32")]
    SwappedUInt32,

    /// IEEE-754 single precision over two registers, natural word order.
    #[serde(rename = "float")]
    Float,

    /// IEEE-754 single precision with low word transmitted first.
    #[serde(rename = "swappedFloat")]
    SwappedFloat,

    /// Raw byte sequence spanning `ceil(byte_length / 2)` registers.
    #[serde(rename = "byteArray")]
    ByteArray,
}

impl VariableKind {
    /// Parse a payload `type` discriminant.
    pub fn from_type_name(name: &str) -> Result<Self> {
        match name {
            "boolean" => Ok(Self::Boolean),
            "int16" => Ok(Self::Int16),
            "uint16" => Ok(Self::UInt16),
            "int32" => Ok(Self::Int32),
            "uint32" => Ok(Self::UInt32),
            "swappedInt32" => Ok(Self::SwappedInt32),
            "swappedUInt32" => Ok(Self::SwappedUInt32),
            "float" => Ok(Self::Float),
            "swappedFloat" => Ok(Self::SwappedFloat),
            "byteArray" => Ok(Self::ByteArray),
            other => Err(GatewayError::UnknownKind(other.to_string())),
        }
    }

    /// The payload `type` discriminant string.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Int16 => "int16",
            Self::UInt16 => "uint16",
            Self::Int32 => "int32",
            Self::UInt32 => "uint32",
            Self::SwappedInt32 => "swappedInt32",
            Self::SwappedUInt32 => "swappedUInt32",
            Self::Float => "float",
            Self::SwappedFloat => "swappedFloat",
            Self::ByteArray => "byteArray",
        }
    }

    /// Register footprint of this kind.
    ///
    /// `byte_length` is only consulted for [`VariableKind::ByteArray`],
    /// which spans `ceil(byte_length / 2)` registers.
    pub fn register_count(&self, byte_length: Option<u16>) -> Result<u16> {
        match self {
            Self::Boolean | Self::Int16 | Self::UInt16 => Ok(1),
            Self::Int32
            | Self::UInt32
            | Self::SwappedInt32
            | Self::SwappedUInt32
            | Self::Float
            | Self::SwappedFloat => Ok(2),
            Self::ByteArray => {
                let bytes = byte_length.ok_or_else(|| {
                    GatewayError::validation("byteArray requires an explicit byte length")
                })?;
                if bytes == 0 {
                    return Err(GatewayError::validation(
                        "byteArray byte length must be positive",
                    ));
                }
                Ok(bytes.div_ceil(2))
            }
        }
    }

    /// Function codes legal for this kind.
    pub fn legal_fcodes(&self) -> &'static [u8] {
        match self {
            Self::Boolean => &[
                FC_READ_COILS,
                FC_READ_DISCRETE_INPUTS,
                FC_WRITE_MULTIPLE_COILS,
            ],
            _ => &[
                FC_READ_HOLDING_REGISTERS,
                FC_READ_INPUT_REGISTERS,
                FC_WRITE_MULTIPLE_REGISTERS,
            ],
        }
    }

    /// Check a function code against the kind's legal set.
    pub fn check_fcode(&self, fcode: u8) -> Result<()> {
        if self.legal_fcodes().contains(&fcode) {
            Ok(())
        } else {
            Err(GatewayError::IllegalFunctionCode {
                fcode,
                kind: self.type_name().to_string(),
            })
        }
    }

    /// Function code used when writing this variable alone.
    ///
    /// Always the protocol's "write multiple registers" code, except
    /// boolean which uses "write single coil".
    pub fn set_single_fcode(&self) -> u8 {
        match self {
            Self::Boolean => FC_WRITE_SINGLE_COIL,
            _ => FC_WRITE_MULTIPLE_REGISTERS,
        }
    }

    /// Function code used when reading this variable alone.
    ///
    /// Defaults to the holding-register read unless the batched `fcode`
    /// selects the input-register space. Bit kinds stay on their coil /
    /// discrete-input space; byteArray always follows `fcode`.
    pub fn get_single_fcode(&self, fcode: u8) -> u8 {
        match self {
            Self::Boolean => {
                if fcode == FC_READ_DISCRETE_INPUTS {
                    FC_READ_DISCRETE_INPUTS
                } else {
                    FC_READ_COILS
                }
            }
            Self::ByteArray => fcode,
            _ => {
                if fcode == FC_READ_INPUT_REGISTERS {
                    FC_READ_INPUT_REGISTERS
                } else {
                    FC_READ_HOLDING_REGISTERS
                }
            }
        }
    }

    /// Whether this kind travels as coil/discrete bits instead of
    /// 16-bit registers.
    #[inline]
    pub fn is_bit_kind(&self) -> bool {
        matches!(self, Self::Boolean)
    }
}

impl std::fmt::Display for VariableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// Whether a function code performs a write.
#[inline]
pub fn is_write_fcode(fcode: u8) -> bool {
    matches!(
        fcode,
        FC_WRITE_SINGLE_COIL | FC_WRITE_MULTIPLE_COILS | FC_WRITE_MULTIPLE_REGISTERS
    )
}
