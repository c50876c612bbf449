//! Register array <-> typed value conversion.
//!
//! The field protocol transmits each register big-endian on the wire,
//! but the devices this gateway targets deliver their payload bytes
//! swapped within every register. Decoding therefore byte-swaps each
//! register first; the `swapped*` kinds additionally reverse the
//! register (word) order because those devices transmit the low word
//! first.

use crate::core::error::{GatewayError, Result};
use crate::core::value::Value;
use crate::variable::kind::VariableKind;

/// Decode a typed value from 16-bit registers.
///
/// The slice length must match the kind's register footprint exactly
/// (for byteArray: the variable's configured length).
pub fn decode(kind: VariableKind, registers: &[u16]) -> Result<Value> {
    match kind {
        VariableKind::Boolean => {
            let reg = single(kind, registers)?;
            Ok(Value::Bool(reg != 0))
        }

        VariableKind::Int16 => {
            let reg = single(kind, registers)?;
            Ok(Value::Integer(reg.swap_bytes() as i16 as i64))
        }

        VariableKind::UInt16 => {
            let reg = single(kind, registers)?;
            Ok(Value::Integer(reg.swap_bytes() as i64))
        }

        VariableKind::Int32 => {
            let raw = assemble_u32(kind, registers, false)?;
            Ok(Value::Integer(raw as i32 as i64))
        }

        VariableKind::UInt32 => {
            let raw = assemble_u32(kind, registers, false)?;
            Ok(Value::Integer(raw as i64))
        }

        VariableKind::SwappedInt32 => {
            let raw = assemble_u32(kind, registers, true)?;
            Ok(Value::Integer(raw as i32 as i64))
        }

        VariableKind::SwappedUInt32 => {
            let raw = assemble_u32(kind, registers, true)?;
            Ok(Value::Integer(raw as i64))
        }

        VariableKind::Float => {
            let raw = assemble_u32(kind, registers, false)?;
            decode_f32(raw)
        }

        VariableKind::SwappedFloat => {
            let raw = assemble_u32(kind, registers, true)?;
            decode_f32(raw)
        }

        VariableKind::ByteArray => {
            // Raw bytes in register order, unconverted
            let mut bytes = Vec::with_capacity(registers.len() * 2);
            for &reg in registers {
                bytes.push((reg >> 8) as u8);
                bytes.push((reg & 0xFF) as u8);
            }
            Ok(Value::Bytes(bytes))
        }
    }
}

/// Encode a typed value into 16-bit registers.
///
/// `register_count` is the target footprint; byteArray values shorter
/// than the footprint are zero-padded, longer ones are rejected.
pub fn encode(kind: VariableKind, value: &Value, register_count: u16) -> Result<Vec<u16>> {
    match kind {
        VariableKind::Boolean => {
            let b = value
                .as_bool()
                .ok_or_else(|| GatewayError::invalid_data("Cannot convert value to boolean"))?;
            Ok(vec![u16::from(b)])
        }

        VariableKind::Int16 | VariableKind::UInt16 => {
            let v = value
                .as_i64()
                .ok_or_else(|| GatewayError::invalid_data("Cannot convert value to integer"))?;
            Ok(vec![(v as u16).swap_bytes()])
        }

        VariableKind::Int32 | VariableKind::UInt32 => {
            let v = value
                .as_i64()
                .ok_or_else(|| GatewayError::invalid_data("Cannot convert value to integer"))?;
            Ok(split_u32(v as u32, false))
        }

        VariableKind::SwappedInt32 | VariableKind::SwappedUInt32 => {
            let v = value
                .as_i64()
                .ok_or_else(|| GatewayError::invalid_data("Cannot convert value to integer"))?;
            Ok(split_u32(v as u32, true))
        }

        VariableKind::Float => {
            let v = value
                .as_f64()
                .ok_or_else(|| GatewayError::invalid_data("Cannot convert value to float"))?;
            Ok(split_u32((v as f32).to_bits(), false))
        }

        VariableKind::SwappedFloat => {
            let v = value
                .as_f64()
                .ok_or_else(|| GatewayError::invalid_data("Cannot convert value to float"))?;
            Ok(split_u32((v as f32).to_bits(), true))
        }

        VariableKind::ByteArray => {
            let bytes = value
                .as_bytes()
                .ok_or_else(|| GatewayError::invalid_data("Cannot convert value to bytes"))?;
            let capacity = register_count as usize * 2;
            if bytes.len() > capacity {
                return Err(GatewayError::invalid_data(format!(
                    "Byte array of {} bytes exceeds {} registers",
                    bytes.len(),
                    register_count
                )));
            }
            let mut regs = Vec::with_capacity(register_count as usize);
            for i in 0..register_count as usize {
                let hi = bytes.get(i * 2).copied().unwrap_or(0) as u16;
                let lo = bytes.get(i * 2 + 1).copied().unwrap_or(0) as u16;
                regs.push((hi << 8) | lo);
            }
            Ok(regs)
        }
    }
}

/// Expect exactly one register.
fn single(kind: VariableKind, registers: &[u16]) -> Result<u16> {
    match registers {
        [reg] => Ok(*reg),
        _ => Err(GatewayError::invalid_data(format!(
            "{} expects 1 register, got {}",
            kind,
            registers.len()
        ))),
    }
}

/// Assemble two registers into a 32-bit quantity.
///
/// Bytes are swapped within each register; `swap_words` reverses the
/// register order first (low word transmitted first).
fn assemble_u32(kind: VariableKind, registers: &[u16], swap_words: bool) -> Result<u32> {
    let [r0, r1] = match registers {
        [a, b] => [*a, *b],
        _ => {
            return Err(GatewayError::invalid_data(format!(
                "{} expects 2 registers, got {}",
                kind,
                registers.len()
            )))
        }
    };
    let (hi, lo) = if swap_words { (r1, r0) } else { (r0, r1) };
    Ok(((hi.swap_bytes() as u32) << 16) | lo.swap_bytes() as u32)
}

/// Split a 32-bit quantity back into two registers (inverse of
/// [`assemble_u32`]).
fn split_u32(raw: u32, swap_words: bool) -> Vec<u16> {
    let hi = ((raw >> 16) as u16).swap_bytes();
    let lo = (raw as u16).swap_bytes();
    if swap_words {
        vec![lo, hi]
    } else {
        vec![hi, lo]
    }
}

/// Reinterpret an assembled 32-bit pattern as IEEE-754 single precision.
fn decode_f32(raw: u32) -> Result<Value> {
    let value = f32::from_bits(raw);
    if value.is_nan() || value.is_infinite() {
        return Err(GatewayError::invalid_data("Invalid float32 value"));
    }
    Ok(Value::Float(value as f64))
}
