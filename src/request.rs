//! Protocol requests and request grouping.
//!
//! A [`Request`] is a single protocol exchange: one function code, one
//! contiguous register range, and the mapping from the exchanged
//! registers back to the variables that own sub-ranges of it.
//!
//! [`group_requests`] partitions the variables of one sampling period
//! into the minimum number of requests subject to the protocol's
//! per-function-code size limits. Request tables are always rebuilt
//! from scratch, never patched.

use std::collections::BTreeMap;

use crate::core::error::{GatewayError, Result};
use crate::core::value::Value;
use crate::driver::RegisterDriver;
use crate::variable::kind::{
    is_write_fcode, FC_READ_COILS, FC_READ_DISCRETE_INPUTS, FC_READ_HOLDING_REGISTERS,
    FC_READ_INPUT_REGISTERS, FC_WRITE_MULTIPLE_COILS, FC_WRITE_MULTIPLE_REGISTERS,
    FC_WRITE_SINGLE_COIL,
};
use crate::variable::Variable;

/// Grouping limits and tolerances.
///
/// The maxima default to the field protocol's documented limits; the
/// gap tolerance defaults to strictly contiguous packing.
#[derive(Debug, Clone)]
pub struct GrouperConfig {
    /// Maximum register count of a read request.
    pub max_read_registers: u16,

    /// Maximum register count of a write request.
    pub max_write_registers: u16,

    /// How many unclaimed registers may separate two variables packed
    /// into the same request.
    pub allowed_gap: u16,
}

impl Default for GrouperConfig {
    fn default() -> Self {
        Self {
            max_read_registers: 125,
            max_write_registers: 123,
            allowed_gap: 0,
        }
    }
}

impl GrouperConfig {
    /// Maximum register count for a request with the given function
    /// code.
    pub fn max_registers(&self, fcode: u8) -> u16 {
        if is_write_fcode(fcode) {
            self.max_write_registers
        } else {
            self.max_read_registers
        }
    }
}

/// Where one variable lives inside a request's register window.
#[derive(Debug, Clone)]
pub struct VariableConnection {
    /// Owning variable id.
    pub variable_id: String,

    /// Offset of the variable's first register relative to the
    /// request's start offset.
    pub local_offset: u16,

    /// Register count of the variable.
    pub length: u16,
}

/// A single protocol exchange.
#[derive(Debug, Clone)]
pub struct Request {
    id: String,
    fcode: u8,
    start_offset: u16,
    register_count: u16,
    connections: Vec<VariableConnection>,
}

impl Request {
    /// Build a single-variable request (the variable's one-shot
    /// read/write path, outside the batching table).
    pub fn single(variable_id: &str, fcode: u8, offset: u16, length: u16) -> Self {
        Self {
            id: format!("{variable_id}:{fcode}"),
            fcode,
            start_offset: offset,
            register_count: length,
            connections: vec![VariableConnection {
                variable_id: variable_id.to_string(),
                local_offset: 0,
                length,
            }],
        }
    }

    /// Request id (deterministic within one table build).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Function code of the exchange.
    pub fn fcode(&self) -> u8 {
        self.fcode
    }

    /// First register address of the window.
    pub fn start_offset(&self) -> u16 {
        self.start_offset
    }

    /// Register count of the window.
    pub fn register_count(&self) -> u16 {
        self.register_count
    }

    /// Variables owning sub-ranges of the window.
    pub fn connections(&self) -> &[VariableConnection] {
        &self.connections
    }

    /// Whether this exchange writes to the device.
    pub fn is_write(&self) -> bool {
        is_write_fcode(self.fcode)
    }

    /// Invoke the exchange through a connection driver.
    ///
    /// Read requests fetch the window and decode every connected
    /// variable's sub-range; write requests assemble the window from
    /// the connected variables' current values (gap registers are
    /// zero). Returns `(variable_id, value)` for every variable touched
    /// by the exchange. The caller applies the values; this method does
    /// not mutate anything.
    pub async fn invoke(
        &self,
        driver: &dyn RegisterDriver,
        unit_id: u8,
        variables: &BTreeMap<String, Variable>,
    ) -> Result<Vec<(String, Value)>> {
        match self.fcode {
            FC_READ_COILS | FC_READ_DISCRETE_INPUTS => {
                let bits = if self.fcode == FC_READ_COILS {
                    driver
                        .read_coils(unit_id, self.start_offset, self.register_count)
                        .await?
                } else {
                    driver
                        .read_discrete_inputs(unit_id, self.start_offset, self.register_count)
                        .await?
                };
                // Widen bits to 0/1 words so the codec stays uniform
                let words: Vec<u16> = bits.iter().map(|&b| u16::from(b)).collect();
                self.decode_window(&words, variables)
            }

            FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS => {
                let words = if self.fcode == FC_READ_HOLDING_REGISTERS {
                    driver
                        .read_holding_registers(unit_id, self.start_offset, self.register_count)
                        .await?
                } else {
                    driver
                        .read_input_registers(unit_id, self.start_offset, self.register_count)
                        .await?
                };
                self.decode_window(&words, variables)
            }

            FC_WRITE_SINGLE_COIL => {
                let (id, variable) = self.connected_variable(variables)?;
                let value = variable.value().as_bool().ok_or_else(|| {
                    GatewayError::invalid_data("Cannot write non-boolean value as coil")
                })?;
                driver
                    .write_single_coil(unit_id, self.start_offset, value)
                    .await?;
                Ok(vec![(id, variable.value().clone())])
            }

            FC_WRITE_MULTIPLE_COILS => {
                let words = self.assemble_window(variables)?;
                let bits: Vec<bool> = words.iter().map(|&w| w != 0).collect();
                driver
                    .write_multiple_coils(unit_id, self.start_offset, &bits)
                    .await?;
                Ok(self.echo_values(variables))
            }

            FC_WRITE_MULTIPLE_REGISTERS => {
                let words = self.assemble_window(variables)?;
                driver
                    .write_multiple_registers(unit_id, self.start_offset, &words)
                    .await?;
                Ok(self.echo_values(variables))
            }

            other => Err(GatewayError::Internal(format!(
                "Request {} carries unsupported function code {}",
                self.id, other
            ))),
        }
    }

    /// Decode every connection's sub-range of a response window.
    fn decode_window(
        &self,
        words: &[u16],
        variables: &BTreeMap<String, Variable>,
    ) -> Result<Vec<(String, Value)>> {
        if words.len() < self.register_count as usize {
            return Err(GatewayError::invalid_data(format!(
                "Response window has {} registers, request {} expects {}",
                words.len(),
                self.id,
                self.register_count
            )));
        }

        let mut values = Vec::with_capacity(self.connections.len());
        for conn in &self.connections {
            let variable = variables.get(&conn.variable_id).ok_or_else(|| {
                GatewayError::Internal(format!(
                    "Request {} references unknown variable {}",
                    self.id, conn.variable_id
                ))
            })?;
            let start = conn.local_offset as usize;
            let end = start + conn.length as usize;
            let value = crate::codec::decode(variable.kind(), &words[start..end])?;
            values.push((conn.variable_id.clone(), value));
        }
        Ok(values)
    }

    /// Assemble the write window from the connected variables' current
    /// values. Gap registers stay zero.
    fn assemble_window(&self, variables: &BTreeMap<String, Variable>) -> Result<Vec<u16>> {
        let mut words = vec![0u16; self.register_count as usize];
        for conn in &self.connections {
            let variable = variables.get(&conn.variable_id).ok_or_else(|| {
                GatewayError::Internal(format!(
                    "Request {} references unknown variable {}",
                    self.id, conn.variable_id
                ))
            })?;
            let encoded = variable.encode_current()?;
            let start = conn.local_offset as usize;
            words[start..start + conn.length as usize].copy_from_slice(&encoded);
        }
        Ok(words)
    }

    /// Current values of all connected variables (write echo).
    fn echo_values(&self, variables: &BTreeMap<String, Variable>) -> Vec<(String, Value)> {
        self.connections
            .iter()
            .filter_map(|conn| {
                variables
                    .get(&conn.variable_id)
                    .map(|v| (conn.variable_id.clone(), v.value().clone()))
            })
            .collect()
    }

    /// The sole connection of a single-variable request.
    fn connected_variable<'a>(
        &self,
        variables: &'a BTreeMap<String, Variable>,
    ) -> Result<(String, &'a Variable)> {
        let conn = self.connections.first().ok_or_else(|| {
            GatewayError::Internal(format!("Request {} has no connections", self.id))
        })?;
        let variable = variables.get(&conn.variable_id).ok_or_else(|| {
            GatewayError::Internal(format!(
                "Request {} references unknown variable {}",
                self.id, conn.variable_id
            ))
        })?;
        Ok((conn.variable_id.clone(), variable))
    }
}

/// Partition variables sharing one sampling period into the minimum
/// number of requests.
///
/// Greedy contiguous packing over the variables sorted by
/// `(function code, offset)`: a variable extends the current request
/// when it uses the same function code, its offset lies within the
/// current span extended by at most [`GrouperConfig::allowed_gap`]
/// registers, and the grown span stays within the function code's
/// maximum. The output is deterministic regardless of input order.
pub fn group_requests(variables: &[&Variable], config: &GrouperConfig) -> Result<Vec<Request>> {
    let mut sorted: Vec<&Variable> = variables.to_vec();
    sorted.sort_by(|a, b| {
        (a.fcode(), a.offset(), a.id()).cmp(&(b.fcode(), b.offset(), b.id()))
    });

    let mut requests: Vec<Request> = Vec::new();

    for variable in sorted {
        let max = config.max_registers(variable.fcode());
        if variable.length() > max {
            return Err(GatewayError::Internal(format!(
                "Variable {} spans {} registers, exceeding the {}-register limit",
                variable.id(),
                variable.length(),
                max
            )));
        }

        let span_end = variable.offset() as u32 + variable.length() as u32;

        if let Some(current) = requests.last_mut() {
            let current_end = current.start_offset as u32 + current.register_count as u32;
            let fits_span = variable.fcode() == current.fcode
                && variable.offset() as u32 <= current_end + config.allowed_gap as u32;
            let grown = span_end.max(current_end) - current.start_offset as u32;

            if fits_span && grown <= max as u32 {
                current.connections.push(VariableConnection {
                    variable_id: variable.id().to_string(),
                    local_offset: variable.offset() - current.start_offset,
                    length: variable.length(),
                });
                current.register_count = grown as u16;
                continue;
            }
        }

        requests.push(Request {
            id: format!("{}@{}", variable.fcode(), variable.offset()),
            fcode: variable.fcode(),
            start_offset: variable.offset(),
            register_count: variable.length(),
            connections: vec![VariableConnection {
                variable_id: variable.id().to_string(),
                local_offset: 0,
                length: variable.length(),
            }],
        });
    }

    Ok(requests)
}
