//! Typed variables.
//!
//! A variable maps a register range of one device to a typed, named
//! value. Variables are created from structured payloads, validated on
//! construction, and edited by reconstruct-and-replace so an invalid
//! edit can never leave a half-mutated live instance.

pub mod kind;

use serde::{Deserialize, Serialize};

use crate::core::error::{GatewayError, Result};
use crate::core::events::{ValueNotifier, ValueReceiver};
use crate::core::id::IdProvider;
use crate::core::value::Value;
use crate::request::Request;

pub use kind::VariableKind;

/// Variable creation and snapshot payload.
///
/// The same shape serves both directions: the persistence/API layers
/// create variables from it, and [`Variable::payload`] reflects current
/// state back into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariablePayload {
    /// Entity id; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Display name, unique within the owning device.
    pub name: String,

    /// Kind discriminant, e.g. `"swappedInt32"`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Register address of the first register.
    pub offset: u16,

    /// Function code used inside batched reads/writes.
    #[serde(rename = "fCode")]
    pub fcode: u8,

    /// Sampling period in seconds.
    pub sample_time: u64,

    /// Separate period for historized snapshots; defaults to
    /// `sample_time`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_sample_time: Option<u64>,

    /// Display unit.
    #[serde(default)]
    pub unit: String,

    /// Whether a historian should record this variable.
    #[serde(default)]
    pub archived: bool,

    /// Requested payload length in bytes; byteArray only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_length: Option<u16>,

    /// Current value; `Null` when never sampled.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub value: Value,
}

/// A typed variable bound to a register range.
#[derive(Debug, Clone)]
pub struct Variable {
    id: String,
    name: String,
    kind: VariableKind,
    offset: u16,
    length: u16,
    byte_length: Option<u16>,
    fcode: u8,
    get_single_fcode: u8,
    set_single_fcode: u8,
    tick_id: u64,
    archive_tick_id: u64,
    unit: String,
    archived: bool,
    value: Value,
    notifier: ValueNotifier,
    single_read: Request,
    single_write: Request,
}

impl Variable {
    /// Build a variable from a creation payload.
    ///
    /// Validates the kind discriminant, the function code against the
    /// kind's legal set, the sampling period and the byteArray length.
    /// Any violation fails construction without partial state.
    pub fn from_payload(payload: &VariablePayload, ids: &dyn IdProvider) -> Result<Self> {
        let kind = VariableKind::from_type_name(&payload.kind)?;
        kind.check_fcode(payload.fcode)?;

        if payload.name.is_empty() {
            return Err(GatewayError::validation("Variable name must not be empty"));
        }
        if payload.sample_time == 0 {
            return Err(GatewayError::validation(
                "Variable sample time must be positive",
            ));
        }

        let length = kind.register_count(payload.byte_length)?;
        let tick_id = payload.sample_time;
        let archive_tick_id = match payload.archive_sample_time {
            Some(0) => {
                return Err(GatewayError::validation(
                    "Variable archive sample time must be positive",
                ))
            }
            Some(t) => t,
            None => tick_id,
        };

        let id = payload
            .id
            .clone()
            .unwrap_or_else(|| ids.next_id());

        let get_single_fcode = kind.get_single_fcode(payload.fcode);
        let set_single_fcode = kind.set_single_fcode();
        let single_read = Request::single(&id, get_single_fcode, payload.offset, length);
        let single_write = Request::single(&id, set_single_fcode, payload.offset, length);

        Ok(Self {
            id,
            name: payload.name.clone(),
            kind,
            offset: payload.offset,
            length,
            byte_length: payload.byte_length,
            fcode: payload.fcode,
            get_single_fcode,
            set_single_fcode,
            tick_id,
            archive_tick_id,
            unit: payload.unit.clone(),
            archived: payload.archived,
            value: payload.value.clone(),
            notifier: ValueNotifier::new(),
            single_read,
            single_write,
        })
    }

    /// Rebuild this variable from its snapshot merged with a partial
    /// payload.
    ///
    /// The replacement keeps the current `id` and notification channel;
    /// fields absent from the patch keep their current values, and `id`
    /// itself is never editable. An invalid merged payload fails the
    /// edit atomically, leaving the original untouched.
    pub fn edit_with_payload(
        &self,
        patch: &serde_json::Value,
        ids: &dyn IdProvider,
    ) -> Result<Self> {
        let mut merged = serde_json::to_value(self.payload())
            .map_err(|e| GatewayError::Internal(format!("Snapshot serialization failed: {e}")))?;

        let (Some(target), Some(overlay)) = (merged.as_object_mut(), patch.as_object()) else {
            return Err(GatewayError::validation("Edit payload must be an object"));
        };
        for (key, value) in overlay {
            target.insert(key.clone(), value.clone());
        }
        // Identity is never editable
        target.insert("id".to_string(), serde_json::json!(self.id));

        let payload: VariablePayload = serde_json::from_value(merged)
            .map_err(|e| GatewayError::validation(format!("Invalid edit payload: {e}")))?;

        let mut rebuilt = Self::from_payload(&payload, ids)?;
        rebuilt.notifier = self.notifier.clone();
        Ok(rebuilt)
    }

    /// Entity id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Variable kind.
    pub fn kind(&self) -> VariableKind {
        self.kind
    }

    /// First register address.
    pub fn offset(&self) -> u16 {
        self.offset
    }

    /// Register footprint.
    pub fn length(&self) -> u16 {
        self.length
    }

    /// Function code used inside batched requests.
    pub fn fcode(&self) -> u8 {
        self.fcode
    }

    /// Function code for reading this variable alone.
    pub fn get_single_fcode(&self) -> u8 {
        self.get_single_fcode
    }

    /// Function code for writing this variable alone.
    pub fn set_single_fcode(&self) -> u8 {
        self.set_single_fcode
    }

    /// Sampling period in ticks.
    pub fn tick_id(&self) -> u64 {
        self.tick_id
    }

    /// Historization period in ticks.
    pub fn archive_tick_id(&self) -> u64 {
        self.archive_tick_id
    }

    /// Display unit.
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Whether a historian should record this variable.
    pub fn archived(&self) -> bool {
        self.archived
    }

    /// Current typed value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Replace the current value and notify subscribers.
    pub fn set_value(&mut self, value: Value) {
        self.value = value.clone();
        self.notifier.post(&self.id, &self.name, value);
    }

    /// Subscribe to value changes.
    pub fn subscribe(&self) -> ValueReceiver {
        self.notifier.subscribe()
    }

    /// The notification channel handle (shared across edits).
    pub fn notifier(&self) -> &ValueNotifier {
        &self.notifier
    }

    /// Single-element read request bound to the owning device's
    /// connection handle.
    pub fn single_read(&self) -> &Request {
        &self.single_read
    }

    /// Single-element write request bound to the owning device's
    /// connection handle.
    pub fn single_write(&self) -> &Request {
        &self.single_write
    }

    /// Regenerate the single-element requests.
    ///
    /// Called by the owning device when its connection handle is
    /// replaced; variable identity is untouched.
    pub fn rebind_single_requests(&mut self) {
        self.single_read = Request::single(&self.id, self.get_single_fcode, self.offset, self.length);
        self.single_write =
            Request::single(&self.id, self.set_single_fcode, self.offset, self.length);
    }

    /// Decode registers from the wire and store the result.
    pub fn update_from_registers(&mut self, registers: &[u16]) -> Result<()> {
        let value = crate::codec::decode(self.kind, registers)?;
        self.set_value(value);
        Ok(())
    }

    /// Encode the current value for a write exchange.
    pub fn encode_current(&self) -> Result<Vec<u16>> {
        crate::codec::encode(self.kind, &self.value, self.length)
    }

    /// Snapshot payload reflecting current state.
    pub fn payload(&self) -> VariablePayload {
        VariablePayload {
            id: Some(self.id.clone()),
            name: self.name.clone(),
            kind: self.kind.type_name().to_string(),
            offset: self.offset,
            fcode: self.fcode,
            sample_time: self.tick_id,
            archive_sample_time: Some(self.archive_tick_id),
            unit: self.unit.clone(),
            archived: self.archived,
            byte_length: self.byte_length,
            value: self.value.clone(),
        }
    }
}
