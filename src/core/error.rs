//! Error types for the meter gateway.
//!
//! The taxonomy separates configuration/validation failures (raised
//! synchronously by mutating calls, prior state untouched) from
//! communication failures (confined to the refresh cycle, never
//! propagated out of it).

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Unified gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Invalid or missing configuration/payload field.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown variable or calculation element kind discriminant.
    #[error("Unknown kind: {0}")]
    UnknownKind(String),

    /// An entity with this id already exists.
    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    /// An entity with this name already exists within the device.
    #[error("Duplicate name: {0}")]
    DuplicateName(String),

    /// Function code is not legal for the variable kind.
    #[error("Function code {fcode} is not legal for kind {kind}")]
    IllegalFunctionCode {
        /// Offending function code.
        fcode: u8,
        /// Variable kind it was applied to.
        kind: String,
    },

    /// A calculation element references a variable that does not exist.
    #[error("Source variable not found: {0}")]
    MissingSource(String),

    /// Lookup of an entity by id failed.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transport-level failure while talking to a device.
    #[error("Communication error: {0}")]
    Communication(String),

    /// A driver call exceeded the device's configured timeout.
    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    /// Operation requires an open connection.
    #[error("Not connected")]
    NotConnected,

    /// Malformed wire data or value not convertible to the target kind.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Invariant violation inside the gateway itself.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Shorthand for an [`GatewayError::InvalidData`] error.
    pub fn invalid_data(msg: impl Into<String>) -> Self {
        Self::InvalidData(msg.into())
    }

    /// Shorthand for a [`GatewayError::Validation`] error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether this error belongs to the validation family.
    ///
    /// Validation errors propagate to the caller of the mutating
    /// operation; communication errors are swallowed by the refresh
    /// cycle.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::UnknownKind(_)
                | Self::DuplicateId(_)
                | Self::DuplicateName(_)
                | Self::IllegalFunctionCode { .. }
                | Self::MissingSource(_)
        )
    }
}
