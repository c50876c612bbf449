//! Core abstractions for the meter gateway.
//!
//! This module provides the foundational types shared by every layer:
//! the error taxonomy, the typed value model, event channels, id
//! generation and tick arithmetic.

pub mod error;
pub mod events;
pub mod id;
pub mod tick;
pub mod value;

pub use error::{GatewayError, Result};
pub use events::*;
pub use id::IdProvider;
pub use value::Value;
