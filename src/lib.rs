//! # Meter Gateway Core (metergw)
//!
//! A polling gateway core for industrial devices speaking a binary
//! register-based field protocol. Device registers are exposed as typed,
//! named variables, secondary metered quantities are derived from them,
//! and everything is sampled on a tick-based schedule.
//!
//! ## Features
//!
//! - **Typed variable model**: each variable kind fixes its register
//!   footprint, legal function codes and wire codec
//! - **Request batching**: variables sharing a sampling period are packed
//!   into the minimum number of protocol exchanges
//! - **Tick-driven refresh**: a single scheduler clock drives every device;
//!   a misbehaving device never stalls the tick for the others
//! - **Derived metrics**: sum / factor / average / increase calculation
//!   elements with overflow and windowing semantics
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use metergw::prelude::*;
//! use std::sync::Arc;
//!
//! let driver = Arc::new(VirtualDriver::new());
//! let mut device = Device::from_payload(payload, driver)?;
//! device.connect().await?;
//! device.refresh(sampler::current_tick()).await;
//! ```
//!
//! The gateway core persists nothing and serves no network API; the
//! surrounding layers consume its payload snapshots and event channels.

pub mod codec;
pub mod core;

pub mod calc;
pub mod device;
pub mod driver;
pub mod request;
pub mod sampler;
pub mod variable;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::calc::{CalculationElement, CalculationElementPayload, CalculationKind};
    pub use crate::core::error::{GatewayError, Result};
    pub use crate::core::events::{Refreshed, ValueChanged};
    pub use crate::core::value::Value;
    pub use crate::device::{ConnectionParams, Device, DevicePayload};
    pub use crate::driver::{RegisterDriver, VirtualDriver};
    pub use crate::request::{GrouperConfig, Request};
    pub use crate::variable::{Variable, VariableKind, VariablePayload};
}

// Re-export core types at crate root for convenience
pub use crate::core::error::{GatewayError, Result};
pub use crate::core::events::{Refreshed, ValueChanged};
pub use crate::core::value::Value;
pub use crate::device::Device;
pub use crate::driver::{RegisterDriver, VirtualDriver};
pub use crate::sampler::Sampler;
pub use crate::variable::{Variable, VariableKind};
