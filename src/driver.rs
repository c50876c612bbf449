//! Connection drivers.
//!
//! [`RegisterDriver`] is the seam between the gateway core and the
//! transport that actually talks to a device. The core never opens
//! sockets itself; a host supplies one driver per device, and the
//! device owns it exclusively.
//!
//! [`VirtualDriver`] is an in-memory register bank implementing the
//! same seam. It backs the test suite and lets hosts simulate devices
//! without any physical transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::error::{GatewayError, Result};

/// Transport abstraction for one device connection.
///
/// All operations address registers/coils by `(unit_id, offset,
/// count)`. Implementations are expected to be cheap to share behind an
/// `Arc` and internally synchronized.
#[async_trait]
pub trait RegisterDriver: Send + Sync {
    /// Open the connection. Idempotent.
    async fn connect(&self) -> Result<()>;

    /// Close the connection. Idempotent; in-flight calls fail fast.
    async fn disconnect(&self) -> Result<()>;

    /// Whether the connection is currently open.
    fn is_connected(&self) -> bool;

    /// Read `count` coils starting at `offset`.
    async fn read_coils(&self, unit_id: u8, offset: u16, count: u16) -> Result<Vec<bool>>;

    /// Read `count` discrete inputs starting at `offset`.
    async fn read_discrete_inputs(&self, unit_id: u8, offset: u16, count: u16)
        -> Result<Vec<bool>>;

    /// Read `count` holding registers starting at `offset`.
    async fn read_holding_registers(&self, unit_id: u8, offset: u16, count: u16)
        -> Result<Vec<u16>>;

    /// Read `count` input registers starting at `offset`.
    async fn read_input_registers(&self, unit_id: u8, offset: u16, count: u16)
        -> Result<Vec<u16>>;

    /// Write one coil.
    async fn write_single_coil(&self, unit_id: u8, offset: u16, value: bool) -> Result<()>;

    /// Write a run of coils.
    async fn write_multiple_coils(&self, unit_id: u8, offset: u16, values: &[bool]) -> Result<()>;

    /// Write a run of registers.
    async fn write_multiple_registers(&self, unit_id: u8, offset: u16, values: &[u16])
        -> Result<()>;
}

/// Per-unit simulated register spaces.
#[derive(Debug, Default)]
struct UnitBank {
    holding: HashMap<u16, u16>,
    input: HashMap<u16, u16>,
    coils: HashMap<u16, bool>,
    discrete: HashMap<u16, bool>,
}

/// In-memory register bank driver.
///
/// Unwritten addresses read as zero/false. Fault injection hooks let
/// tests exercise the refresh cycle's error handling: [`fail_next`]
/// fails exactly one call, [`set_failing`] fails every call until
/// cleared, and [`set_response_delay`] stalls every call (for timeout
/// paths).
///
/// [`fail_next`]: VirtualDriver::fail_next
/// [`set_failing`]: VirtualDriver::set_failing
/// [`set_response_delay`]: VirtualDriver::set_response_delay
#[derive(Debug, Default)]
pub struct VirtualDriver {
    connected: AtomicBool,
    banks: Mutex<HashMap<u8, UnitBank>>,
    fail_next: AtomicBool,
    failing: AtomicBool,
    response_delay: Mutex<Option<Duration>>,
}

impl VirtualDriver {
    /// Create an empty, disconnected bank.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed holding registers.
    pub fn set_holding_registers(&self, unit_id: u8, offset: u16, values: &[u16]) {
        let mut banks = self.banks.lock().expect("bank lock poisoned");
        let bank = banks.entry(unit_id).or_default();
        for (i, &v) in values.iter().enumerate() {
            bank.holding.insert(offset + i as u16, v);
        }
    }

    /// Seed input registers.
    pub fn set_input_registers(&self, unit_id: u8, offset: u16, values: &[u16]) {
        let mut banks = self.banks.lock().expect("bank lock poisoned");
        let bank = banks.entry(unit_id).or_default();
        for (i, &v) in values.iter().enumerate() {
            bank.input.insert(offset + i as u16, v);
        }
    }

    /// Seed coils.
    pub fn set_coils(&self, unit_id: u8, offset: u16, values: &[bool]) {
        let mut banks = self.banks.lock().expect("bank lock poisoned");
        let bank = banks.entry(unit_id).or_default();
        for (i, &v) in values.iter().enumerate() {
            bank.coils.insert(offset + i as u16, v);
        }
    }

    /// Seed discrete inputs.
    pub fn set_discrete_inputs(&self, unit_id: u8, offset: u16, values: &[bool]) {
        let mut banks = self.banks.lock().expect("bank lock poisoned");
        let bank = banks.entry(unit_id).or_default();
        for (i, &v) in values.iter().enumerate() {
            bank.discrete.insert(offset + i as u16, v);
        }
    }

    /// Read back one holding register (written values included).
    pub fn holding_register(&self, unit_id: u8, offset: u16) -> Option<u16> {
        let banks = self.banks.lock().expect("bank lock poisoned");
        banks.get(&unit_id).and_then(|b| b.holding.get(&offset).copied())
    }

    /// Read back one coil.
    pub fn coil(&self, unit_id: u8, offset: u16) -> Option<bool> {
        let banks = self.banks.lock().expect("bank lock poisoned");
        banks.get(&unit_id).and_then(|b| b.coils.get(&offset).copied())
    }

    /// Fail exactly the next driver call.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Fail every driver call until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Stall every driver call by `delay` (None clears).
    pub fn set_response_delay(&self, delay: Option<Duration>) {
        *self.response_delay.lock().expect("delay lock poisoned") = delay;
    }

    /// Common entry check for every protocol call.
    async fn guard(&self) -> Result<()> {
        let delay = *self.response_delay.lock().expect("delay lock poisoned");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(GatewayError::NotConnected);
        }
        if self.fail_next.swap(false, Ordering::SeqCst) || self.failing.load(Ordering::SeqCst) {
            return Err(GatewayError::Communication(
                "Injected transport failure".to_string(),
            ));
        }
        Ok(())
    }

    fn read_words(
        &self,
        unit_id: u8,
        offset: u16,
        count: u16,
        input_space: bool,
    ) -> Vec<u16> {
        let banks = self.banks.lock().expect("bank lock poisoned");
        let bank = banks.get(&unit_id);
        (0..count)
            .map(|i| {
                bank.and_then(|b| {
                    let space = if input_space { &b.input } else { &b.holding };
                    space.get(&(offset + i)).copied()
                })
                .unwrap_or(0)
            })
            .collect()
    }

    fn read_bits(&self, unit_id: u8, offset: u16, count: u16, discrete: bool) -> Vec<bool> {
        let banks = self.banks.lock().expect("bank lock poisoned");
        let bank = banks.get(&unit_id);
        (0..count)
            .map(|i| {
                bank.and_then(|b| {
                    let space = if discrete { &b.discrete } else { &b.coils };
                    space.get(&(offset + i)).copied()
                })
                .unwrap_or(false)
            })
            .collect()
    }
}

#[async_trait]
impl RegisterDriver for VirtualDriver {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn read_coils(&self, unit_id: u8, offset: u16, count: u16) -> Result<Vec<bool>> {
        self.guard().await?;
        Ok(self.read_bits(unit_id, offset, count, false))
    }

    async fn read_discrete_inputs(
        &self,
        unit_id: u8,
        offset: u16,
        count: u16,
    ) -> Result<Vec<bool>> {
        self.guard().await?;
        Ok(self.read_bits(unit_id, offset, count, true))
    }

    async fn read_holding_registers(
        &self,
        unit_id: u8,
        offset: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        self.guard().await?;
        Ok(self.read_words(unit_id, offset, count, false))
    }

    async fn read_input_registers(
        &self,
        unit_id: u8,
        offset: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        self.guard().await?;
        Ok(self.read_words(unit_id, offset, count, true))
    }

    async fn write_single_coil(&self, unit_id: u8, offset: u16, value: bool) -> Result<()> {
        self.guard().await?;
        let mut banks = self.banks.lock().expect("bank lock poisoned");
        banks.entry(unit_id).or_default().coils.insert(offset, value);
        Ok(())
    }

    async fn write_multiple_coils(
        &self,
        unit_id: u8,
        offset: u16,
        values: &[bool],
    ) -> Result<()> {
        self.guard().await?;
        let mut banks = self.banks.lock().expect("bank lock poisoned");
        let bank = banks.entry(unit_id).or_default();
        for (i, &v) in values.iter().enumerate() {
            bank.coils.insert(offset + i as u16, v);
        }
        Ok(())
    }

    async fn write_multiple_registers(
        &self,
        unit_id: u8,
        offset: u16,
        values: &[u16],
    ) -> Result<()> {
        self.guard().await?;
        let mut banks = self.banks.lock().expect("bank lock poisoned");
        let bank = banks.entry(unit_id).or_default();
        for (i, &v) in values.iter().enumerate() {
            bank.holding.insert(offset + i as u16, v);
        }
        Ok(())
    }
}
