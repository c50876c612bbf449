//! Devices.
//!
//! A device owns a set of variables and calculation elements, the
//! request table that polls them, and exactly one connection handle.
//! Structural changes always regenerate the whole request table
//! (copy-and-swap); the refresh cycle swallows every communication
//! failure so one misbehaving device cannot stall the scheduler tick
//! for the others.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::calc::{CalculationElement, CalculationElementPayload};
use crate::core::error::{GatewayError, Result};
use crate::core::events::{ChangedSample, RefreshNotifier, RefreshReceiver};
use crate::core::id::{default_provider, SharedIdProvider};
use crate::core::tick::is_due;
use crate::core::value::Value;
use crate::driver::RegisterDriver;
use crate::request::{group_requests, GrouperConfig, Request};
use crate::variable::{Variable, VariablePayload};

fn default_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    3000
}

fn default_device_type() -> String {
    "generic".to_string()
}

/// Connection parameters of one device.
///
/// Immutable once set; replacing them goes through
/// [`Device::rebuild_connection`], which swaps the connection handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionParams {
    /// Target host name or address.
    pub address: String,

    /// Target port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Protocol unit identifier.
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Per-exchange timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl ConnectionParams {
    /// The exchange timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Device creation and snapshot payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePayload {
    /// Entity id; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Display name.
    pub name: String,

    /// Device type discriminant (e.g. a meter model name).
    #[serde(rename = "type", default = "default_device_type")]
    pub device_type: String,

    /// Connection parameters.
    #[serde(flatten)]
    pub connection: ConnectionParams,

    /// Whether the scheduler refreshes this device.
    #[serde(default)]
    pub is_active: bool,

    /// Initial variable set.
    #[serde(default)]
    pub variables: Vec<VariablePayload>,

    /// Initial calculation element set.
    #[serde(default)]
    pub calculation_elements: Vec<CalculationElementPayload>,
}

/// Refresh-cycle statistics of one device.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceDiagnostics {
    /// Successful refresh cycles.
    pub refresh_count: u64,

    /// Failed refresh cycles (swallowed).
    pub error_count: u64,

    /// Message of the most recent failure.
    pub last_error: Option<String>,
}

/// A polled field device.
pub struct Device {
    id: String,
    name: String,
    device_type: String,
    connection: ConnectionParams,
    is_active: bool,
    driver: Arc<dyn RegisterDriver>,
    variables: BTreeMap<String, Variable>,
    calculation_elements: BTreeMap<String, CalculationElement>,
    requests: BTreeMap<u64, Vec<Request>>,
    grouper: GrouperConfig,
    ids: SharedIdProvider,
    refresh_notifier: RefreshNotifier,
    diagnostics: DeviceDiagnostics,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("device_type", &self.device_type)
            .field("connection", &self.connection)
            .field("is_active", &self.is_active)
            .field("driver", &"<dyn RegisterDriver>")
            .field("variables", &self.variables)
            .field("calculation_elements", &self.calculation_elements)
            .field("requests", &self.requests)
            .field("grouper", &self.grouper)
            .field("ids", &"<dyn IdProvider>")
            .field("refresh_notifier", &self.refresh_notifier)
            .field("diagnostics", &self.diagnostics)
            .finish()
    }
}

impl Device {
    /// Build a device from a creation payload with the default id
    /// provider.
    pub fn from_payload(payload: &DevicePayload, driver: Arc<dyn RegisterDriver>) -> Result<Self> {
        Self::from_payload_with_ids(payload, driver, default_provider())
    }

    /// Build a device from a creation payload with an explicit id
    /// provider.
    pub fn from_payload_with_ids(
        payload: &DevicePayload,
        driver: Arc<dyn RegisterDriver>,
        ids: SharedIdProvider,
    ) -> Result<Self> {
        if payload.name.is_empty() {
            return Err(GatewayError::validation("Device name must not be empty"));
        }

        let mut device = Self {
            id: payload.id.clone().unwrap_or_else(|| ids.next_id()),
            name: payload.name.clone(),
            device_type: payload.device_type.clone(),
            connection: payload.connection.clone(),
            is_active: payload.is_active,
            driver,
            variables: BTreeMap::new(),
            calculation_elements: BTreeMap::new(),
            requests: BTreeMap::new(),
            grouper: GrouperConfig::default(),
            ids,
            refresh_notifier: RefreshNotifier::new(),
            diagnostics: DeviceDiagnostics::default(),
        };

        for variable_payload in &payload.variables {
            device.create_variable(variable_payload)?;
        }
        for element_payload in &payload.calculation_elements {
            device.create_calculation_element(element_payload)?;
        }

        Ok(device)
    }

    /// Entity id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device type discriminant.
    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    /// Connection parameters.
    pub fn connection(&self) -> &ConnectionParams {
        &self.connection
    }

    /// Whether the scheduler refreshes this device.
    pub fn is_active(&self) -> bool {
        self.is_active
    }

    /// Enable or disable refreshing.
    pub fn set_active(&mut self, active: bool) {
        self.is_active = active;
    }

    /// Refresh-cycle statistics.
    pub fn diagnostics(&self) -> &DeviceDiagnostics {
        &self.diagnostics
    }

    /// Variables keyed by id.
    pub fn variables(&self) -> &BTreeMap<String, Variable> {
        &self.variables
    }

    /// One variable by id.
    pub fn variable(&self, id: &str) -> Option<&Variable> {
        self.variables.get(id)
    }

    /// Calculation elements keyed by id.
    pub fn calculation_elements(&self) -> &BTreeMap<String, CalculationElement> {
        &self.calculation_elements
    }

    /// One calculation element by id.
    pub fn calculation_element(&self, id: &str) -> Option<&CalculationElement> {
        self.calculation_elements.get(id)
    }

    /// The request table, keyed by tick id.
    pub fn requests(&self) -> &BTreeMap<u64, Vec<Request>> {
        &self.requests
    }

    /// Subscribe to refresh notifications.
    pub fn subscribe_refreshed(&self) -> RefreshReceiver {
        self.refresh_notifier.subscribe()
    }

    /// Open the connection. Idempotent.
    pub async fn connect(&self) -> Result<()> {
        self.driver.connect().await
    }

    /// Close the connection. Idempotent; in-flight exchanges fail fast.
    pub async fn disconnect(&self) -> Result<()> {
        self.driver.disconnect().await
    }

    // ------------------------------------------------------------------
    // Variable lifecycle
    // ------------------------------------------------------------------

    /// Create a variable from a payload and regenerate the request
    /// table. Returns the new variable's id.
    pub fn create_variable(&mut self, payload: &VariablePayload) -> Result<String> {
        let variable = Variable::from_payload(payload, self.ids.as_ref())?;

        if self.variables.contains_key(variable.id()) {
            return Err(GatewayError::DuplicateId(variable.id().to_string()));
        }
        if self.variables.values().any(|v| v.name() == variable.name()) {
            return Err(GatewayError::DuplicateName(variable.name().to_string()));
        }

        let id = variable.id().to_string();
        let mut next = self.variables.clone();
        next.insert(id.clone(), variable);
        let table = Self::build_request_table(&next, &self.grouper)?;

        self.variables = next;
        self.requests = table;
        Ok(id)
    }

    /// Reconstruct a variable from its snapshot merged with a partial
    /// payload, preserving id and notification channel, then
    /// regenerate the request table.
    pub fn edit_variable(&mut self, id: &str, patch: &serde_json::Value) -> Result<()> {
        let current = self
            .variables
            .get(id)
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))?;
        let edited = current.edit_with_payload(patch, self.ids.as_ref())?;

        if self
            .variables
            .values()
            .any(|v| v.id() != id && v.name() == edited.name())
        {
            return Err(GatewayError::DuplicateName(edited.name().to_string()));
        }

        let mut next = self.variables.clone();
        next.insert(id.to_string(), edited);
        let table = Self::build_request_table(&next, &self.grouper)?;

        self.variables = next;
        self.requests = table;
        Ok(())
    }

    /// Remove a variable and regenerate the request table. Returns the
    /// removed instance.
    pub fn remove_variable(&mut self, id: &str) -> Result<Variable> {
        if !self.variables.contains_key(id) {
            return Err(GatewayError::NotFound(id.to_string()));
        }

        let mut next = self.variables.clone();
        let removed = next
            .remove(id)
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))?;
        let table = Self::build_request_table(&next, &self.grouper)?;

        self.variables = next;
        self.requests = table;
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Calculation element lifecycle
    // ------------------------------------------------------------------

    /// Create a calculation element from a payload. Every referenced
    /// source variable must already exist. Returns the new element's
    /// id.
    pub fn create_calculation_element(
        &mut self,
        payload: &CalculationElementPayload,
    ) -> Result<String> {
        let element = CalculationElement::from_payload(payload, self.ids.as_ref())?;

        if self.calculation_elements.contains_key(element.id()) {
            return Err(GatewayError::DuplicateId(element.id().to_string()));
        }
        if self
            .calculation_elements
            .values()
            .any(|e| e.name() == element.name())
        {
            return Err(GatewayError::DuplicateName(element.name().to_string()));
        }
        self.check_sources(&element)?;

        let id = element.id().to_string();
        self.calculation_elements.insert(id.clone(), element);
        Ok(id)
    }

    /// Reconstruct a calculation element from its snapshot merged with
    /// a partial payload, preserving id and notification channel.
    pub fn edit_calculation_element(&mut self, id: &str, patch: &serde_json::Value) -> Result<()> {
        let current = self
            .calculation_elements
            .get(id)
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))?;
        let edited = current.edit_with_payload(patch, self.ids.as_ref())?;

        if self
            .calculation_elements
            .values()
            .any(|e| e.id() != id && e.name() == edited.name())
        {
            return Err(GatewayError::DuplicateName(edited.name().to_string()));
        }
        self.check_sources(&edited)?;

        self.calculation_elements.insert(id.to_string(), edited);
        Ok(())
    }

    /// Remove a calculation element. Returns the removed instance.
    pub fn remove_calculation_element(&mut self, id: &str) -> Result<CalculationElement> {
        self.calculation_elements
            .remove(id)
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))
    }

    fn check_sources(&self, element: &CalculationElement) -> Result<()> {
        for source_id in element.source_variable_ids() {
            if !self.variables.contains_key(source_id) {
                return Err(GatewayError::MissingSource(source_id.to_string()));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Refresh cycle
    // ------------------------------------------------------------------

    /// Run one refresh cycle for the given tick number.
    ///
    /// No-op while the device is inactive. All requests whose tick id
    /// divides `tick` are invoked as one ordered batch, each exchange
    /// bounded by the connection timeout. Any failure abandons the
    /// whole tick without touching variable values and without a
    /// [`crate::core::events::Refreshed`] notification; the failure is
    /// logged, never propagated. This method cannot fail and cannot
    /// panic on driver errors.
    pub async fn refresh(&mut self, tick: u64) {
        if !self.is_active {
            return;
        }

        let driver = Arc::clone(&self.driver);
        let unit_id = self.connection.unit_id;
        let timeout = self.connection.timeout();

        // Invoke the whole batch first; values are staged so a failure
        // mid-batch leaves every variable untouched.
        let mut staged: Vec<(bool, Vec<(String, Value)>)> = Vec::new();
        let mut failure: Option<GatewayError> = None;

        'batch: for (tick_id, batch) in &self.requests {
            if !is_due(tick, *tick_id) {
                continue;
            }
            for request in batch {
                let invoked = tokio::time::timeout(
                    timeout,
                    request.invoke(driver.as_ref(), unit_id, &self.variables),
                )
                .await;
                match invoked {
                    Ok(Ok(values)) => staged.push((request.is_write(), values)),
                    Ok(Err(e)) => {
                        failure = Some(e);
                        break 'batch;
                    }
                    Err(_) => {
                        failure = Some(GatewayError::Timeout(self.connection.timeout_ms));
                        break 'batch;
                    }
                }
            }
        }

        if let Some(error) = failure {
            tracing::warn!(
                device = %self.id,
                tick,
                %error,
                "refresh failed, retrying on the next matching tick"
            );
            self.diagnostics.error_count += 1;
            self.diagnostics.last_error = Some(error.to_string());
            return;
        }

        // Apply the batch and collect the changed-variables map
        let mut changed: HashMap<String, ChangedSample> = HashMap::new();
        for (is_write, values) in staged {
            for (variable_id, value) in values {
                let Some(variable) = self.variables.get_mut(&variable_id) else {
                    continue;
                };
                if !is_write {
                    variable.set_value(value);
                }
                changed.insert(
                    variable_id,
                    ChangedSample {
                        name: variable.name().to_string(),
                        value: variable.value().clone(),
                        archived: variable.archived(),
                        archive_tick_id: variable.archive_tick_id(),
                    },
                );
            }
        }

        // Calculation elements recompute on their own tick membership
        let variables = &self.variables;
        for element in self.calculation_elements.values_mut() {
            element.on_tick(tick, |id| {
                variables.get(id).and_then(|v| v.value().as_f64())
            });
        }

        self.diagnostics.refresh_count += 1;

        if !changed.is_empty() {
            self.refresh_notifier.post(&self.id, tick, changed);
        }
    }

    // ------------------------------------------------------------------
    // Connection replacement and one-shot exchanges
    // ------------------------------------------------------------------

    /// Replace the connection handle and parameters.
    ///
    /// The old handle is disconnected first when the device is active,
    /// then the new one is connected. Every variable's single-element
    /// request is re-bound to the new handle without recreating the
    /// variables, and the request table is regenerated.
    pub async fn rebuild_connection(
        &mut self,
        connection: ConnectionParams,
        driver: Arc<dyn RegisterDriver>,
    ) -> Result<()> {
        if self.is_active {
            if let Err(error) = self.driver.disconnect().await {
                tracing::warn!(device = %self.id, %error, "disconnect of replaced handle failed");
            }
        }

        self.connection = connection;
        self.driver = driver;

        if self.is_active {
            self.driver.connect().await?;
        }

        for variable in self.variables.values_mut() {
            variable.rebind_single_requests();
        }
        self.requests = Self::build_request_table(&self.variables, &self.grouper)?;
        Ok(())
    }

    /// Read one variable through its single-element request,
    /// independent of the batching path. Updates the variable's value.
    pub async fn read_single(&mut self, variable_id: &str) -> Result<Value> {
        let variable = self
            .variables
            .get(variable_id)
            .ok_or_else(|| GatewayError::NotFound(variable_id.to_string()))?;
        let request = variable.single_read().clone();

        let values = tokio::time::timeout(
            self.connection.timeout(),
            request.invoke(self.driver.as_ref(), self.connection.unit_id, &self.variables),
        )
        .await
        .map_err(|_| GatewayError::Timeout(self.connection.timeout_ms))??;

        let (_, value) = values.into_iter().next().ok_or_else(|| {
            GatewayError::Internal(format!("Single read of {variable_id} returned no value"))
        })?;

        if let Some(variable) = self.variables.get_mut(variable_id) {
            variable.set_value(value.clone());
        }
        Ok(value)
    }

    /// Write one variable through its single-element request,
    /// independent of the batching path. Sets the variable's value
    /// first, then pushes it to the device.
    pub async fn write_single(&mut self, variable_id: &str, value: Value) -> Result<()> {
        let variable = self
            .variables
            .get_mut(variable_id)
            .ok_or_else(|| GatewayError::NotFound(variable_id.to_string()))?;
        variable.set_value(value);
        let request = variable.single_write().clone();

        tokio::time::timeout(
            self.connection.timeout(),
            request.invoke(self.driver.as_ref(), self.connection.unit_id, &self.variables),
        )
        .await
        .map_err(|_| GatewayError::Timeout(self.connection.timeout_ms))??;
        Ok(())
    }

    /// Snapshot payload reflecting current state, recursively covering
    /// variables and calculation elements.
    pub fn payload(&self) -> DevicePayload {
        DevicePayload {
            id: Some(self.id.clone()),
            name: self.name.clone(),
            device_type: self.device_type.clone(),
            connection: self.connection.clone(),
            is_active: self.is_active,
            variables: self.variables.values().map(Variable::payload).collect(),
            calculation_elements: self
                .calculation_elements
                .values()
                .map(CalculationElement::payload)
                .collect(),
        }
    }

    /// Build the request table for a variable set: variables are
    /// grouped per distinct tick id, each group packed by
    /// [`group_requests`]. Built into a fresh map so the caller can
    /// swap it in only on success.
    fn build_request_table(
        variables: &BTreeMap<String, Variable>,
        config: &GrouperConfig,
    ) -> Result<BTreeMap<u64, Vec<Request>>> {
        let mut by_tick: BTreeMap<u64, Vec<&Variable>> = BTreeMap::new();
        for variable in variables.values() {
            by_tick.entry(variable.tick_id()).or_default().push(variable);
        }

        let mut table = BTreeMap::new();
        for (tick_id, group) in by_tick {
            table.insert(tick_id, group_requests(&group, config)?);
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::id::SequentialProvider;
    use crate::driver::VirtualDriver;

    fn connection() -> ConnectionParams {
        ConnectionParams {
            address: "127.0.0.1".to_string(),
            port: 502,
            unit_id: 1,
            timeout_ms: 200,
        }
    }

    fn variable_payload(name: &str, kind: &str, offset: u16, fcode: u8) -> VariablePayload {
        VariablePayload {
            id: Some(name.to_string()),
            name: name.to_string(),
            kind: kind.to_string(),
            offset,
            fcode,
            sample_time: 10,
            archive_sample_time: None,
            unit: String::new(),
            archived: false,
            byte_length: None,
            value: Value::Null,
        }
    }

    fn device_payload(variables: Vec<VariablePayload>) -> DevicePayload {
        DevicePayload {
            id: Some("dev".to_string()),
            name: "meter".to_string(),
            device_type: "generic".to_string(),
            connection: connection(),
            is_active: true,
            variables,
            calculation_elements: Vec::new(),
        }
    }

    fn device_with(variables: Vec<VariablePayload>) -> (Device, Arc<VirtualDriver>) {
        let driver = Arc::new(VirtualDriver::new());
        let device = Device::from_payload_with_ids(
            &device_payload(variables),
            driver.clone(),
            Arc::new(SequentialProvider::new("gen")),
        )
        .unwrap();
        (device, driver)
    }

    #[test]
    fn test_bootstrap_builds_request_table() {
        let (device, _) = device_with(vec![
            variable_payload("a", "uint16", 100, 3),
            variable_payload("b", "uint16", 101, 3),
        ]);

        assert_eq!(device.variables().len(), 2);
        let table = device.requests();
        assert_eq!(table.len(), 1);
        assert_eq!(table[&10].len(), 1);
        assert_eq!(table[&10][0].connections().len(), 2);
    }

    #[test]
    fn test_empty_payload_bootstraps_empty_device() {
        let (device, _) = device_with(vec![]);
        assert!(device.variables().is_empty());
        assert!(device.calculation_elements().is_empty());
        assert!(device.requests().is_empty());
    }

    #[test]
    fn test_duplicate_variable_id_rejected() {
        let (mut device, _) = device_with(vec![variable_payload("a", "uint16", 100, 3)]);
        let err = device
            .create_variable(&variable_payload("a", "uint16", 200, 3))
            .unwrap_err();
        assert!(matches!(err, GatewayError::DuplicateId(_)));
        // Prior state untouched
        assert_eq!(device.variables().len(), 1);
    }

    #[test]
    fn test_duplicate_variable_name_rejected() {
        let (mut device, _) = device_with(vec![variable_payload("a", "uint16", 100, 3)]);
        let mut payload = variable_payload("a2", "uint16", 200, 3);
        payload.name = "a".to_string();
        let err = device.create_variable(&payload).unwrap_err();
        assert!(matches!(err, GatewayError::DuplicateName(_)));
    }

    #[test]
    fn test_structural_change_regenerates_table() {
        let (mut device, _) = device_with(vec![
            variable_payload("a", "uint16", 100, 3),
            variable_payload("b", "uint16", 101, 3),
        ]);
        assert_eq!(device.requests()[&10].len(), 1);

        // Moving one variable away splits the window
        device
            .edit_variable("b", &serde_json::json!({"offset": 300}))
            .unwrap();
        assert_eq!(device.requests()[&10].len(), 2);

        // A new sampling period gets its own table entry
        device
            .edit_variable("b", &serde_json::json!({"sampleTime": 60}))
            .unwrap();
        assert_eq!(device.requests().len(), 2);
        assert_eq!(device.requests()[&60].len(), 1);

        // Removal shrinks the table back
        device.remove_variable("b").unwrap();
        assert_eq!(device.requests().len(), 1);
        assert_eq!(device.requests()[&10][0].connections().len(), 1);
    }

    #[test]
    fn test_edit_keeps_variable_identity() {
        let (mut device, _) = device_with(vec![variable_payload("a", "uint16", 100, 3)]);
        let notifier = device.variable("a").unwrap().notifier().clone();

        device
            .edit_variable("a", &serde_json::json!({"offset": 5}))
            .unwrap();

        let edited = device.variable("a").unwrap();
        assert_eq!(edited.id(), "a");
        assert_eq!(edited.offset(), 5);
        assert!(edited.notifier().same_channel(&notifier));
    }

    #[test]
    fn test_invalid_edit_leaves_device_untouched() {
        let (mut device, _) = device_with(vec![variable_payload("a", "uint16", 100, 3)]);
        let err = device
            .edit_variable("a", &serde_json::json!({"fCode": 9}))
            .unwrap_err();
        assert!(matches!(err, GatewayError::IllegalFunctionCode { .. }));
        assert_eq!(device.variable("a").unwrap().fcode(), 3);
        assert_eq!(device.requests()[&10][0].connections().len(), 1);
    }

    #[test]
    fn test_element_requires_existing_source() {
        let (mut device, _) = device_with(vec![variable_payload("a", "uint16", 100, 3)]);

        let mut payload = CalculationElementPayload {
            id: None,
            name: "scaled".to_string(),
            kind: "factor".to_string(),
            unit: String::new(),
            archived: false,
            sample_time: 10,
            archive_sample_time: None,
            variable_id: Some("missing".to_string()),
            factor: Some(2.0),
            variables: None,
            calculation_interval: None,
            overflow: None,
            value: Value::Null,
        };
        let err = device.create_calculation_element(&payload).unwrap_err();
        assert!(matches!(err, GatewayError::MissingSource(_)));

        payload.variable_id = Some("a".to_string());
        device.create_calculation_element(&payload).unwrap();
        assert_eq!(device.calculation_elements().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_inactive_is_noop() {
        let (mut device, driver) = device_with(vec![variable_payload("a", "uint16", 100, 3)]);
        device.set_active(false);
        driver.connect().await.unwrap();
        driver.set_holding_registers(1, 100, &[0x0100]);
        let mut rx = device.subscribe_refreshed();

        device.refresh(10).await;

        assert!(device.variable("a").unwrap().value().is_null());
        assert!(rx.try_recv().is_err());
        assert_eq!(device.diagnostics().refresh_count, 0);
    }

    #[tokio::test]
    async fn test_refresh_updates_values_and_notifies() {
        let (mut device, driver) = device_with(vec![
            variable_payload("a", "uint16", 100, 3),
            variable_payload("b", "uint16", 101, 3),
        ]);
        device.connect().await.unwrap();
        driver.set_holding_registers(1, 100, &[0x0100, 0x0200]);
        let mut rx = device.subscribe_refreshed();

        device.refresh(10).await;

        assert_eq!(device.variable("a").unwrap().value(), &Value::Integer(1));
        assert_eq!(device.variable("b").unwrap().value(), &Value::Integer(2));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.device_id, "dev");
        assert_eq!(event.tick, 10);
        assert_eq!(event.changed.len(), 2);
        assert_eq!(event.changed["a"].value, Value::Integer(1));
        assert_eq!(device.diagnostics().refresh_count, 1);
    }

    #[tokio::test]
    async fn test_refresh_skips_non_matching_ticks() {
        let (mut device, driver) = device_with(vec![variable_payload("a", "uint16", 100, 3)]);
        device.connect().await.unwrap();
        driver.set_holding_registers(1, 100, &[1]);
        let mut rx = device.subscribe_refreshed();

        device.refresh(7).await;
        assert!(rx.try_recv().is_err());
        assert!(device.variable("a").unwrap().value().is_null());
    }

    #[tokio::test]
    async fn test_refresh_mixed_periods_only_due_variables() {
        let mut slow = variable_payload("slow", "uint16", 200, 3);
        slow.sample_time = 20;
        let (mut device, driver) =
            device_with(vec![variable_payload("fast", "uint16", 100, 3), slow]);
        device.connect().await.unwrap();
        driver.set_holding_registers(1, 100, &[0x0100]);
        driver.set_holding_registers(1, 200, &[0x0200]);
        let mut rx = device.subscribe_refreshed();

        device.refresh(10).await;
        let event = rx.try_recv().unwrap();
        assert_eq!(event.changed.len(), 1);
        assert!(event.changed.contains_key("fast"));

        device.refresh(20).await;
        let event = rx.try_recv().unwrap();
        assert_eq!(event.changed.len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_swallows_driver_failure() {
        let (mut device, driver) = device_with(vec![variable_payload("a", "uint16", 100, 3)]);
        device.connect().await.unwrap();
        driver.fail_next();
        let mut rx = device.subscribe_refreshed();

        device.refresh(10).await;

        assert!(rx.try_recv().is_err());
        assert!(device.variable("a").unwrap().value().is_null());
        assert_eq!(device.diagnostics().error_count, 1);
        assert!(device.diagnostics().last_error.is_some());

        // Next matching tick succeeds again
        driver.set_holding_registers(1, 100, &[1]);
        device.refresh(20).await;
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_refresh_swallows_disconnected_driver() {
        let (mut device, _driver) = device_with(vec![variable_payload("a", "uint16", 100, 3)]);
        let mut rx = device.subscribe_refreshed();

        device.refresh(10).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(device.diagnostics().error_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_times_out_and_swallows() {
        let (mut device, driver) = device_with(vec![variable_payload("a", "uint16", 100, 3)]);
        device.connect().await.unwrap();
        driver.set_response_delay(Some(Duration::from_secs(5)));
        let mut rx = device.subscribe_refreshed();

        device.refresh(10).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(device.diagnostics().error_count, 1);
        assert!(device
            .diagnostics()
            .last_error
            .as_deref()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn test_refresh_drives_calculation_elements() {
        let (mut device, driver) = device_with(vec![variable_payload("a", "uint16", 100, 3)]);
        device.connect().await.unwrap();
        driver.set_holding_registers(1, 100, &[0x0400]);

        device
            .create_calculation_element(&CalculationElementPayload {
                id: Some("scaled".to_string()),
                name: "scaled".to_string(),
                kind: "factor".to_string(),
                unit: String::new(),
                archived: false,
                sample_time: 10,
                archive_sample_time: None,
                variable_id: Some("a".to_string()),
                factor: Some(0.5),
                variables: None,
                calculation_interval: None,
                overflow: None,
                value: Value::Null,
            })
            .unwrap();

        device.refresh(10).await;

        assert_eq!(device.variable("a").unwrap().value(), &Value::Integer(4));
        assert_eq!(
            device.calculation_element("scaled").unwrap().value(),
            &Value::Float(2.0)
        );
    }

    #[tokio::test]
    async fn test_rebuild_connection_keeps_variable_identity() {
        let (mut device, old_driver) = device_with(vec![variable_payload("a", "uint16", 100, 3)]);
        device.connect().await.unwrap();
        let notifier = device.variable("a").unwrap().notifier().clone();

        let new_driver = Arc::new(VirtualDriver::new());
        new_driver.set_holding_registers(7, 100, &[0x0900]);
        device
            .rebuild_connection(
                ConnectionParams {
                    address: "10.0.0.9".to_string(),
                    port: 1502,
                    unit_id: 7,
                    timeout_ms: 200,
                },
                new_driver.clone(),
            )
            .await
            .unwrap();

        // Old handle was disconnected, new one connected (device active)
        assert!(!old_driver.is_connected());
        assert!(new_driver.is_connected());

        let variable = device.variable("a").unwrap();
        assert_eq!(variable.id(), "a");
        assert!(variable.notifier().same_channel(&notifier));

        // Polling now reads through the new handle and unit id
        device.refresh(10).await;
        assert_eq!(device.variable("a").unwrap().value(), &Value::Integer(9));
    }

    #[tokio::test]
    async fn test_read_and_write_single() {
        let (mut device, driver) = device_with(vec![
            variable_payload("a", "uint16", 100, 3),
            variable_payload("flag", "boolean", 5, 1),
        ]);
        device.connect().await.unwrap();
        driver.set_holding_registers(1, 100, &[0x2100]);

        let value = device.read_single("a").await.unwrap();
        assert_eq!(value, Value::Integer(0x21));
        assert_eq!(device.variable("a").unwrap().value(), &Value::Integer(0x21));

        device.write_single("a", Value::Integer(0x42)).await.unwrap();
        assert_eq!(driver.holding_register(1, 100), Some(0x4200));

        // Boolean single write goes through the write-single-coil path
        device
            .write_single("flag", Value::Bool(true))
            .await
            .unwrap();
        assert_eq!(driver.coil(1, 5), Some(true));
    }

    #[tokio::test]
    async fn test_read_single_propagates_communication_error() {
        let (mut device, driver) = device_with(vec![variable_payload("a", "uint16", 100, 3)]);
        device.connect().await.unwrap();
        driver.fail_next();

        let err = device.read_single("a").await.unwrap_err();
        assert!(matches!(err, GatewayError::Communication(_)));
    }

    #[test]
    fn test_payload_snapshot_roundtrip() {
        let (device, driver) = device_with(vec![
            variable_payload("a", "uint16", 100, 3),
            variable_payload("flag", "boolean", 5, 1),
        ]);

        let snapshot = device.payload();
        assert_eq!(snapshot.id.as_deref(), Some("dev"));
        assert_eq!(snapshot.variables.len(), 2);
        assert!(snapshot.is_active);

        let rebuilt = Device::from_payload(&snapshot, driver).unwrap();
        assert_eq!(rebuilt.id(), device.id());
        assert_eq!(rebuilt.variables().len(), 2);
        assert_eq!(rebuilt.requests().len(), device.requests().len());
    }

    #[test]
    fn test_payload_json_shape() {
        let json = serde_json::json!({
            "name": "inverter",
            "type": "generic",
            "address": "192.168.1.50",
            "isActive": true,
            "variables": [{
                "name": "power",
                "type": "swappedFloat",
                "offset": 40,
                "fCode": 4,
                "sampleTime": 5
            }]
        });
        let payload: DevicePayload = serde_json::from_value(json).unwrap();
        assert_eq!(payload.connection.port, 502);
        assert_eq!(payload.connection.timeout_ms, 3000);

        let device = Device::from_payload(&payload, Arc::new(VirtualDriver::new())).unwrap();
        assert_eq!(device.variables().len(), 1);
        let variable = device.variables().values().next().unwrap();
        assert_eq!(variable.kind().type_name(), "swappedFloat");
        assert_eq!(variable.tick_id(), 5);
    }
}
