//! Calculation elements.
//!
//! Derived metering quantities computed from variable values on their
//! own sampling cadence, never read from the wire directly. The kinds
//! form a small closed set: `factor`, `sum`, `average` and `increase`.

use serde::{Deserialize, Serialize};

use crate::core::error::{GatewayError, Result};
use crate::core::events::{ValueNotifier, ValueReceiver};
use crate::core::id::IdProvider;
use crate::core::tick::is_due;
use crate::core::value::Value;

/// Closed set of calculation element kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CalculationKind {
    /// Scaled copy of one variable.
    Factor,

    /// Weighted sum over a set of variables.
    Sum,

    /// Interval average of one variable.
    Average,

    /// Interval delta of a monotonically increasing counter, with
    /// wraparound correction.
    Increase,
}

impl CalculationKind {
    /// Parse a payload `type` discriminant.
    pub fn from_type_name(name: &str) -> Result<Self> {
        match name {
            "factor" => Ok(Self::Factor),
            "sum" => Ok(Self::Sum),
            "average" => Ok(Self::Average),
            "increase" => Ok(Self::Increase),
            other => Err(GatewayError::UnknownKind(other.to_string())),
        }
    }

    /// The payload `type` discriminant string.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Factor => "factor",
            Self::Sum => "sum",
            Self::Average => "average",
            Self::Increase => "increase",
        }
    }
}

impl std::fmt::Display for CalculationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// One weighted source of a `sum` element.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SumSource {
    /// Source variable id.
    pub variable_id: String,

    /// Scale applied to the source value.
    #[serde(default = "default_factor")]
    pub factor: f64,
}

fn default_factor() -> f64 {
    1.0
}

/// Calculation element creation and snapshot payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalculationElementPayload {
    /// Entity id; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Display name.
    pub name: String,

    /// Kind discriminant: `factor` | `sum` | `average` | `increase`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Display unit.
    #[serde(default)]
    pub unit: String,

    /// Whether a historian should record this element.
    #[serde(default)]
    pub archived: bool,

    /// Sampling period in seconds.
    pub sample_time: u64,

    /// Separate period for historized snapshots; defaults to
    /// `sample_time`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_sample_time: Option<u64>,

    /// Source variable (factor / average / increase).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable_id: Option<String>,

    /// Scale applied to the source value; defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factor: Option<f64>,

    /// Weighted source set (sum).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Vec<SumSource>>,

    /// Window length in ticks (average / increase).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calculation_interval: Option<u64>,

    /// Counter wraparound ceiling (increase).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overflow: Option<f64>,

    /// Current computed value; `Null` when never computed.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub value: Value,
}

/// Kind-specific binding and accumulation state.
#[derive(Debug, Clone)]
enum ElementState {
    Factor {
        variable_id: String,
        factor: f64,
    },
    Sum {
        sources: Vec<SumSource>,
    },
    Average {
        variable_id: String,
        factor: f64,
        calculation_interval: u64,
        sum: f64,
        count: u64,
    },
    Increase {
        variable_id: String,
        factor: f64,
        calculation_interval: u64,
        overflow: f64,
        last_raw: Option<f64>,
    },
}

/// A derived metering quantity.
#[derive(Debug, Clone)]
pub struct CalculationElement {
    id: String,
    name: String,
    unit: String,
    archived: bool,
    tick_id: u64,
    archive_tick_id: u64,
    value: Value,
    notifier: ValueNotifier,
    state: ElementState,
}

impl CalculationElement {
    /// Build an element from a creation payload.
    ///
    /// Kind-specific required fields are validated here; the existence
    /// of referenced source variables is the owning device's check.
    pub fn from_payload(payload: &CalculationElementPayload, ids: &dyn IdProvider) -> Result<Self> {
        let kind = CalculationKind::from_type_name(&payload.kind)?;

        if payload.name.is_empty() {
            return Err(GatewayError::validation("Element name must not be empty"));
        }
        if payload.sample_time == 0 {
            return Err(GatewayError::validation(
                "Element sample time must be positive",
            ));
        }

        let factor = payload.factor.unwrap_or(1.0);
        let state = match kind {
            CalculationKind::Factor => ElementState::Factor {
                variable_id: required_variable(payload, kind)?,
                factor,
            },
            CalculationKind::Sum => ElementState::Sum {
                sources: payload.variables.clone().unwrap_or_default(),
            },
            CalculationKind::Average => ElementState::Average {
                variable_id: required_variable(payload, kind)?,
                factor,
                calculation_interval: required_interval(payload, kind)?,
                sum: 0.0,
                count: 0,
            },
            CalculationKind::Increase => {
                let overflow = payload.overflow.ok_or_else(|| {
                    GatewayError::validation("increase element requires an overflow ceiling")
                })?;
                if overflow <= 0.0 {
                    return Err(GatewayError::validation(
                        "increase overflow must be positive",
                    ));
                }
                ElementState::Increase {
                    variable_id: required_variable(payload, kind)?,
                    factor,
                    calculation_interval: required_interval(payload, kind)?,
                    overflow,
                    last_raw: None,
                }
            }
        };

        let tick_id = payload.sample_time;
        let archive_tick_id = match payload.archive_sample_time {
            Some(0) => {
                return Err(GatewayError::validation(
                    "Element archive sample time must be positive",
                ))
            }
            Some(t) => t,
            None => tick_id,
        };

        Ok(Self {
            id: payload.id.clone().unwrap_or_else(|| ids.next_id()),
            name: payload.name.clone(),
            unit: payload.unit.clone(),
            archived: payload.archived,
            tick_id,
            archive_tick_id,
            value: payload.value.clone(),
            notifier: ValueNotifier::new(),
            state,
        })
    }

    /// Rebuild this element from its snapshot merged with a partial
    /// payload, keeping id and notification channel.
    ///
    /// Accumulation state restarts from empty; an invalid merged
    /// payload fails the edit atomically.
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
        target.insert("id".to_string(), serde_json::json!(self.id));

        let payload: CalculationElementPayload = serde_json::from_value(merged)
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

    /// Element kind.
    pub fn kind(&self) -> CalculationKind {
        match self.state {
            ElementState::Factor { .. } => CalculationKind::Factor,
            ElementState::Sum { .. } => CalculationKind::Sum,
            ElementState::Average { .. } => CalculationKind::Average,
            ElementState::Increase { .. } => CalculationKind::Increase,
        }
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

    /// Whether a historian should record this element.
    pub fn archived(&self) -> bool {
        self.archived
    }

    /// Current computed value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Subscribe to computed-value changes.
    pub fn subscribe(&self) -> ValueReceiver {
        self.notifier.subscribe()
    }

    /// The notification channel handle (shared across edits).
    pub fn notifier(&self) -> &ValueNotifier {
        &self.notifier
    }

    /// Ids of every variable this element reads.
    pub fn source_variable_ids(&self) -> Vec<&str> {
        match &self.state {
            ElementState::Factor { variable_id, .. }
            | ElementState::Average { variable_id, .. }
            | ElementState::Increase { variable_id, .. } => vec![variable_id.as_str()],
            ElementState::Sum { sources } => {
                sources.iter().map(|s| s.variable_id.as_str()).collect()
            }
        }
    }

    /// Advance the element by one scheduler tick.
    ///
    /// `resolve` yields the current numeric value of a variable, or
    /// `None` when the variable is missing or not yet sampled. A
    /// missing source never fails the tick; the element simply does not
    /// update.
    pub fn on_tick<F>(&mut self, tick: u64, resolve: F)
    where
        F: Fn(&str) -> Option<f64>,
    {
        if !is_due(tick, self.tick_id) {
            return;
        }

        let computed = match &mut self.state {
            ElementState::Factor {
                variable_id,
                factor,
            } => match resolve(variable_id) {
                Some(v) => Some(v * *factor),
                None => {
                    tracing::trace!(element = %self.id, variable = %variable_id, "source not sampled yet");
                    None
                }
            },

            ElementState::Sum { sources } => {
                let mut total = 0.0;
                let mut complete = true;
                for source in sources.iter() {
                    match resolve(&source.variable_id) {
                        Some(v) => total += v * source.factor,
                        None => {
                            complete = false;
                            break;
                        }
                    }
                }
                complete.then_some(total)
            }

            ElementState::Average {
                variable_id,
                factor,
                calculation_interval,
                sum,
                count,
            } => {
                if let Some(v) = resolve(variable_id) {
                    *sum += v;
                    *count += 1;
                }
                if is_due(tick, *calculation_interval) && *count > 0 {
                    let average = *sum / *count as f64 * *factor;
                    *sum = 0.0;
                    *count = 0;
                    Some(average)
                } else {
                    None
                }
            }

            ElementState::Increase {
                variable_id,
                factor,
                calculation_interval,
                overflow,
                last_raw,
            } => {
                if !is_due(tick, *calculation_interval) {
                    None
                } else if let Some(current) = resolve(variable_id) {
                    let delta = last_raw.map(|previous| {
                        let mut delta = current - previous;
                        if delta < 0.0 {
                            // Counter wrapped around its ceiling
                            delta = (*overflow - previous) + current;
                        }
                        delta * *factor
                    });
                    *last_raw = Some(current);
                    delta
                } else {
                    None
                }
            }
        };

        if let Some(v) = computed {
            self.set_value(Value::Float(v));
        }
    }

    /// Replace the computed value and notify subscribers.
    fn set_value(&mut self, value: Value) {
        self.value = value.clone();
        self.notifier.post(&self.id, &self.name, value);
    }

    /// Snapshot payload reflecting current state.
    pub fn payload(&self) -> CalculationElementPayload {
        let kind = self.kind();
        let (variable_id, factor, variables, calculation_interval, overflow) = match &self.state {
            ElementState::Factor {
                variable_id,
                factor,
            } => (Some(variable_id.clone()), Some(*factor), None, None, None),
            ElementState::Sum { sources } => (None, None, Some(sources.clone()), None, None),
            ElementState::Average {
                variable_id,
                factor,
                calculation_interval,
                ..
            } => (
                Some(variable_id.clone()),
                Some(*factor),
                None,
                Some(*calculation_interval),
                None,
            ),
            ElementState::Increase {
                variable_id,
                factor,
                calculation_interval,
                overflow,
                ..
            } => (
                Some(variable_id.clone()),
                Some(*factor),
                None,
                Some(*calculation_interval),
                Some(*overflow),
            ),
        };

        CalculationElementPayload {
            id: Some(self.id.clone()),
            name: self.name.clone(),
            kind: kind.type_name().to_string(),
            unit: self.unit.clone(),
            archived: self.archived,
            sample_time: self.tick_id,
            archive_sample_time: Some(self.archive_tick_id),
            variable_id,
            factor,
            variables,
            calculation_interval,
            overflow,
            value: self.value.clone(),
        }
    }
}

fn required_variable(
    payload: &CalculationElementPayload,
    kind: CalculationKind,
) -> Result<String> {
    payload.variable_id.clone().ok_or_else(|| {
        GatewayError::validation(format!("{kind} element requires a source variable"))
    })
}

fn required_interval(payload: &CalculationElementPayload, kind: CalculationKind) -> Result<u64> {
    match payload.calculation_interval {
        Some(0) | None => Err(GatewayError::validation(format!(
            "{kind} element requires a positive calculation interval"
        ))),
        Some(interval) => Ok(interval),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::id::SequentialProvider;

    fn payload(kind: &str) -> CalculationElementPayload {
        CalculationElementPayload {
            id: None,
            name: format!("{kind}-element"),
            kind: kind.to_string(),
            unit: String::new(),
            archived: false,
            sample_time: 1,
            archive_sample_time: None,
            variable_id: Some("src".to_string()),
            factor: None,
            variables: None,
            calculation_interval: None,
            overflow: None,
            value: Value::Null,
        }
    }

    #[test]
    fn test_factor_scales_source() {
        let ids = SequentialProvider::new("el");
        let mut p = payload("factor");
        p.factor = Some(2.5);
        let mut element = CalculationElement::from_payload(&p, &ids).unwrap();

        element.on_tick(1, |_| Some(4.0));
        assert_eq!(element.value(), &Value::Float(10.0));
    }

    #[test]
    fn test_factor_skips_missing_source() {
        let ids = SequentialProvider::new("el");
        let mut element = CalculationElement::from_payload(&payload("factor"), &ids).unwrap();

        element.on_tick(1, |_| None);
        assert!(element.value().is_null());
    }

    #[test]
    fn test_factor_respects_tick_id() {
        let ids = SequentialProvider::new("el");
        let mut p = payload("factor");
        p.sample_time = 10;
        let mut element = CalculationElement::from_payload(&p, &ids).unwrap();

        element.on_tick(9, |_| Some(1.0));
        assert!(element.value().is_null());
        element.on_tick(10, |_| Some(1.0));
        assert_eq!(element.value(), &Value::Float(1.0));
    }

    #[test]
    fn test_sum_weights_sources() {
        let ids = SequentialProvider::new("el");
        let mut p = payload("sum");
        p.variable_id = None;
        p.variables = Some(vec![
            SumSource {
                variable_id: "a".to_string(),
                factor: 1.0,
            },
            SumSource {
                variable_id: "b".to_string(),
                factor: -2.0,
            },
        ]);
        let mut element = CalculationElement::from_payload(&p, &ids).unwrap();

        element.on_tick(1, |id| match id {
            "a" => Some(10.0),
            "b" => Some(3.0),
            _ => None,
        });
        assert_eq!(element.value(), &Value::Float(4.0));
    }

    #[test]
    fn test_sum_with_empty_source_set_yields_zero() {
        let ids = SequentialProvider::new("el");
        let mut p = payload("sum");
        p.variable_id = None;
        let mut element = CalculationElement::from_payload(&p, &ids).unwrap();

        element.on_tick(1, |_| None);
        assert_eq!(element.value(), &Value::Float(0.0));
    }

    #[test]
    fn test_sum_skips_when_any_source_missing() {
        let ids = SequentialProvider::new("el");
        let mut p = payload("sum");
        p.variable_id = None;
        p.variables = Some(vec![
            SumSource {
                variable_id: "a".to_string(),
                factor: 1.0,
            },
            SumSource {
                variable_id: "b".to_string(),
                factor: 1.0,
            },
        ]);
        let mut element = CalculationElement::from_payload(&p, &ids).unwrap();

        element.on_tick(1, |id| (id == "a").then_some(1.0));
        assert!(element.value().is_null());
    }

    #[test]
    fn test_average_over_one_interval() {
        let ids = SequentialProvider::new("el");
        let mut p = payload("average");
        p.calculation_interval = Some(3);
        let mut element = CalculationElement::from_payload(&p, &ids).unwrap();

        let samples = [10.0, 20.0, 30.0];
        for (i, sample) in samples.iter().enumerate() {
            element.on_tick(i as u64 + 1, |_| Some(*sample));
        }
        assert_eq!(element.value(), &Value::Float(20.0));

        // Accumulator reset: a lone sample does not average yet
        element.on_tick(4, |_| Some(40.0));
        assert_eq!(element.value(), &Value::Float(20.0));

        // Interval closes at tick 6 over samples 40, 50, 60
        element.on_tick(5, |_| Some(50.0));
        element.on_tick(6, |_| Some(60.0));
        assert_eq!(element.value(), &Value::Float(50.0));
    }

    #[test]
    fn test_average_skips_empty_interval() {
        let ids = SequentialProvider::new("el");
        let mut p = payload("average");
        p.calculation_interval = Some(2);
        let mut element = CalculationElement::from_payload(&p, &ids).unwrap();

        element.on_tick(1, |_| None);
        element.on_tick(2, |_| None);
        assert!(element.value().is_null());
    }

    #[test]
    fn test_increase_deltas_and_overflow() {
        let ids = SequentialProvider::new("el");
        let mut p = payload("increase");
        p.sample_time = 1;
        p.calculation_interval = Some(10);
        p.overflow = Some(1000.0);
        let mut element = CalculationElement::from_payload(&p, &ids).unwrap();

        // First sample establishes the baseline, no computed value
        element.on_tick(10, |_| Some(100.0));
        assert!(element.value().is_null());

        element.on_tick(20, |_| Some(300.0));
        assert_eq!(element.value(), &Value::Float(200.0));

        // Counter wrapped: (1000 - 300) + 50
        element.on_tick(30, |_| Some(50.0));
        assert_eq!(element.value(), &Value::Float(750.0));
    }

    #[test]
    fn test_increase_applies_factor() {
        let ids = SequentialProvider::new("el");
        let mut p = payload("increase");
        p.calculation_interval = Some(1);
        p.overflow = Some(1000.0);
        p.factor = Some(0.1);
        let mut element = CalculationElement::from_payload(&p, &ids).unwrap();

        element.on_tick(1, |_| Some(100.0));
        element.on_tick(2, |_| Some(150.0));
        assert_eq!(element.value(), &Value::Float(5.0));
    }

    #[test]
    fn test_increase_ignores_mid_interval_ticks() {
        let ids = SequentialProvider::new("el");
        let mut p = payload("increase");
        p.calculation_interval = Some(10);
        p.overflow = Some(1000.0);
        let mut element = CalculationElement::from_payload(&p, &ids).unwrap();

        element.on_tick(10, |_| Some(100.0));
        // Mid-interval ticks sample nothing for the delta
        element.on_tick(15, |_| Some(999.0));
        element.on_tick(20, |_| Some(300.0));
        assert_eq!(element.value(), &Value::Float(200.0));
    }

    #[test]
    fn test_validation_of_required_fields() {
        let ids = SequentialProvider::new("el");

        let mut p = payload("factor");
        p.variable_id = None;
        assert!(CalculationElement::from_payload(&p, &ids).is_err());

        let p = payload("average"); // no interval
        assert!(CalculationElement::from_payload(&p, &ids).is_err());

        let mut p = payload("increase");
        p.calculation_interval = Some(10);
        assert!(CalculationElement::from_payload(&p, &ids).is_err()); // no overflow

        p.overflow = Some(-1.0);
        assert!(CalculationElement::from_payload(&p, &ids).is_err());

        let mut p = payload("factor");
        p.kind = "median".to_string();
        assert!(matches!(
            CalculationElement::from_payload(&p, &ids),
            Err(GatewayError::UnknownKind(_))
        ));
    }

    #[test]
    fn test_edit_preserves_id_and_channel() {
        let ids = SequentialProvider::new("el");
        let mut p = payload("factor");
        p.factor = Some(2.0);
        let element = CalculationElement::from_payload(&p, &ids).unwrap();
        let mut rx = element.subscribe();

        let mut edited = element
            .edit_with_payload(&serde_json::json!({"factor": 3.0}), &ids)
            .unwrap();
        assert_eq!(edited.id(), element.id());
        assert!(edited.notifier().same_channel(element.notifier()));

        edited.on_tick(1, |_| Some(2.0));
        assert_eq!(rx.try_recv().unwrap().value, Value::Float(6.0));
    }

    #[test]
    fn test_payload_snapshot_roundtrip() {
        let ids = SequentialProvider::new("el");
        let mut p = payload("increase");
        p.calculation_interval = Some(15);
        p.overflow = Some(65536.0);
        p.unit = "kWh".to_string();
        p.archived = true;
        let element = CalculationElement::from_payload(&p, &ids).unwrap();

        let snapshot = element.payload();
        assert_eq!(snapshot.kind, "increase");
        assert_eq!(snapshot.calculation_interval, Some(15));
        assert_eq!(snapshot.overflow, Some(65536.0));
        assert!(snapshot.archived);

        let rebuilt = CalculationElement::from_payload(&snapshot, &ids).unwrap();
        assert_eq!(rebuilt.id(), element.id());
        assert_eq!(rebuilt.kind(), CalculationKind::Increase);
    }
}
