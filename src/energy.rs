//! Battery energy and history accounting
//!
//! Integrates voltage/current samples over time into charged/discharged
//! energy and total amp-hours drawn, and tracks the voltage extremes of
//! samples inside the plausible battery range.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::config::BatteryConfig;
use crate::normalize::finite_number;

const MS_PER_HOUR: f64 = 3_600_000.0;

/// Cumulative history of one battery
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HistoryRecord {
    /// Lowest accepted voltage; absent until a sample passed the guard band
    pub minimum_voltage: Option<f64>,
    pub maximum_voltage: Option<f64>,
    #[serde(rename = "chargedEnergyKWh")]
    pub charged_energy_kwh: f64,
    #[serde(rename = "dischargedEnergyKWh")]
    pub discharged_energy_kwh: f64,
    pub total_ah_drawn: f64,
}

/// Accumulators only grow from zero
fn clamp_accumulator(v: &mut f64) {
    if !v.is_finite() || *v < 0.0 {
        *v = 0.0;
    }
}

impl HistoryRecord {
    /// Reset non-finite or negative accumulators to 0 and drop non-finite
    /// extremes
    pub fn sanitize(&mut self) {
        clamp_accumulator(&mut self.charged_energy_kwh);
        clamp_accumulator(&mut self.discharged_energy_kwh);
        clamp_accumulator(&mut self.total_ah_drawn);
        self.minimum_voltage = self.minimum_voltage.filter(|v| v.is_finite());
        self.maximum_voltage = self.maximum_voltage.filter(|v| v.is_finite());
    }
}

/// Previous sample of one battery
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccumulatorState {
    pub last_voltage: f64,
    pub last_current: f64,
    pub last_timestamp_ms: i64,
}

/// Provider of the charge sources feeding the amp-hour formula
pub trait AuxCurrentSource: Send + Sync {
    fn solar_current(&self) -> Option<f64>;
    fn alternator_current(&self) -> Option<f64>;

    /// Offer an upstream update; returns true if it was a source current
    fn observe(&mut self, _path: &str, _value: &serde_json::Value) -> bool {
        false
    }
}

/// Latest solar and alternator currents, read from configured upstream paths
#[derive(Debug, Clone, Default)]
pub struct AuxCurrents {
    solar_path: Option<String>,
    alternator_path: Option<String>,
    solar: Option<f64>,
    alternator: Option<f64>,
}

impl AuxCurrents {
    pub fn new(solar_path: Option<String>, alternator_path: Option<String>) -> Self {
        Self {
            solar_path,
            alternator_path,
            solar: None,
            alternator: None,
        }
    }
}

impl AuxCurrentSource for AuxCurrents {
    fn solar_current(&self) -> Option<f64> {
        self.solar
    }

    fn alternator_current(&self) -> Option<f64> {
        self.alternator
    }

    fn observe(&mut self, path: &str, value: &serde_json::Value) -> bool {
        if self.solar_path.as_deref() == Some(path) {
            self.solar = finite_number(value);
            true
        } else if self.alternator_path.as_deref() == Some(path) {
            self.alternator = finite_number(value);
            true
        } else {
            false
        }
    }
}

pub struct EnergyAccumulator {
    min_voltage: f64,
    max_voltage: f64,
    states: HashMap<String, AccumulatorState>,
    history: HashMap<String, HistoryRecord>,
    aux: Box<dyn AuxCurrentSource>,
}

impl EnergyAccumulator {
    pub fn new(config: &BatteryConfig) -> Self {
        Self::with_source(
            config.min_voltage,
            config.max_voltage,
            Box::new(AuxCurrents::new(
                config.solar_current_path.clone(),
                config.alternator_current_path.clone(),
            )),
        )
    }

    pub fn with_source(min_voltage: f64, max_voltage: f64, aux: Box<dyn AuxCurrentSource>) -> Self {
        Self {
            min_voltage,
            max_voltage,
            states: HashMap::new(),
            history: HashMap::new(),
            aux,
        }
    }

    /// Feed an upstream update to the auxiliary current source
    pub fn observe(&mut self, path: &str, value: &serde_json::Value) -> bool {
        self.aux.observe(path, value)
    }

    fn in_guard_band(&self, voltage: f64) -> bool {
        voltage.is_finite() && voltage >= self.min_voltage && voltage <= self.max_voltage
    }

    /// Integrate one sample taken at `now_ms` (milliseconds since epoch).
    ///
    /// The first sample of a battery only sets the reference time. Energy
    /// for an interval uses the current sample's power; a non-positive
    /// interval adds nothing and never moves the reference time back.
    pub fn accumulate(
        &mut self,
        base_path: &str,
        voltage: f64,
        current: f64,
        now_ms: i64,
    ) -> HistoryRecord {
        let previous = self.states.get(base_path).copied();
        let dt_hours = previous
            .map(|p| (now_ms - p.last_timestamp_ms) as f64 / MS_PER_HOUR)
            .unwrap_or(0.0);

        let solar = self.aux.solar_current().filter(|v| v.is_finite()).unwrap_or(0.0);
        let alternator = self
            .aux
            .alternator_current()
            .filter(|v| v.is_finite())
            .unwrap_or(0.0);
        let accept_voltage = self.in_guard_band(voltage);

        let record = self.history.entry(base_path.to_string()).or_default();
        record.sanitize();

        if dt_hours > 0.0 && current.is_finite() {
            let energy_kwh = voltage * current * dt_hours / 1000.0;
            if energy_kwh.is_finite() {
                if current < 0.0 {
                    record.discharged_energy_kwh += energy_kwh.abs();
                } else if current > 0.0 {
                    record.charged_energy_kwh += energy_kwh;
                }
            }

            let drawn_ah = (solar + alternator - current) * dt_hours;
            if drawn_ah.is_finite() && drawn_ah > 0.0 {
                record.total_ah_drawn += drawn_ah;
            }
        }

        if accept_voltage {
            record.minimum_voltage = Some(record.minimum_voltage.map_or(voltage, |m| m.min(voltage)));
            record.maximum_voltage = Some(record.maximum_voltage.map_or(voltage, |m| m.max(voltage)));
        }
        record.sanitize();
        let result = record.clone();

        self.states.insert(
            base_path.to_string(),
            AccumulatorState {
                last_voltage: voltage,
                last_current: current,
                last_timestamp_ms: previous
                    .map_or(now_ms, |p| p.last_timestamp_ms.max(now_ms)),
            },
        );
        result
    }

    /// Seed a battery's history, e.g. from persisted state
    pub fn restore(&mut self, base_path: &str, mut record: HistoryRecord) {
        record.sanitize();
        self.history.insert(base_path.to_string(), record);
    }

    pub fn history(&self, base_path: &str) -> Option<&HistoryRecord> {
        self.history.get(base_path)
    }

    pub fn state(&self, base_path: &str) -> Option<&AccumulatorState> {
        self.states.get(base_path)
    }

    /// All history records, ordered by base path
    pub fn snapshot(&self) -> BTreeMap<String, HistoryRecord> {
        self.history
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
