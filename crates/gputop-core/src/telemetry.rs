use std::collections::HashMap;

use serde::Serialize;

use crate::error::{RecordError, Result};
use crate::layout::{EngineMetric, Scalar, Slot, COLUMNS, FIELD_COUNT};

/// Utilization of one engine class within a single sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EngineLoad {
    pub busy_percent: f64,
    pub semaphore_percent: f64,
    pub wait_percent: f64,
}

impl EngineLoad {
    pub fn get(&self, metric: EngineMetric) -> f64 {
        match metric {
            EngineMetric::Busy => self.busy_percent,
            EngineMetric::Sema => self.semaphore_percent,
            EngineMetric::Wait => self.wait_percent,
        }
    }

    fn set(&mut self, metric: EngineMetric, value: f64) {
        match metric {
            EngineMetric::Busy => self.busy_percent = value,
            EngineMetric::Sema => self.semaphore_percent = value,
            EngineMetric::Wait => self.wait_percent = value,
        }
    }
}

/// One fully parsed row of `intel_gpu_top` output.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub freq_requested_mhz: f64,
    pub freq_actual_mhz: f64,
    pub irq_per_second: f64,
    pub rc6_percent: f64,
    pub engines: HashMap<String, EngineLoad>,
}

impl TelemetrySnapshot {
    pub fn engine(&self, name: &str) -> Option<&EngineLoad> {
        self.engines.get(name)
    }

    fn set(&mut self, slot: Slot, value: f64) {
        match slot {
            Slot::Scalar(Scalar::FreqRequested) => self.freq_requested_mhz = value,
            Slot::Scalar(Scalar::FreqActual) => self.freq_actual_mhz = value,
            Slot::Scalar(Scalar::IrqPerSecond) => self.irq_per_second = value,
            Slot::Scalar(Scalar::Rc6) => self.rc6_percent = value,
            Slot::Engine(name, metric) => self
                .engines
                .entry(name.to_string())
                .or_default()
                .set(metric, value),
        }
    }
}

/// Parse one row of exactly [`FIELD_COUNT`] fields.
///
/// Returns [`RecordError::Shape`] for a wrong field count and
/// [`RecordError::FieldFormat`] for the first field that is not a number.
/// The snapshot is built locally and only returned once every field parsed.
pub fn parse_record<S: AsRef<str>>(fields: &[S]) -> Result<TelemetrySnapshot> {
    if fields.len() != FIELD_COUNT {
        return Err(RecordError::Shape {
            found: fields.len(),
            expected: FIELD_COUNT,
        });
    }

    let mut snapshot = TelemetrySnapshot {
        engines: HashMap::with_capacity(crate::layout::ENGINES.len()),
        ..Default::default()
    };

    for (index, (field, column)) in fields.iter().zip(COLUMNS.iter()).enumerate() {
        let raw = field.as_ref();
        let value = raw
            .trim()
            .parse::<f64>()
            .map_err(|source| RecordError::FieldFormat {
                index,
                raw: raw.to_string(),
                source,
            })?;
        snapshot.set(column.slot, value);
    }

    Ok(snapshot)
}
