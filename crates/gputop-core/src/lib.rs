pub mod config;
pub mod error;
pub mod layout;
pub mod telemetry;

pub use config::{ExporterConfig, ListenConfig, ProducerConfig};
pub use error::{ConfigError, RecordError, Result};
pub use layout::{is_header, Column, EngineMetric, Scalar, Slot, COLUMNS, ENGINES, FIELD_COUNT};
pub use telemetry::{parse_record, EngineLoad, TelemetrySnapshot};
