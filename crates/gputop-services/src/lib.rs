pub mod reader;
pub mod sink;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use reader::SnapshotReader;
pub use sink::{MetricsSink, PrometheusSink, SinkError};
pub use supervisor::{Pipeline, PipelineStatus, Supervisor, SupervisorError, SupervisorState};
