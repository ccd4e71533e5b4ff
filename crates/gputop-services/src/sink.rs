use gputop_core::{EngineMetric, TelemetrySnapshot};
use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
    #[error("Exposition is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Receives every snapshot the pipeline produces.
///
/// Implementations keep last-known values only and absorb their own errors.
pub trait MetricsSink: Send + Sync {
    fn observe(&self, snapshot: TelemetrySnapshot);
}

/// Gauges for `intel_gpu_top` statistics, held in a private registry.
pub struct PrometheusSink {
    registry: Registry,
    freq_requested: Gauge,
    freq_actual: Gauge,
    irq_per_sec: Gauge,
    rc6_percent: Gauge,
    engine: GaugeVec,
}

impl PrometheusSink {
    pub fn new() -> Result<Self, SinkError> {
        let registry = Registry::new();

        let freq_requested = register_gauge(
            &registry,
            "intel_gpu_freq_mhz_requested",
            "Intel GPU requested frequency in MHz",
        )?;
        let freq_actual = register_gauge(
            &registry,
            "intel_gpu_freq_mhz_actual",
            "Intel GPU actual frequency in MHz",
        )?;
        let irq_per_sec =
            register_gauge(&registry, "intel_gpu_irq_per_sec", "Intel GPU IRQs per second")?;
        let rc6_percent = register_gauge(
            &registry,
            "intel_gpu_rc6_percent",
            "Intel GPU RC6 power state percentage",
        )?;

        let engine = GaugeVec::new(
            Opts::new("intel_gpu_engine_percent", "Intel GPU engine busy percentage"),
            &["engine", "type"],
        )?;
        registry.register(Box::new(engine.clone()))?;

        Ok(Self {
            registry,
            freq_requested,
            freq_actual,
            irq_per_sec,
            rc6_percent,
            engine,
        })
    }

    /// Current values in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, SinkError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }
}

impl MetricsSink for PrometheusSink {
    fn observe(&self, snapshot: TelemetrySnapshot) {
        self.freq_requested.set(snapshot.freq_requested_mhz);
        self.freq_actual.set(snapshot.freq_actual_mhz);
        self.irq_per_sec.set(snapshot.irq_per_second);
        self.rc6_percent.set(snapshot.rc6_percent);

        for (name, load) in &snapshot.engines {
            for metric in EngineMetric::ALL {
                match self
                    .engine
                    .get_metric_with_label_values(&[name.as_str(), metric.label()])
                {
                    Ok(gauge) => gauge.set(load.get(metric)),
                    Err(e) => warn!(engine = %name, error = %e, "Failed to update engine gauge"),
                }
            }
        }
    }
}

fn register_gauge(registry: &Registry, name: &str, help: &str) -> Result<Gauge, SinkError> {
    let gauge = Gauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}
