//! Column layout of the `intel_gpu_top -c` feed.
//!
//! Every column maps either to a device-level scalar or to one metric of one
//! engine class. The parser routes fields purely through [`COLUMNS`].


/// Device-level readings carried by the first four columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar {
    FreqRequested,
    FreqActual,
    IrqPerSecond,
    Rc6,
}

/// Per-engine metric kind, also used as the `type` label on exported gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineMetric {
    Busy,
    Sema,
    Wait,
}

impl EngineMetric {
    pub const ALL: [EngineMetric; 3] = [EngineMetric::Busy, EngineMetric::Sema, EngineMetric::Wait];

    pub fn label(&self) -> &'static str {
        match self {
            EngineMetric::Busy => "busy",
            EngineMetric::Sema => "sema",
            EngineMetric::Wait => "wait",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Scalar(Scalar),
    Engine(&'static str, EngineMetric),
}

/// One column of the feed: where its value goes and its header label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub slot: Slot,
    pub header: &'static str,
}

const fn scalar(scalar: Scalar, header: &'static str) -> Column {
    Column {
        slot: Slot::Scalar(scalar),
        header,
    }
}

const fn engine(name: &'static str, metric: EngineMetric, header: &'static str) -> Column {
    Column {
        slot: Slot::Engine(name, metric),
        header,
    }
}

/// Engine classes reported by the producer, in column order.
pub const ENGINES: [&str; 4] = ["RCS", "BCS", "VCS", "VECS"];

pub const FIELD_COUNT: usize = 16;

pub const COLUMNS: [Column; FIELD_COUNT] = [
    scalar(Scalar::FreqRequested, "Freq MHz req"),
    scalar(Scalar::FreqActual, "Freq MHz act"),
    scalar(Scalar::IrqPerSecond, "IRQ /s"),
    scalar(Scalar::Rc6, "RC6 %"),
    engine("RCS", EngineMetric::Busy, "RCS %"),
    engine("RCS", EngineMetric::Sema, "RCS se"),
    engine("RCS", EngineMetric::Wait, "RCS wa"),
    engine("BCS", EngineMetric::Busy, "BCS %"),
    engine("BCS", EngineMetric::Sema, "BCS se"),
    engine("BCS", EngineMetric::Wait, "BCS wa"),
    engine("VCS", EngineMetric::Busy, "VCS %"),
    engine("VCS", EngineMetric::Sema, "VCS se"),
    engine("VCS", EngineMetric::Wait, "VCS wa"),
    engine("VECS", EngineMetric::Busy, "VECS %"),
    engine("VECS", EngineMetric::Sema, "VECS se"),
    engine("VECS", EngineMetric::Wait, "VECS wa"),
];

/// Returns true if `fields` is the header row, wherever it shows up in the feed.
pub fn is_header<S: AsRef<str>>(fields: &[S]) -> bool {
    fields.len() == COLUMNS.len()
        && fields
            .iter()
            .zip(COLUMNS.iter())
            .all(|(field, column)| field.as_ref().trim() == column.header)
}
