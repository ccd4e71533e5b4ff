use std::io;

use csv::{ReaderBuilder, StringRecord, Trim};
use gputop_core::{is_header, parse_record, RecordError, TelemetrySnapshot};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

/// Pull-based reader turning a CSV telemetry feed into snapshots.
///
/// Each call to [`SnapshotReader::next_snapshot`] reads exactly up to the next
/// row terminator. Headers, truncated rows and malformed rows are skipped. A read
/// error ends the sequence; the error can be retrieved with
/// [`SnapshotReader::take_fault`]. Dropping the reader stops consumption.
pub struct SnapshotReader<R> {
    input: R,
    line: Vec<u8>,
    row: u64,
    finished: bool,
    fault: Option<io::Error>,
}

impl<R> SnapshotReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(input: R) -> Self {
        Self {
            input,
            line: Vec::new(),
            row: 0,
            finished: false,
            fault: None,
        }
    }

    /// Next valid snapshot, or `None` at end of stream or after a read fault.
    ///
    /// Not cancel-safe: dropping the future mid-row loses the partial row.
    pub async fn next_snapshot(&mut self) -> Option<TelemetrySnapshot> {
        while !self.finished {
            self.line.clear();
            match self.read_row().await {
                Ok(()) if self.line.is_empty() => self.finish(),
                Ok(()) => {
                    self.row += 1;
                    if let Some(snapshot) = self.decode_row() {
                        return Some(snapshot);
                    }
                }
                Err(e) => {
                    warn!(row = self.row + 1, error = %e, "Error reading telemetry feed");
                    self.fault = Some(e);
                    self.finish();
                }
            }
        }
        None
    }

    /// Read fault that ended the sequence, if any.
    pub fn take_fault(&mut self) -> Option<io::Error> {
        self.fault.take()
    }

    /// Rows read so far, including skipped ones.
    pub fn rows_read(&self) -> u64 {
        self.row
    }

    /// Append one row to `line`; bytes read before an interrupt are kept.
    async fn read_row(&mut self) -> io::Result<()> {
        loop {
            match self.input.read_until(b'\n', &mut self.line).await {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.line = Vec::new();
    }

    fn decode_row(&self) -> Option<TelemetrySnapshot> {
        let record = match split_row(&self.line) {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                warn!(row = self.row, error = %e, "Undecodable telemetry row, skipping");
                return None;
            }
        };

        let fields: Vec<&str> = record.iter().collect();
        if is_header(&fields) {
            debug!(row = self.row, "Skipping header row");
            return None;
        }

        match parse_record(&fields) {
            Ok(snapshot) => Some(snapshot),
            Err(RecordError::Shape { found, expected }) => {
                debug!(row = self.row, found, expected, "Incomplete record, skipping");
                None
            }
            Err(e @ RecordError::FieldFormat { .. }) => {
                warn!(row = self.row, error = %e, "Malformed telemetry row, skipping");
                None
            }
        }
    }
}

/// Split one line into fields with CSV quoting rules. `None` for blank lines.
fn split_row(line: &[u8]) -> Result<Option<StringRecord>, csv::Error> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(line);

    let mut record = StringRecord::new();
    if reader.read_record(&mut record)? {
        Ok(Some(record))
    } else {
        Ok(None)
    }
}
