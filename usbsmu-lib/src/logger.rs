//! Turns the sample stream into CSV rows for the data logger.
//!
//! The device logs each source separately, so samples taken together (within
//! [`AGGREGATE_MILLIS`]) are merged into one row of `s, V, A, Ah, J`.

use crate::constants::{AGGREGATE_MILLIS, LOGGER_COLUMNS, NEW_ROW_COLUMNS};
use crate::samples::SampleRecord;
use rust_decimal::Decimal;
use tracing::{info, warn};

/// Cell text for a sample without a valid reading.
const NAN_CELL: &str = "NaN";
/// Source whose `NaN` marks the output being off.
const CURRENT_SOURCE: &str = "A";

#[derive(Debug, Clone)]
struct PendingRow {
    millis: u64,
    cells: Vec<Option<String>>,
}

impl PendingRow {
    fn new(millis: u64) -> Self {
        Self {
            millis,
            cells: vec![None; LOGGER_COLUMNS.len()],
        }
    }
}

/// Stateful row builder fed one sample at a time.
#[derive(Debug, Clone, Default)]
pub struct RowAggregator {
    auto_stop: bool,
    recording: bool,
    stopped: bool,
    start_millis: Option<u64>,
    pending: Option<PendingRow>,
}

impl RowAggregator {
    /// `delay_on` drops samples until the first valid current reading.
    /// `auto_stop` stops at the first invalid current reading after that.
    pub fn new(delay_on: bool, auto_stop: bool) -> Self {
        Self {
            auto_stop,
            recording: !delay_on,
            ..Self::default()
        }
    }

    pub fn header() -> Vec<String> {
        LOGGER_COLUMNS.iter().map(|c| c.to_string()).collect()
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// True once `auto_stop` has triggered; later samples are ignored.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Add a sample, returning a completed row if this sample closed one.
    pub fn push(&mut self, sample: &SampleRecord) -> Option<Vec<String>> {
        if self.stopped {
            return None;
        }
        let is_current = sample.source == CURRENT_SOURCE;
        if !self.recording {
            if is_current && sample.value.is_some() {
                info!(millis = sample.millis, "Start recording");
                self.recording = true;
            } else {
                return None;
            }
        }
        if self.auto_stop && is_current && sample.value.is_none() {
            info!(millis = sample.millis, "Output off, stopping");
            self.stopped = true;
            return self.finish();
        }

        // The first column is the timestamp, not a source
        let Some(column) = LOGGER_COLUMNS
            .iter()
            .skip(1)
            .position(|c| *c == sample.source)
            .map(|i| i + 1)
        else {
            warn!(source = %sample.source, "Skipping sample from unknown source");
            return None;
        };

        let start = *self.start_millis.get_or_insert(sample.millis);
        let mut completed = None;
        if let Some(row) = &self.pending {
            let expired = row.millis.saturating_add(AGGREGATE_MILLIS) < sample.millis;
            let overwrite = row.cells[column].is_some() && NEW_ROW_COLUMNS.contains(&sample.source.as_str());
            if expired || overwrite {
                completed = self.pending.take().map(|row| Self::render(start, row));
            }
        }

        let row = self.pending.get_or_insert_with(|| PendingRow::new(sample.millis));
        row.cells[column] = Some(match sample.value {
            Some(value) => value.to_string(),
            None => NAN_CELL.to_string(),
        });
        completed
    }

    /// Feed a batch of samples, returning the rows they completed in order.
    pub fn push_all(&mut self, samples: &[SampleRecord]) -> Vec<Vec<String>> {
        samples.iter().filter_map(|s| self.push(s)).collect()
    }

    /// Emit the row still being built, if any.
    pub fn finish(&mut self) -> Option<Vec<String>> {
        let start = self.start_millis?;
        self.pending.take().map(|row| Self::render(start, row))
    }

    fn render(start: u64, row: PendingRow) -> Vec<String> {
        let seconds = Decimal::from(row.millis.saturating_sub(start)) / Decimal::ONE_THOUSAND;
        let mut out = Vec::with_capacity(LOGGER_COLUMNS.len());
        out.push(seconds.to_string());
        out.extend(row.cells.into_iter().skip(1).map(Option::unwrap_or_default));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn sample(millis: u64, source: &str, value: &str) -> SampleRecord {
        SampleRecord {
            millis,
            source: source.to_string(),
            value: if value == "nan" {
                None
            } else {
                Some(Decimal::from_str(value).unwrap())
            },
        }
    }

    #[test]
    fn test_samples_merge_into_rows() {
        let mut agg = RowAggregator::new(false, false);
        let rows = agg.push_all(&[
            sample(1000, "V", "5.002"),
            sample(1000, "A", "0.101"),
            sample(1010, "J", "12.5"),
            sample(1200, "V", "5.001"),
            sample(1200, "A", "0.102"),
        ]);
        assert_eq!(rows, vec![vec!["0", "5.002", "0.101", "", "12.5"]]);
        assert_eq!(agg.finish().unwrap(), vec!["0.2", "5.001", "0.102", "", ""]);
        assert!(agg.finish().is_none());
    }

    #[test]
    fn test_overwrite_starts_new_row() {
        let mut agg = RowAggregator::new(false, false);
        let rows = agg.push_all(&[
            sample(0, "V", "1"),
            sample(50, "V", "2"),
            sample(60, "Ah", "0.5"),
            sample(70, "Ah", "0.6"),
        ]);
        assert_eq!(rows, vec![vec!["0", "1", "", "", ""]]);
        // Ah is not a new-row column, so it overwrites in place
        assert_eq!(agg.finish().unwrap(), vec!["0.05", "2", "", "0.6", ""]);
    }

    #[test]
    fn test_delay_on_and_auto_stop() {
        let mut agg = RowAggregator::new(true, true);
        assert!(agg.push(&sample(0, "V", "5")).is_none());
        assert!(agg.push(&sample(0, "A", "nan")).is_none());
        assert!(!agg.is_recording());

        agg.push(&sample(100, "A", "0.5"));
        assert!(agg.is_recording());
        agg.push(&sample(110, "V", "5"));
        let last = agg.push(&sample(300, "A", "nan"));
        assert!(agg.is_stopped());
        assert_eq!(last.unwrap(), vec!["0", "5", "0.5", "", ""]);
        assert!(agg.push(&sample(400, "A", "1")).is_none());
    }

    #[test]
    fn test_nan_cell_without_auto_stop() {
        let mut agg = RowAggregator::new(false, false);
        agg.push(&sample(0, "A", "nan"));
        agg.push(&sample(0, "X", "1"));
        assert_eq!(agg.finish().unwrap(), vec!["0", "", "NaN", "", ""]);
    }

    #[test]
    fn test_timestamps_near_counter_limit() {
        let mut agg = RowAggregator::new(false, false);
        let top = u64::MAX - 10;
        assert!(agg.push(&sample(top, "V", "1")).is_none());
        assert!(agg.push(&sample(u64::MAX, "A", "0.5")).is_none());
        assert_eq!(agg.finish().unwrap(), vec!["0", "1", "0.5", "", ""]);
    }
}
