//! Per-iteration measurements and their CSV / Markdown renderings.

use crate::types::{Mode, OsFamily};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeasurementError {
    #[error("{field} must be a positive integer, got {value}")]
    NonPositive { field: &'static str, value: i64 },
    #[error("failed to write measurements: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MeasurementError>;

/// Column names in output order.
pub const COLUMNS: [&str; 9] = [
    "App",
    "Mode",
    "buildTimeMs",
    "timeToFirstOKRequestMs",
    "timeToReloadMs",
    "startedInMs",
    "stoppedInMs",
    "RSSKb",
    "FDs",
];

/// Frozen measurement record.
///
/// Rendered views contain only the fields that were set, in [`COLUMNS`]
/// order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Measurement {
    pub app: Option<String>,
    pub mode: Option<Mode>,
    pub build_time_ms: Option<i64>,
    pub time_to_first_ok_request_ms: Option<i64>,
    pub time_to_reload_ms: Option<i64>,
    pub started_in_ms: Option<i64>,
    pub stopped_in_ms: Option<i64>,
    pub rss_kb: Option<i64>,
    pub open_fds: Option<i64>,
}

impl Measurement {
    /// (column, value) for every set field.
    fn cells(&self) -> Vec<(&'static str, String)> {
        let numbers = [
            self.build_time_ms,
            self.time_to_first_ok_request_ms,
            self.time_to_reload_ms,
            self.started_in_ms,
            self.stopped_in_ms,
            self.rss_kb,
            self.open_fds,
        ];

        let mut cells = Vec::new();
        if let Some(app) = &self.app {
            cells.push((COLUMNS[0], app.clone()));
        }
        if let Some(mode) = self.mode {
            cells.push((COLUMNS[1], mode.to_string()));
        }
        for (column, value) in COLUMNS[2..].iter().zip(numbers) {
            if let Some(v) = value {
                cells.push((*column, v.to_string()));
            }
        }
        cells
    }

    pub fn header_csv(&self) -> String {
        self.cells()
            .iter()
            .map(|(c, _)| *c)
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn line_csv(&self) -> String {
        self.cells()
            .into_iter()
            .map(|(_, v)| v)
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn header_markdown(&self) -> String {
        let cols: Vec<&str> = self.cells().iter().map(|(c, _)| *c).collect();
        format!("|{}|", cols.join("|"))
    }

    pub fn divider_markdown(&self) -> String {
        format!("|{}|", vec!["---"; self.cells().len()].join("|"))
    }

    pub fn line_markdown(&self) -> String {
        let values: Vec<String> = self.cells().into_iter().map(|(_, v)| v).collect();
        format!("|{}|", values.join("|"))
    }
}

/// Accumulates one measurement, rejecting non-positive values on entry.
#[derive(Debug, Clone)]
pub struct MeasurementBuilder {
    os: OsFamily,
    record: Measurement,
}

fn positive(field: &'static str, value: i64) -> Result<i64> {
    if value <= 0 {
        return Err(MeasurementError::NonPositive { field, value });
    }
    Ok(value)
}

impl MeasurementBuilder {
    pub fn new(os: OsFamily) -> Self {
        Self {
            os,
            record: Measurement::default(),
        }
    }

    pub fn app(mut self, app: impl Into<String>) -> Self {
        self.record.app = Some(app.into());
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.record.mode = Some(mode);
        self
    }

    pub fn build_time_ms(mut self, value: i64) -> Result<Self> {
        self.record.build_time_ms = Some(positive("buildTimeMs", value)?);
        Ok(self)
    }

    pub fn time_to_first_ok_request_ms(mut self, value: i64) -> Result<Self> {
        self.record.time_to_first_ok_request_ms =
            Some(positive("timeToFirstOKRequestMs", value)?);
        Ok(self)
    }

    pub fn time_to_reload_ms(mut self, value: i64) -> Result<Self> {
        self.record.time_to_reload_ms = Some(positive("timeToReloadMs", value)?);
        Ok(self)
    }

    pub fn started_in_ms(mut self, value: i64) -> Result<Self> {
        self.record.started_in_ms = Some(positive("startedInMs", value)?);
        Ok(self)
    }

    /// Windows does not always report a shutdown duration; there a
    /// non-positive value leaves the field unset.
    pub fn stopped_in_ms(mut self, value: i64) -> Result<Self> {
        if value <= 0 && self.os.is_windows() {
            return Ok(self);
        }
        self.record.stopped_in_ms = Some(positive("stoppedInMs", value)?);
        Ok(self)
    }

    pub fn rss_kb(mut self, value: i64) -> Result<Self> {
        self.record.rss_kb = Some(positive("RSSKb", value)?);
        Ok(self)
    }

    pub fn open_fds(mut self, value: i64) -> Result<Self> {
        self.record.open_fds = Some(positive("FDs", value)?);
        Ok(self)
    }

    pub fn build(self) -> Measurement {
        self.record
    }
}

/// Append `measurement` to the CSV at `path`, writing the header only when
/// the file does not exist yet.
pub fn log_measurements(measurement: &Measurement, path: &Path) -> Result<()> {
    let write_header = !path.exists();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if write_header {
        writeln!(file, "{}", measurement.header_csv())?;
    }
    writeln!(file, "{}", measurement.line_csv())?;
    Ok(())
}

/// Mean after dropping one minimum and one maximum. Plain mean below three
/// samples, `None` when empty.
pub fn trimmed_mean(values: &[i64]) -> Option<i64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let kept = if sorted.len() >= 3 {
        &sorted[1..sorted.len() - 1]
    } else {
        &sorted[..]
    };
    let sum: i64 = kept.iter().sum();
    Some(sum / kept.len() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn renders_only_set_fields() {
        let m = MeasurementBuilder::new(OsFamily::Linux)
            .build_time_ms(5000)
            .unwrap()
            .time_to_first_ok_request_ms(300)
            .unwrap()
            .rss_kb(45000)
            .unwrap()
            .build();

        assert_eq!(m.header_csv(), "buildTimeMs,timeToFirstOKRequestMs,RSSKb");
        assert_eq!(m.line_csv(), "5000,300,45000");
        assert_eq!(
            m.header_markdown(),
            "|buildTimeMs|timeToFirstOKRequestMs|RSSKb|"
        );
        assert_eq!(m.divider_markdown(), "|---|---|---|");
        assert_eq!(m.line_markdown(), "|5000|300|45000|");
    }

    #[test]
    fn tags_come_first() {
        let m = MeasurementBuilder::new(OsFamily::Linux)
            .open_fds(120)
            .unwrap()
            .app("hello")
            .mode(Mode::Jvm)
            .build();
        assert_eq!(m.header_csv(), "App,Mode,FDs");
        assert_eq!(m.line_csv(), "hello,jvm,120");
    }

    #[test]
    fn non_positive_values_are_rejected() {
        type Setter = fn(MeasurementBuilder, i64) -> Result<MeasurementBuilder>;
        let setters: [(&str, Setter); 7] = [
            ("buildTimeMs", MeasurementBuilder::build_time_ms),
            ("timeToFirstOKRequestMs", MeasurementBuilder::time_to_first_ok_request_ms),
            ("timeToReloadMs", MeasurementBuilder::time_to_reload_ms),
            ("startedInMs", MeasurementBuilder::started_in_ms),
            ("stoppedInMs", MeasurementBuilder::stopped_in_ms),
            ("RSSKb", MeasurementBuilder::rss_kb),
            ("FDs", MeasurementBuilder::open_fds),
        ];

        for (name, setter) in setters {
            for value in [0, -1, i64::MIN] {
                match setter(MeasurementBuilder::new(OsFamily::Linux), value) {
                    Err(MeasurementError::NonPositive { field, value: v }) => {
                        assert_eq!(field, name);
                        assert_eq!(v, value);
                    }
                    other => panic!("{name}={value} should be rejected, got {other:?}"),
                }
            }
        }
    }

    #[test]
    fn windows_tolerates_missing_stop_time() {
        let m = MeasurementBuilder::new(OsFamily::Windows)
            .stopped_in_ms(-1)
            .unwrap()
            .started_in_ms(900)
            .unwrap()
            .build();
        assert_eq!(m.stopped_in_ms, None);
        assert_eq!(m.header_csv(), "startedInMs");

        assert!(MeasurementBuilder::new(OsFamily::Windows)
            .started_in_ms(0)
            .is_err());
    }

    #[test]
    fn log_measurements_writes_header_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("measurements.csv");

        for rss in [45000, 46000] {
            let m = MeasurementBuilder::new(OsFamily::Linux)
                .app("hello")
                .rss_kb(rss)
                .unwrap()
                .build();
            log_measurements(&m, &path).unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "App,RSSKb\nhello,45000\nhello,46000\n");
    }

    #[test]
    fn trimmed_mean_drops_extremes() {
        assert_eq!(trimmed_mean(&[]), None);
        assert_eq!(trimmed_mean(&[10]), Some(10));
        assert_eq!(trimmed_mean(&[10, 20]), Some(15));
        assert_eq!(trimmed_mean(&[1, 100, 10, 20, 1000]), Some(43));
        assert_eq!(trimmed_mean(&[5, 5, 5]), Some(5));
    }
}
