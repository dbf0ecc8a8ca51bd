//! Metric sinks.
//!
//! The meta-optimizer emits scalar metrics, curve rows, tables, histograms and
//! figure descriptions. Rendering is up to the backend behind [`MetricLogger`].

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::json;

use super::error::Result;

/// Column-oriented table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl Table {
    pub fn new(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Vec<f64>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
    }

    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().map(|row| row[idx]).collect())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesKind {
    Line,
    Scatter,
}

/// One series of a panel; `group` selects the colour along a sequential palette.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    pub label: String,
    pub kind: SeriesKind,
    pub group: Option<usize>,
    pub points: Vec<(f64, f64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Panel {
    pub title: String,
    pub series: Vec<Series>,
}

/// Figure description: a row of panels.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Figure {
    pub panels: Vec<Panel>,
}

/// Backend receiving metrics.
pub trait MetricLogger {
    /// A scalar metric aggregated over batches weighted by `batch_size`.
    fn log_metric(&mut self, key: &str, value: f64, batch_size: usize);
    /// A row of related values logged together (e.g. one point of a curve).
    fn log_row(&mut self, row: &[(String, f64)]);
    fn log_table(&mut self, key: &str, table: &Table);
    fn log_histogram(&mut self, key: &str, values: &[f64]);
    fn log_figure(&mut self, key: &str, figure: &Figure);
}

/// Everything a [`RecordingLogger`] received.
#[derive(Debug, Clone, Default)]
pub struct Records {
    pub metrics: Vec<(String, f64, usize)>,
    pub rows: Vec<Vec<(String, f64)>>,
    pub tables: Vec<(String, Table)>,
    pub histograms: Vec<(String, Vec<f64>)>,
    pub figures: Vec<(String, Figure)>,
}

impl Records {
    pub fn metric_values(&self, key: &str) -> Vec<f64> {
        self.metrics
            .iter()
            .filter(|(k, _, _)| k == key)
            .map(|(_, v, _)| *v)
            .collect()
    }

    /// `(n_samples, value)` pairs of every row carrying `key`.
    pub fn curve(&self, key: &str) -> Vec<(usize, f64)> {
        self.rows
            .iter()
            .filter_map(|row| {
                let n = row.iter().find(|(k, _)| k == "n_samples")?.1;
                let v = row.iter().find(|(k, _)| k == key)?.1;
                Some((n as usize, v))
            })
            .collect()
    }

    pub fn table(&self, key: &str) -> Option<&Table> {
        self.tables.iter().find(|(k, _)| k == key).map(|(_, t)| t)
    }

    pub fn figure(&self, key: &str) -> Option<&Figure> {
        self.figures.iter().find(|(k, _)| k == key).map(|(_, f)| f)
    }
}

/// In-memory logger. Clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct RecordingLogger {
    records: Arc<Mutex<Records>>,
}

impl RecordingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MetricLogger for RecordingLogger {
    fn log_metric(&mut self, key: &str, value: f64, batch_size: usize) {
        self.records().metrics.push((key.to_string(), value, batch_size));
    }

    fn log_row(&mut self, row: &[(String, f64)]) {
        self.records().rows.push(row.to_vec());
    }

    fn log_table(&mut self, key: &str, table: &Table) {
        self.records().tables.push((key.to_string(), table.clone()));
    }

    fn log_histogram(&mut self, key: &str, values: &[f64]) {
        self.records().histograms.push((key.to_string(), values.to_vec()));
    }

    fn log_figure(&mut self, key: &str, figure: &Figure) {
        self.records().figures.push((key.to_string(), figure.clone()));
    }
}

/// Writes one JSON object per event.
pub struct JsonLinesLogger<W: Write> {
    writer: W,
}

impl JsonLinesLogger<BufWriter<File>> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> JsonLinesLogger<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn emit(&mut self, event: serde_json::Value) {
        let written = serde_json::to_writer(&mut self.writer, &event)
            .map_err(std::io::Error::from)
            .and_then(|_| self.writer.write_all(b"\n"))
            .and_then(|_| self.writer.flush());
        if let Err(e) = written {
            tracing::warn!("dropping metric event: {}", e);
        }
    }
}

impl<W: Write> MetricLogger for JsonLinesLogger<W> {
    fn log_metric(&mut self, key: &str, value: f64, batch_size: usize) {
        self.emit(json!({ "type": "metric", "key": key, "value": value, "batch_size": batch_size }));
    }

    fn log_row(&mut self, row: &[(String, f64)]) {
        let values: serde_json::Map<String, serde_json::Value> =
            row.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
        self.emit(json!({ "type": "row", "values": values }));
    }

    fn log_table(&mut self, key: &str, table: &Table) {
        self.emit(json!({ "type": "table", "key": key, "table": table }));
    }

    fn log_histogram(&mut self, key: &str, values: &[f64]) {
        self.emit(json!({ "type": "histogram", "key": key, "values": values }));
    }

    fn log_figure(&mut self, key: &str, figure: &Figure) {
        self.emit(json!({ "type": "figure", "key": key, "figure": figure }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_logger_clones_share_records() {
        let logger = RecordingLogger::new();
        let mut sink: Box<dyn MetricLogger> = Box::new(logger.clone());
        sink.log_metric("train_tasks/loss_train", 0.5, 8);
        sink.log_row(&[
            ("n_samples".to_string(), 3.0),
            ("val_tasks/n_sample_loss_train".to_string(), 0.25),
        ]);

        let records = logger.records();
        assert_eq!(records.metric_values("train_tasks/loss_train"), vec![0.5]);
        assert_eq!(records.curve("val_tasks/n_sample_loss_train"), vec![(3, 0.25)]);
    }

    #[test]
    fn test_table_columns() {
        let mut table = Table::new(&["task_id", "x", "y"]);
        table.push(vec![0.0, 1.0, 2.0]);
        table.push(vec![1.0, 3.0, 4.0]);
        assert_eq!(table.column("y"), Some(vec![2.0, 4.0]));
        assert_eq!(table.column("z"), None);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_json_lines_logger_writes_one_line_per_event() {
        let mut logger = JsonLinesLogger::new(Vec::new());
        logger.log_metric("val_tasks/loss_nexttoken", 1.5, 4);
        logger.log_histogram("val_tasks/z_variance_explained", &[0.9, 0.1]);
        let out = String::from_utf8(logger.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["key"], "val_tasks/loss_nexttoken");
        assert_eq!(first["batch_size"], 4);
    }
}
