//! Per-connection timing records.
//!
//! Every engine emits one record per served connection; a sink decides
//! where it lands. The CSV sink writes the `label,operation,milliseconds`
//! layout the comparison scripts consume, flushing after each record so
//! an interrupted run keeps everything it measured.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

/// Where engines report how long serving a connection took.
pub trait TimingSink: Send + Sync {
    /// Record one timed operation for the named engine.
    fn record(&self, engine: &str, operation: &str, elapsed: Duration);
}

/// Appends `engine,operation,milliseconds` lines to a file.
pub struct CsvSink {
    file: Mutex<File>,
}

impl CsvSink {
    /// Open the sink, truncating previous contents when asked.
    pub fn open(path: &Path, truncate: bool) -> io::Result<Self> {
        let file = if truncate {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?
        } else {
            OpenOptions::new().append(true).create(true).open(path)?
        };

        Ok(CsvSink {
            file: Mutex::new(file),
        })
    }
}

impl TimingSink for CsvSink {
    fn record(&self, engine: &str, operation: &str, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Err(e) = writeln!(file, "{engine},{operation},{ms:.3}") {
            warn!(error = %e, "Failed to write timing record");
            return;
        }
        if let Err(e) = file.flush() {
            warn!(error = %e, "Failed to flush timing record");
        }
    }
}

/// One captured record.
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct TimingRecord {
    pub engine: String,
    pub operation: String,
    #[allow(dead_code)]
    pub elapsed: Duration,
}

/// Collects records in memory. Test sink.
#[cfg(test)]
pub struct MemorySink {
    records: Mutex<Vec<TimingRecord>>,
}

#[cfg(test)]
impl MemorySink {
    pub fn new() -> Self {
        MemorySink {
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn records(&self) -> Vec<TimingRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Spin until `count` records arrive or the deadline passes.
    pub fn wait_for_records(&self, count: usize, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if self.records().len() >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }
}

#[cfg(test)]
impl TimingSink for MemorySink {
    fn record(&self, engine: &str, operation: &str, elapsed: Duration) {
        self.records.lock().unwrap().push(TimingRecord {
            engine: engine.to_string(),
            operation: operation.to_string(),
            elapsed,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_csv(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("tallyd-test-{}-{name}", std::process::id()))
    }

    #[test]
    fn test_csv_record_format() {
        let path = temp_csv("format.csv");
        let sink = CsvSink::open(&path, true).unwrap();
        sink.record("pool", "handle_connection", Duration::from_micros(1500));
        sink.record("multiplex", "handle_data", Duration::from_millis(2));

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "pool,handle_connection,1.500");
        assert_eq!(lines[1], "multiplex,handle_data,2.000");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_append_and_truncate() {
        let path = temp_csv("truncate.csv");
        {
            let sink = CsvSink::open(&path, true).unwrap();
            sink.record("iterative", "handle_connection", Duration::from_millis(1));
        }
        {
            let sink = CsvSink::open(&path, false).unwrap();
            sink.record("iterative", "handle_connection", Duration::from_millis(1));
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);

        let sink = CsvSink::open(&path, true).unwrap();
        sink.record("iterative", "handle_connection", Duration::from_millis(1));
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_memory_sink_captures_fields() {
        let sink = MemorySink::new();
        sink.record("pool", "handle_connection", Duration::from_millis(3));

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].engine, "pool");
        assert_eq!(records[0].operation, "handle_connection");
    }
}
