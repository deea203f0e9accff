//! Broken-locator reports and the healing sink.
//!
//! The tracker's contract towards the external healing consumer is "one
//! record per broken classification, exactly once". The transport behind the
//! sink is not its concern; the shipped [`JsonlSink`] appends one JSON object
//! per line so a consumer can tail the file.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::Result;
use crate::extract::Engine;

/// One broken-locator classification. Immutable once emitted.
///
/// Field names mirror the wire format the healing consumer reads.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokenLocatorReport {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub selector: String,
    #[serde(rename = "type")]
    pub engine: Engine,
    pub attempts: u32,
    #[serde(rename = "duration")]
    pub duration_ms: u64,
    pub reason: String,
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
}

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Append-only destination for broken-locator reports.
pub trait ReportSink: Send + Sync {
    fn append(&self, report: &BrokenLocatorReport) -> Result<()>;
}

/// Sink writing one JSON object per line.
///
/// Created eagerly at startup so consumers can start tailing the file before
/// the first report lands.
pub struct JsonlSink {
    file: Mutex<File>,
}

impl JsonlSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl ReportSink for JsonlSink {
    fn append(&self, report: &BrokenLocatorReport) -> Result<()> {
        let line = serde_json::to_string(report)?;
        let mut file = self.file.lock();
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> BrokenLocatorReport {
        BrokenLocatorReport {
            session_id: "s000001".to_string(),
            selector: "#missing".to_string(),
            engine: Engine::Css,
            attempts: 3,
            duration_ms: 1500,
            reason: "unverified after 3 attempts over 1500ms".to_string(),
            timestamp_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn jsonl_sink_appends_parseable_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken-locators.jsonl");
        let sink = JsonlSink::create(&path).unwrap();

        sink.append(&sample_report()).unwrap();
        sink.append(&sample_report()).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let record: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(record["sessionId"], "s000001");
        assert_eq!(record["selector"], "#missing");
        assert_eq!(record["type"], "CSS");
        assert_eq!(record["attempts"], 3);
        assert_eq!(record["duration"], 1500);
        assert_eq!(record["reason"], "unverified after 3 attempts over 1500ms");
    }
}
