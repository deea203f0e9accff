use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use heal_core::report::unix_millis;
use tracing::debug;

/// Appends every relayed frame to a file, timestamped and tagged with its
/// direction. Write faults are logged and swallowed; dumping must never
/// affect relaying.
pub struct MessageDumper {
	file: Mutex<File>,
}

impl MessageDumper {
	pub fn create(path: &Path) -> Result<Self> {
		let file = OpenOptions::new()
			.create(true)
			.append(true)
			.open(path)
			.with_context(|| format!("Failed to open dump file {}", path.display()))?;
		Ok(Self {
			file: Mutex::new(file),
		})
	}

	pub fn dump(&self, direction: &str, payload: &str) {
		let Ok(mut file) = self.file.lock() else {
			return;
		};
		if let Err(err) = writeln!(file, "{} | {direction} | {payload}", unix_millis()) {
			debug!(target = "heal", error = %err, "failed writing to dump file");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn dump_lines_carry_direction_and_payload() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("frames.log");
		let dumper = MessageDumper::create(&path).unwrap();

		dumper.dump("FROM_CLIENT", r#"{"id":1,"method":"Page.enable"}"#);
		dumper.dump("FROM_BROWSER", r#"{"id":1,"result":{}}"#);

		let contents = std::fs::read_to_string(&path).unwrap();
		let lines: Vec<&str> = contents.lines().collect();
		assert_eq!(lines.len(), 2);
		assert!(lines[0].contains("FROM_CLIENT"));
		assert!(lines[0].ends_with(r#"{"id":1,"method":"Page.enable"}"#));
		assert!(lines[1].contains("FROM_BROWSER"));
	}
}
