//! Liveness heartbeat file
//!
//! Plain text, three lines, rewritten atomically:
//!
//! ```text
//! 1700000000.123
//! 12 jobs
//! 3 running
//! ```

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};

use crate::utils::{from_unix_secs, to_unix_secs};

/// One heartbeat sample
#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub timestamp: DateTime<Utc>,
    pub queue_len: usize,
    pub running: usize,
}

impl Heartbeat {
    pub fn render(&self) -> String {
        format!(
            "{:.3}\n{} jobs\n{} running\n",
            to_unix_secs(self.timestamp),
            self.queue_len,
            self.running
        )
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut lines = content.lines().map(str::trim);

        let timestamp = lines
            .next()
            .and_then(|l| l.parse::<f64>().ok())
            .and_then(from_unix_secs)
            .context("Heartbeat missing timestamp")?;
        let queue_len = parse_count(lines.next(), "jobs")?;
        let running = parse_count(lines.next(), "running")?;

        Ok(Self {
            timestamp,
            queue_len,
            running,
        })
    }

    /// Seconds since the heartbeat was written
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_seconds()
    }
}

fn parse_count(line: Option<&str>, unit: &str) -> Result<usize> {
    let Some(line) = line else {
        bail!("Heartbeat missing '{unit}' line");
    };
    let Some(count) = line.strip_suffix(unit) else {
        bail!("Malformed heartbeat line: {line}");
    };
    count
        .trim()
        .parse()
        .with_context(|| format!("Malformed heartbeat count: {line}"))
}

/// Writes the heartbeat file for an external liveness monitor
#[derive(Debug, Clone)]
pub struct HeartbeatWriter {
    path: PathBuf,
}

impl HeartbeatWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, queue_len: usize, running: usize) -> Result<()> {
        self.write_heartbeat(&Heartbeat {
            timestamp: Utc::now(),
            queue_len,
            running,
        })
    }

    pub fn write_heartbeat(&self, heartbeat: &Heartbeat) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create heartbeat directory: {}", parent.display()))?;
        }

        let mut temp = self.path.as_os_str().to_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        fs::write(&temp, heartbeat.render())
            .with_context(|| format!("Failed to write heartbeat: {}", temp.display()))?;
        fs::rename(&temp, &self.path)
            .with_context(|| format!("Failed to rename heartbeat: {}", self.path.display()))?;
        Ok(())
    }

    pub fn read(&self) -> Result<Heartbeat> {
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read heartbeat: {}", self.path.display()))?;
        Heartbeat::parse(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_render_format() {
        let hb = Heartbeat {
            timestamp: DateTime::from_timestamp(1_700_000_000, 500_000_000).unwrap(),
            queue_len: 12,
            running: 3,
        };
        assert_eq!(hb.render(), "1700000000.500\n12 jobs\n3 running\n");
    }

    #[test]
    fn test_write_and_read() {
        let dir = TempDir::new().unwrap();
        let writer = HeartbeatWriter::new(dir.path().join("hb").join("heartbeat.txt"));
        writer.write(4, 1).unwrap();

        let hb = writer.read().unwrap();
        assert_eq!(hb.queue_len, 4);
        assert_eq!(hb.running, 1);
        assert!(hb.age_secs(Utc::now()) < 5);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Heartbeat::parse("").is_err());
        assert!(Heartbeat::parse("123.0\nmany jobs\n0 running").is_err());
        assert!(Heartbeat::parse("123.0\n1 jobs").is_err());
    }
}
