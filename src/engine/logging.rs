use crate::config::LOG_FILE;
use crate::error::Result;
use crate::utils::time_now;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only text log of a run, mirrored to `tracing`.
#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(RunLog {
            path: dir.join(LOG_FILE),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn message(&self, text: &str) -> Result<()> {
        tracing::info!("{}", text);
        self.append(text)
    }

    pub fn epoch(&self, epoch: usize, time: &str, results: &str) -> Result<()> {
        tracing::info!(epoch, time, results, "epoch finished");
        self.append(&format!("Time: {}; Epoch: {}; {}", time, epoch, results))
    }

    fn append(&self, line: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{} {}", time_now(), line)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        RunLog::new(dir.path()).unwrap().message("first").unwrap();
        let log = RunLog::new(dir.path()).unwrap();
        log.epoch(3, "2024-01-01 00:00:00", "loss: 1.0").unwrap();
        let text = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("first"));
        assert!(lines[1].contains("Epoch: 3; loss: 1.0"));
    }
}
