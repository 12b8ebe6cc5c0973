use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Transfer event sink. Every hook defaults to doing nothing.
pub trait Logger: Send + Sync {
    fn start(&self, _source: &str, _dest: &Path) {}
    fn entry_done(&self, _path: &Path, _bytes: u64) {}
    fn entry_skipped(&self, _path: &Path, _bytes: u64) {}
    fn resume(&self, _path: &Path, _offset: u64) {}
    fn error(&self, _context: &str, _path: &Path, _msg: &str) {}
    fn done(&self, _files: u64, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

/// Appends one RFC3339-stamped line per event to a file.
pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn start(&self, source: &str, dest: &Path) {
        self.line(&format!("START src={} dst={}", source, dest.display()));
    }
    fn entry_done(&self, path: &Path, bytes: u64) {
        self.line(&format!("RECV path={} bytes={}", path.display(), bytes));
    }
    fn entry_skipped(&self, path: &Path, bytes: u64) {
        self.line(&format!("SKIP path={} bytes={}", path.display(), bytes));
    }
    fn resume(&self, path: &Path, offset: u64) {
        self.line(&format!("RESUME path={} offset={}", path.display(), offset));
    }
    fn error(&self, context: &str, path: &Path, msg: &str) {
        self.line(&format!("ERROR ctx={} path={} msg={}", context, path.display(), msg));
    }
    fn done(&self, files: u64, bytes: u64, seconds: f64) {
        self.line(&format!("DONE files={files} bytes={bytes} seconds={seconds:.3}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_logger_writes_stamped_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/skiff.log");
        let logger = TextLogger::new(&path).unwrap();
        logger.start("host:/srv/data", Path::new("data"));
        logger.resume(Path::new("data/big.iso"), 4096);
        logger.done(3, 10240, 0.5);
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with('[') && lines[0].contains("START src=host:/srv/data"));
        assert!(lines[1].ends_with("RESUME path=data/big.iso offset=4096"));
        assert!(lines[2].ends_with("DONE files=3 bytes=10240 seconds=0.500"));
    }
}
