use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use crate::message::SessionKey;
use crate::protocol::ResultCode;
use crate::sender::SessionState;

/// Observation hooks for both engines. All methods default to no-ops so
/// implementations pick only the events they care about.
pub trait TransferLogger: Send + Sync {
    fn demand_sent(&self, _key: &SessionKey, _segment_len: u32) {}
    fn segment_sent(&self, _key: &SessionKey, _index: u16, _count: u16, _len: u32) {}
    /// A sender session reached a terminal state and was dropped.
    fn session_done(&self, _key: &SessionKey, _state: SessionState, _code: ResultCode) {}
    fn task_admitted(&self, _key: &SessionKey) {}
    fn segment_stored(&self, _key: &SessionKey, _index: u16, _count: u16) {}
    fn task_cancelled(&self, _key: &SessionKey) {}
    fn rejected(&self, _key: &SessionKey, _code: ResultCode) {}
}

pub struct NoopLogger;
impl TransferLogger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
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

impl TransferLogger for TextLogger {
    fn demand_sent(&self, key: &SessionKey, segment_len: u32) {
        self.line(&format!("DEMAND key={} segment_len={}", key, segment_len));
    }
    fn segment_sent(&self, key: &SessionKey, index: u16, count: u16, len: u32) {
        self.line(&format!(
            "SEGMENT key={} index={}/{} bytes={}",
            key, index, count, len
        ));
    }
    fn session_done(&self, key: &SessionKey, state: SessionState, code: ResultCode) {
        self.line(&format!(
            "SESSION-DONE key={} state={:?} code={:?}",
            key, state, code
        ));
    }
    fn task_admitted(&self, key: &SessionKey) {
        self.line(&format!("ADMIT key={}", key));
    }
    fn segment_stored(&self, key: &SessionKey, index: u16, count: u16) {
        self.line(&format!("STORE key={} index={}/{}", key, index, count));
    }
    fn task_cancelled(&self, key: &SessionKey) {
        self.line(&format!("CANCEL key={}", key));
    }
    fn rejected(&self, key: &SessionKey, code: ResultCode) {
        self.line(&format!("REJECT key={} code={:?}", key, code));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_logger_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfer.log");
        let logger = TextLogger::new(&path).unwrap();
        let key = SessionKey::new([1; 16], 42);
        logger.demand_sent(&key, 512);
        logger.rejected(&key, ResultCode::FileSizeTooLarge);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("DEMAND"));
        assert!(text.contains("FileSizeTooLarge"));
    }
}
