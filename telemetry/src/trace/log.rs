//! Append-only JSON-lines trace log.
//!
//! One record per line. A record is durable once its line (including the
//! trailing newline) has been written and synced; the writer never replies
//! before that. Readers accept the longest valid prefix of the file and
//! report whether anything after it had to be ignored.

use shared_types::TraceRecord;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::TraceError;

pub const TRACE_FILE_NAME: &str = "trace.jsonl";

pub fn trace_path(run_dir: &Path) -> PathBuf {
    run_dir.join(TRACE_FILE_NAME)
}

/// Valid prefix of a trace file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceLog {
    pub records: Vec<TraceRecord>,
    /// Byte length of the valid prefix
    pub valid_len: u64,
    /// True when a malformed or unterminated line was found and ignored
    pub truncated_tail: bool,
}

impl TraceLog {
    pub fn last_sequence_no(&self) -> Option<u64> {
        self.records.iter().map(TraceRecord::sequence_no).max()
    }
}

/// Parse trace bytes, stopping at the first malformed or unterminated line.
pub fn parse_trace(bytes: &[u8]) -> TraceLog {
    let mut records = Vec::new();
    let mut offset = 0usize;
    let mut truncated_tail = false;

    while offset < bytes.len() {
        let Some(line_len) = bytes[offset..].iter().position(|b| *b == b'\n') else {
            truncated_tail = true;
            break;
        };
        let line = &bytes[offset..offset + line_len];
        let next = offset + line_len + 1;

        if line.iter().all(u8::is_ascii_whitespace) {
            offset = next;
            continue;
        }

        match serde_json::from_slice::<TraceRecord>(line) {
            Ok(record) => {
                records.push(record);
                offset = next;
            }
            Err(_) => {
                truncated_tail = true;
                break;
            }
        }
    }

    TraceLog {
        records,
        valid_len: offset as u64,
        truncated_tail,
    }
}

pub async fn read_trace(path: &Path) -> Result<TraceLog, TraceError> {
    let bytes = fs::read(path).await?;
    let log = parse_trace(&bytes);
    if log.truncated_tail {
        tracing::warn!(
            path = %path.display(),
            valid_len = log.valid_len,
            file_len = bytes.len(),
            "Trace log has a torn or malformed tail; using valid prefix"
        );
    }
    Ok(log)
}

// ============================================================================
// Writer
// ============================================================================

/// Single-writer handle on a trace file. Owned by the recorder actor.
#[derive(Debug)]
pub struct TraceLogWriter {
    file: File,
    path: PathBuf,
    committed_len: u64,
    poisoned: Option<String>,
}

impl TraceLogWriter {
    /// Open (or create) the log, discarding any torn tail left by a crash.
    ///
    /// Returns the records already present so the caller can continue the
    /// sequence after the last valid one.
    pub async fn open(path: impl Into<PathBuf>) -> Result<(Self, TraceLog), TraceError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let existing = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let log = parse_trace(&existing);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        if log.valid_len < existing.len() as u64 {
            tracing::warn!(
                path = %path.display(),
                valid_len = log.valid_len,
                discarded_bytes = existing.len() as u64 - log.valid_len,
                "Discarding torn tail of trace log"
            );
            file.set_len(log.valid_len).await?;
        }

        Ok((
            Self {
                file,
                path,
                committed_len: log.valid_len,
                poisoned: None,
            },
            log,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn committed_len(&self) -> u64 {
        self.committed_len
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    /// Append one record and sync it to disk.
    ///
    /// On failure the file is cut back to the last committed length so a
    /// partial line never survives; if that also fails the writer refuses
    /// further appends.
    pub async fn append(&mut self, record: &TraceRecord) -> Result<(), TraceError> {
        if let Some(reason) = &self.poisoned {
            return Err(TraceError::Poisoned(reason.clone()));
        }

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        match self.write_line(&line).await {
            Ok(()) => {
                self.committed_len += line.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.rollback(&e).await;
                Err(e.into())
            }
        }
    }

    async fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        self.file.write_all(line).await?;
        self.file.flush().await?;
        self.file.sync_data().await
    }

    async fn rollback(&mut self, cause: &std::io::Error) {
        if let Err(e) = self.file.set_len(self.committed_len).await {
            tracing::error!(
                path = %self.path.display(),
                committed_len = self.committed_len,
                cause = %cause,
                error = %e,
                "Failed to roll back partial trace line"
            );
            self.poisoned = Some(format!("{cause}; rollback failed: {e}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shared_types::{EventRecord, Level, TaskId};
    use tempfile::TempDir;

    fn event(seq: u64, message: &str) -> TraceRecord {
        TraceRecord::Event(EventRecord {
            sequence_no: seq,
            run_id: None,
            task_id: TaskId::main(),
            level: Level::Info,
            category: "SYSTEM".to_string(),
            code: None,
            message: message.to_string(),
            data: serde_json::Value::Null,
            artifact_ref: None,
            ts: Utc::now(),
        })
    }

    fn line(record: &TraceRecord) -> Vec<u8> {
        let mut bytes = serde_json::to_vec(record).unwrap();
        bytes.push(b'\n');
        bytes
    }

    #[test]
    fn test_parse_stops_at_unterminated_line() {
        let mut bytes = line(&event(1, "a"));
        bytes.extend(line(&event(2, "b")));
        let valid = bytes.len() as u64;
        bytes.extend_from_slice(br#"{"kind":"event","sequence_no":3,"#);

        let log = parse_trace(&bytes);
        assert_eq!(log.records.len(), 2);
        assert_eq!(log.valid_len, valid);
        assert!(log.truncated_tail);
        assert_eq!(log.last_sequence_no(), Some(2));
    }

    #[test]
    fn test_parse_stops_at_malformed_line() {
        let mut bytes = line(&event(1, "a"));
        bytes.extend_from_slice(b"not json\n");
        bytes.extend(line(&event(3, "c")));

        let log = parse_trace(&bytes);
        assert_eq!(log.records.len(), 1);
        assert!(log.truncated_tail);
    }

    #[test]
    fn test_parse_clean_file() {
        let mut bytes = line(&event(1, "a"));
        bytes.extend_from_slice(b"\n");
        bytes.extend(line(&event(2, "b")));

        let log = parse_trace(&bytes);
        assert_eq!(log.records.len(), 2);
        assert!(!log.truncated_tail);
        assert_eq!(log.valid_len, bytes.len() as u64);
    }

    #[tokio::test]
    async fn test_writer_appends_and_reopens() {
        let dir = TempDir::new().unwrap();
        let path = trace_path(dir.path());

        let (mut writer, existing) = TraceLogWriter::open(&path).await.unwrap();
        assert!(existing.records.is_empty());
        writer.append(&event(1, "first")).await.unwrap();
        writer.append(&event(2, "second")).await.unwrap();
        drop(writer);

        let (writer, existing) = TraceLogWriter::open(&path).await.unwrap();
        assert_eq!(existing.records.len(), 2);
        assert_eq!(existing.last_sequence_no(), Some(2));
        assert_eq!(writer.committed_len(), existing.valid_len);
        assert!(!writer.is_poisoned());
    }

    #[tokio::test]
    async fn test_writer_discards_torn_tail_on_open() {
        let dir = TempDir::new().unwrap();
        let path = trace_path(dir.path());

        let mut bytes = line(&event(1, "kept"));
        bytes.extend_from_slice(br#"{"kind":"begin","sequence_no":2"#);
        tokio::fs::write(&path, &bytes).await.unwrap();

        let (mut writer, existing) = TraceLogWriter::open(&path).await.unwrap();
        assert_eq!(existing.records.len(), 1);
        assert!(existing.truncated_tail);

        writer.append(&event(2, "after crash")).await.unwrap();
        drop(writer);

        let log = read_trace(&path).await.unwrap();
        assert!(!log.truncated_tail);
        assert_eq!(log.records.len(), 2);
        assert_eq!(log.records[1].sequence_no(), 2);
    }
}
