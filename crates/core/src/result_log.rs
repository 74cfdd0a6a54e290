//! Append-only JSON-lines log of per-unit migration results.
//!
//! Each processed unit produces exactly one line, written and flushed to
//! disk before the next unit starts. Earlier lines are never rewritten; a
//! rerun reads the log back and treats the last line for a key as that
//! key's current state.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::errors::ResultLogError;
use crate::models::{MigrationResult, Stage};

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Open handle on the result log. Flushed after every append and again when
/// dropped.
#[derive(Debug)]
pub struct ResultLog {
    path: PathBuf,
    writer: BufWriter<File>,
    written: usize,
}

impl ResultLog {
    /// Open (or create) the log for appending. Parent directories are
    /// created as needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ResultLogError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| io_error(&path, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_error(&path, e))?;
        info!(path = %path.display(), "opened result log");
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines appended through this handle.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Append one result and make it durable before returning.
    pub fn append(&mut self, result: &MigrationResult) -> Result<(), ResultLogError> {
        let line = serde_json::to_string(result)?;
        self.writer
            .write_all(line.as_bytes())
            .and_then(|()| self.writer.write_all(b"\n"))
            .and_then(|()| self.writer.flush())
            .and_then(|()| self.writer.get_ref().sync_data())
            .map_err(|e| io_error(&self.path, e))?;
        self.written += 1;
        debug!(key = %result.key, stage = %result.stage, "result recorded");
        Ok(())
    }
}

impl Drop for ResultLog {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!(path = %self.path.display(), error = %e, "failed to flush result log on close");
        }
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Every well-formed entry in the log, in file order.
///
/// A missing file is an empty log. Lines that do not parse (for example a
/// line cut short by a crash) are skipped with a warning.
pub fn read_all<P: AsRef<Path>>(path: P) -> Result<Vec<MigrationResult>, ResultLogError> {
    let path = path.as_ref();
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no result log yet");
            return Ok(Vec::new());
        }
        Err(e) => return Err(io_error(path, e)),
    };

    let mut results = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| io_error(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<MigrationResult>(&line) {
            Ok(result) => results.push(result),
            Err(e) => warn!(
                path = %path.display(),
                line = idx + 1,
                error = %e,
                "skipping unreadable result log line"
            ),
        }
    }
    Ok(results)
}

/// Latest result per key, as left by earlier runs.
#[derive(Debug, Clone, Default)]
pub struct PriorResults {
    order: Vec<String>,
    latest: HashMap<String, MigrationResult>,
}

impl PriorResults {
    /// Read the log at `path` and keep the last entry for each key.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ResultLogError> {
        let prior = Self::from_results(read_all(path.as_ref())?);
        info!(
            path = %path.as_ref().display(),
            keys = prior.len(),
            "loaded prior results"
        );
        Ok(prior)
    }

    pub fn from_results<I: IntoIterator<Item = MigrationResult>>(results: I) -> Self {
        let mut prior = Self::default();
        for result in results {
            if !prior.latest.contains_key(&result.key) {
                prior.order.push(result.key.clone());
            }
            prior.latest.insert(result.key.clone(), result);
        }
        prior
    }

    pub fn get(&self, key: &str) -> Option<&MigrationResult> {
        self.latest.get(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Latest entries in the order their keys first appeared.
    pub fn iter(&self) -> impl Iterator<Item = &MigrationResult> {
        self.order.iter().filter_map(|k| self.latest.get(k))
    }

    /// Number of keys whose latest entry is at `stage`.
    pub fn count_at(&self, stage: Stage) -> usize {
        self.latest.values().filter(|r| r.stage == stage).count()
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ResultLogError {
    ResultLogError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_append_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("results.jsonl");
        let run_id = Uuid::new_v4();

        {
            let mut log = ResultLog::open(&path).unwrap();
            log.append(&MigrationResult::reached(
                run_id,
                "a@x.com",
                Stage::PasswordSet,
                "u-1",
            ))
            .unwrap();
            log.append(&MigrationResult::failed(run_id, "b@x.com", "HTTP 400", None))
                .unwrap();
            assert_eq!(log.written(), 2);
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);

        let results = read_all(&path).unwrap();
        assert_eq!(results[0].key, "a@x.com");
        assert_eq!(results[0].destination_user_id.as_deref(), Some("u-1"));
        assert!(results[1].is_failed());
    }

    #[test]
    fn test_reopen_appends_without_truncating() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        let run_id = Uuid::new_v4();

        for key in ["a@x.com", "b@x.com"] {
            let mut log = ResultLog::open(&path).unwrap();
            log.append(&MigrationResult::reached(
                run_id,
                key,
                Stage::ProfileCreated,
                "u",
            ))
            .unwrap();
        }
        assert_eq!(read_all(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let results = read_all(dir.path().join("absent.jsonl")).unwrap();
        assert!(results.is_empty());
        assert!(PriorResults::load(dir.path().join("absent.jsonl"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_truncated_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        let good = serde_json::to_string(&MigrationResult::reached(
            Uuid::new_v4(),
            "a@x.com",
            Stage::PasswordSet,
            "u-1",
        ))
        .unwrap();
        std::fs::write(&path, format!("{}\n\n{{\"key\":\"b@x", good)).unwrap();

        let results = read_all(&path).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].key, "a@x.com");
    }

    #[test]
    fn test_latest_entry_wins() {
        let run_1 = Uuid::new_v4();
        let run_2 = Uuid::new_v4();
        let prior = PriorResults::from_results(vec![
            MigrationResult::failed(run_1, "a@x.com", "HTTP 503", Some("u-1")),
            MigrationResult::reached(run_1, "b@x.com", Stage::PasswordSet, "u-2"),
            MigrationResult::reached(run_2, "a@x.com", Stage::PasswordSet, "u-1"),
        ]);

        assert_eq!(prior.len(), 2);
        let a = prior.get("a@x.com").unwrap();
        assert_eq!(a.stage, Stage::PasswordSet);
        assert_eq!(a.run_id, run_2);
        assert_eq!(prior.count_at(Stage::Failed), 0);
        assert_eq!(prior.count_at(Stage::PasswordSet), 2);

        let keys: Vec<&str> = prior.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["a@x.com", "b@x.com"]);
    }
}
