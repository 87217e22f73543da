//! Result persistence and periodic checkpointing.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use qs_types::{QsResult, ScanError};

use crate::job::ScanResult;

/// Append-only destination for retained results.
pub trait ResultStore: Send {
    /// Grid index to sampled values of every stored result, used to resume
    /// a scan.
    fn completed_points(&mut self) -> QsResult<BTreeMap<usize, Vec<f64>>>;

    /// Append `results` after everything stored so far. Never rewrites
    /// earlier entries.
    fn append(&mut self, results: &[ScanResult]) -> QsResult<()>;

    /// Where results go, for logs.
    fn describe(&self) -> String;
}

/// One JSON document per line.
#[derive(Debug, Clone)]
pub struct JsonlResultStore {
    path: PathBuf,
}

/// The part of a stored line needed to resume. Diagnostics may hold NaN,
/// which serializes as `null`, so full results are not parsed here.
#[derive(Deserialize)]
struct StoredPoint {
    index: usize,
    values: Vec<f64>,
}

impl JsonlResultStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every stored result, sorted by grid index. A truncated last line is
    /// skipped; any other malformed line is an error.
    pub fn read_all(&self) -> QsResult<Vec<ScanResult>> {
        let mut results: Vec<ScanResult> = self.read_lines()?;
        results.sort_by_key(|r| r.index);
        Ok(results)
    }

    fn read_lines<T: for<'de> Deserialize<'de>>(&self) -> QsResult<Vec<T>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let lines: Vec<String> = BufReader::new(file).lines().collect::<Result<_, _>>()?;
        let last = lines.len().saturating_sub(1);

        let mut parsed = Vec::with_capacity(lines.len());
        for (number, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(value) => parsed.push(value),
                Err(e) if number == last => {
                    warn!("Ignoring truncated last line of {}: {}", self.path.display(), e);
                }
                Err(e) => {
                    return Err(ScanError::StoreUnreadable {
                        message: format!("{} line {}: {}", self.path.display(), number + 1, e),
                    }
                    .into())
                }
            }
        }
        Ok(parsed)
    }

    /// Cut a partial last line left by an interrupted write, so the next
    /// append starts on a fresh line.
    fn repair_tail(&self, file: &mut File) -> QsResult<()> {
        let len = file.metadata()?.len();
        if len == 0 {
            return Ok(());
        }
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))?;
        file.read_exact(&mut last)?;
        if last[0] == b'\n' {
            return Ok(());
        }

        let mut contents = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut contents)?;
        let keep = contents
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |newline| newline + 1) as u64;
        warn!(
            "Dropping {} bytes of an incomplete last line in {}",
            len - keep,
            self.path.display()
        );
        file.set_len(keep)?;
        Ok(())
    }
}

impl ResultStore for JsonlResultStore {
    fn completed_points(&mut self) -> QsResult<BTreeMap<usize, Vec<f64>>> {
        let entries: Vec<StoredPoint> = self.read_lines()?;
        Ok(entries.into_iter().map(|e| (e.index, e.values)).collect())
    }

    fn append(&mut self, results: &[ScanResult]) -> QsResult<()> {
        if results.is_empty() {
            return Ok(());
        }
        let mut buffer = String::new();
        for result in results {
            buffer.push_str(&serde_json::to_string(result)?);
            buffer.push('\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;
        self.repair_tail(&mut file)?;
        file.write_all(buffer.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Keeps everything in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryResultStore {
    results: Vec<ScanResult>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_results(results: Vec<ScanResult>) -> Self {
        Self { results }
    }

    pub fn results(&self) -> &[ScanResult] {
        &self.results
    }
}

impl ResultStore for MemoryResultStore {
    fn completed_points(&mut self) -> QsResult<BTreeMap<usize, Vec<f64>>> {
        Ok(self.results.iter().map(|r| (r.index, r.values.clone())).collect())
    }

    fn append(&mut self, results: &[ScanResult]) -> QsResult<()> {
        self.results.extend_from_slice(results);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

impl<S: ResultStore + ?Sized> ResultStore for &mut S {
    fn completed_points(&mut self) -> QsResult<BTreeMap<usize, Vec<f64>>> {
        (**self).completed_points()
    }

    fn append(&mut self, results: &[ScanResult]) -> QsResult<()> {
        (**self).append(results)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Tracks which retained results have reached the store.
///
/// The cursor only moves after a successful append, so a failed write is
/// retried with the next checkpoint.
pub struct Checkpointer<S> {
    store: S,
    period: usize,
    completed: usize,
    persisted: usize,
}

impl<S: ResultStore> Checkpointer<S> {
    pub fn new(store: S, period: usize) -> Self {
        Self {
            store,
            period: period.max(1),
            completed: 0,
            persisted: 0,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Retained results written so far.
    pub fn persisted(&self) -> usize {
        self.persisted
    }

    /// Count one completed job and checkpoint if the period is reached.
    /// `retained` is every retained result of this run, in completion order.
    pub fn job_completed(&mut self, retained: &[ScanResult]) {
        self.completed += 1;
        if self.completed % self.period == 0 {
            if let Err(e) = self.flush(retained) {
                warn!("Checkpoint to {} failed, will retry: {}", self.store.describe(), e);
            }
        }
    }

    /// Append the retained results not yet persisted.
    pub fn flush(&mut self, retained: &[ScanResult]) -> Result<usize, ScanError> {
        let pending = retained.get(self.persisted..).unwrap_or_default();
        if pending.is_empty() {
            return Ok(0);
        }
        match self.store.append(pending) {
            Ok(()) => {
                self.persisted += pending.len();
                debug!(written = pending.len(), total = self.persisted, "checkpoint written");
                Ok(pending.len())
            }
            Err(e) => Err(ScanError::CheckpointFailed {
                persisted: self.persisted,
                message: e.to_string(),
            }),
        }
    }

    /// Final checkpoint.
    pub fn finish(&mut self, retained: &[ScanResult]) -> Result<usize, ScanError> {
        let written = self.flush(retained)?;
        info!(
            "Persisted {} retained results to {}",
            self.persisted,
            self.store.describe()
        );
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qs_types::Diagnostics;
    use uuid::Uuid;

    fn retained(index: usize) -> ScanResult {
        let mut result = ScanResult::failed(Uuid::nil(), index, vec![index as f64], "placeholder");
        result.verdict = crate::job::Verdict::Retained;
        result.final_diagnostics = Some(Diagnostics {
            iota: 0.1 * index as f64,
            ..Diagnostics::default()
        });
        result
    }

    /// Fails a fixed number of appends, then behaves.
    struct FlakyStore {
        inner: MemoryResultStore,
        failures_left: usize,
    }

    impl ResultStore for FlakyStore {
        fn completed_points(&mut self) -> QsResult<BTreeMap<usize, Vec<f64>>> {
            self.inner.completed_points()
        }

        fn append(&mut self, results: &[ScanResult]) -> QsResult<()> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into());
            }
            self.inner.append(results)
        }

        fn describe(&self) -> String {
            "flaky".to_string()
        }
    }

    #[test]
    fn jsonl_store_appends_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        let mut store = JsonlResultStore::new(&path);

        assert!(store.completed_points().unwrap().is_empty());
        store.append(&[retained(4), retained(1)]).unwrap();
        store.append(&[retained(2)]).unwrap();

        let points = store.completed_points().unwrap();
        assert_eq!(points.keys().copied().collect::<Vec<_>>(), vec![1, 2, 4]);
        assert_eq!(points[&4], vec![4.0]);
        let all = store.read_all().unwrap();
        assert_eq!(all.iter().map(|r| r.index).collect::<Vec<_>>(), vec![1, 2, 4]);
        assert_eq!(all[2], retained(4));

        let reopened = JsonlResultStore::new(&path);
        assert_eq!(reopened.read_all().unwrap().len(), 3);
    }

    #[test]
    fn truncated_tail_is_ignored_but_corruption_is_not() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        let mut store = JsonlResultStore::new(&path);
        store.append(&[retained(0)]).unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"run_id\":\"00000000-").unwrap();
        assert_eq!(store.completed_points().unwrap().len(), 1);

        std::fs::write(&path, "not json\n{\"index\": 3, \"values\": []}\n").unwrap();
        assert!(store.completed_points().is_err());
    }

    #[test]
    fn append_after_interrupted_write_keeps_every_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        let mut store = JsonlResultStore::new(&path);
        store.append(&[retained(0)]).unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"run_id\":\"0000").unwrap();
        drop(file);
        assert_eq!(store.completed_points().unwrap().len(), 1);

        store.append(&[retained(1)]).unwrap();
        let indices: Vec<_> = store.completed_points().unwrap().into_keys().collect();
        assert_eq!(indices, vec![0, 1]);

        store.append(&[retained(2)]).unwrap();
        let all = store.read_all().unwrap();
        assert_eq!(all.iter().map(|r| r.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(std::fs::read_to_string(&path).unwrap().ends_with('\n'));
    }

    #[test]
    fn checkpoints_every_period() {
        let mut checkpointer = Checkpointer::new(MemoryResultStore::new(), 2);
        let results: Vec<_> = (0..5).map(retained).collect();

        checkpointer.job_completed(&results[..1]);
        assert_eq!(checkpointer.persisted(), 0);
        checkpointer.job_completed(&results[..2]);
        assert_eq!(checkpointer.persisted(), 2);
        // a rejected job still counts toward the period
        checkpointer.job_completed(&results[..2]);
        checkpointer.job_completed(&results[..3]);
        assert_eq!(checkpointer.persisted(), 3);
        checkpointer.finish(&results).unwrap();
        assert_eq!(checkpointer.store().results().len(), 5);
    }

    #[test]
    fn failed_write_is_retried_without_losing_results() {
        let store = FlakyStore {
            inner: MemoryResultStore::new(),
            failures_left: 1,
        };
        let mut checkpointer = Checkpointer::new(store, 1);
        let results: Vec<_> = (0..3).map(retained).collect();

        checkpointer.job_completed(&results[..1]);
        assert_eq!(checkpointer.persisted(), 0);
        checkpointer.job_completed(&results[..2]);
        assert_eq!(checkpointer.persisted(), 2);
        checkpointer.finish(&results).unwrap();

        let indices: Vec<_> = checkpointer.store().inner.results().iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn final_failure_reports_persisted_count() {
        let store = FlakyStore {
            inner: MemoryResultStore::new(),
            failures_left: 5,
        };
        let mut checkpointer = Checkpointer::new(store, 10);
        let err = checkpointer.finish(&[retained(0)]).unwrap_err();
        assert!(matches!(err, ScanError::CheckpointFailed { persisted: 0, .. }));
    }
}
