//! Lineage recorder: JSONL append-only audit log.
//!
//! One [`LineageRecord`] per stage invocation, one JSON object per line.
//! Records are never rewritten. Each append is a single `write` of a complete
//! line on a file opened in append mode, under a process-wide mutex, so
//! concurrent stages never interleave partial records.
//!
//! Checksums are content hashes, which makes an identical rerun detectable:
//! its record carries `replay_of` pointing at the first equivalent run.
//! Replay lookups go through an in-memory index that reads only the bytes
//! appended since the previous lookup, so lines written by other processes
//! are still seen.

use crate::domain::{Checksum, RunId};
use crate::store::{StoreError, WriteOutcome};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Pipeline stage names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ingest,
    Validate,
    BuildEvents,
    AggregateMacro,
    AssembleFeatures,
    Evaluate,
    Simulate,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Ingest => "ingest",
            Stage::Validate => "validate",
            Stage::BuildEvents => "build_events",
            Stage::AggregateMacro => "aggregate_macro",
            Stage::AssembleFeatures => "assemble_features",
            Stage::Evaluate => "evaluate",
            Stage::Simulate => "simulate",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a candidate feature row was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DropReason {
    /// Lag window reaches the first observation, whose return is undefined.
    UndefinedReturn,
    /// Date absent from the exogenous event table.
    MissingExogenous,
    /// Macro indicator has no observation at or before the date.
    InsufficientHistory,
    /// Horizon runs past the end of the series.
    MissingTarget,
}

/// Row-level drop, logged with its stage record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowDrop {
    pub ticker: String,
    pub date: NaiveDate,
    pub reason: DropReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// One stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageRecord {
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub stage_name: Stage,
    pub params_hash: Checksum,
    pub input_checksums: BTreeMap<String, Checksum>,
    pub output_checksums: BTreeMap<String, Checksum>,
    pub row_counts: BTreeMap<String, usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drops: Vec<RowDrop>,
    /// Set when the stage halted; names the record that caused it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halted: Option<String>,
    /// First earlier run with identical params, inputs and outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_of: Option<RunId>,
}

impl LineageRecord {
    pub fn is_replay(&self) -> bool {
        self.replay_of.is_some()
    }

    /// Hash of everything two equivalent runs share: stage, params, inputs,
    /// outputs and halt reason.
    fn content_key(&self) -> Result<Checksum, serde_json::Error> {
        Checksum::of_json(&(
            self.stage_name,
            &self.params_hash,
            &self.input_checksums,
            &self.output_checksums,
            &self.halted,
        ))
    }
}

/// Builder for the record of one stage invocation.
#[derive(Debug, Clone)]
pub struct StageRun {
    stage: Stage,
    params_hash: Checksum,
    inputs: BTreeMap<String, Checksum>,
    outputs: BTreeMap<String, Checksum>,
    row_counts: BTreeMap<String, usize>,
    drops: Vec<RowDrop>,
    halted: Option<String>,
}

impl StageRun {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            params_hash: Checksum::of_bytes(b"{}"),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            row_counts: BTreeMap::new(),
            drops: Vec::new(),
            halted: None,
        }
    }

    /// Hash of the stage parameters (canonical JSON).
    pub fn params<T: Serialize>(mut self, params: &T) -> Result<Self, serde_json::Error> {
        self.params_hash = Checksum::of_json(params)?;
        Ok(self)
    }

    pub fn input(mut self, key: impl Into<String>, checksum: Checksum) -> Self {
        self.inputs.insert(key.into(), checksum);
        self
    }

    pub fn output(mut self, key: impl Into<String>, checksum: Checksum) -> Self {
        self.outputs.insert(key.into(), checksum);
        self
    }

    pub fn committed(self, outcome: &WriteOutcome) -> Self {
        self.output(outcome.key.clone(), outcome.checksum.clone())
    }

    pub fn rows(mut self, name: impl Into<String>, count: usize) -> Self {
        self.row_counts.insert(name.into(), count);
        self
    }

    pub fn drops(mut self, drops: Vec<RowDrop>) -> Self {
        self.drops = drops;
        self
    }

    pub fn halted(mut self, reason: impl Into<String>) -> Self {
        self.halted = Some(reason.into());
        self
    }
}

/// First run per content key, built from the log a suffix at a time.
#[derive(Debug, Default)]
struct ReplayIndex {
    /// Bytes of the log already folded into `first_runs`.
    offset: u64,
    first_runs: HashMap<Checksum, RunId>,
}

impl ReplayIndex {
    /// Fold in complete lines appended since the last call. A trailing line
    /// without its newline is left for next time.
    fn catch_up(&mut self, path: &Path) -> Result<(), StoreError> {
        let io = |source: io::Error| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut file = match fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                *self = Self::default();
                return Ok(());
            }
            Err(source) => return Err(io(source)),
        };
        let len = file.metadata().map_err(io)?.len();
        if len < self.offset {
            log::warn!("lineage log {} shrank, rebuilding replay index", path.display());
            *self = Self::default();
        }
        if len == self.offset {
            return Ok(());
        }

        file.seek(SeekFrom::Start(self.offset)).map_err(io)?;
        let mut tail = Vec::new();
        file.read_to_end(&mut tail).map_err(io)?;
        let Some(last_newline) = tail.iter().rposition(|&b| b == b'\n') else {
            return Ok(());
        };

        for line in tail[..last_newline].split(|&b| b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<LineageRecord>(line) {
                Ok(r) => {
                    let first = r.replay_of.clone().unwrap_or_else(|| r.run_id.clone());
                    self.first_runs.entry(r.content_key()?).or_insert(first);
                }
                Err(e) => log::warn!("lineage line past byte {} unreadable: {e}", self.offset),
            }
        }
        self.offset += last_newline as u64 + 1;
        Ok(())
    }
}

/// Append-only JSONL lineage log.
#[derive(Debug)]
pub struct LineageLog {
    path: PathBuf,
    index: Mutex<ReplayIndex>,
}

impl LineageLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            index: Mutex::new(ReplayIndex::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `record(stage_name, inputs, outputs)` without params or row counts.
    pub fn record(
        &self,
        stage: Stage,
        inputs: BTreeMap<String, Checksum>,
        outputs: BTreeMap<String, Checksum>,
    ) -> Result<LineageRecord, StoreError> {
        let mut run = StageRun::new(stage);
        run.inputs = inputs;
        run.outputs = outputs;
        self.append(run)
    }

    /// Append one record. Returns the record as written.
    pub fn append(&self, run: StageRun) -> Result<LineageRecord, StoreError> {
        let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());

        let timestamp = Utc::now();
        let mut identity = Vec::new();
        identity.extend_from_slice(run.stage.as_str().as_bytes());
        identity.extend_from_slice(run.params_hash.0.as_bytes());
        for (k, v) in &run.inputs {
            identity.extend_from_slice(k.as_bytes());
            identity.extend_from_slice(v.0.as_bytes());
        }

        let mut record = LineageRecord {
            run_id: RunId::new(timestamp, &Checksum::of_bytes(&identity)),
            timestamp,
            stage_name: run.stage,
            params_hash: run.params_hash,
            input_checksums: run.inputs,
            output_checksums: run.outputs,
            row_counts: run.row_counts,
            drops: run.drops,
            halted: run.halted,
            replay_of: None,
        };

        index.catch_up(&self.path)?;
        let content_key = record.content_key()?;
        record.replay_of = index.first_runs.get(&content_key).cloned();

        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let io = |source: io::Error| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io)?;
        file.write_all(line.as_bytes()).map_err(io)?;
        file.flush().map_err(io)?;
        // Offset stays put: the next catch-up re-reads this line along with
        // anything another writer appended before it.
        index
            .first_runs
            .entry(content_key)
            .or_insert_with(|| record.replay_of.clone().unwrap_or_else(|| record.run_id.clone()));

        if record.is_replay() {
            log::info!("lineage: {} replayed {}", record.stage_name, record.run_id);
        } else {
            log::debug!("lineage: {} recorded {}", record.stage_name, record.run_id);
        }
        Ok(record)
    }

    /// All records in append order. Malformed lines are skipped with a warning.
    pub fn read_all(&self) -> Result<Vec<LineageRecord>, StoreError> {
        let _guard = self.index.lock().unwrap_or_else(|e| e.into_inner());
        self.read_records()
    }

    fn read_records(&self) -> Result<Vec<LineageRecord>, StoreError> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let mut records = Vec::new();
        for (n, line) in io::BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LineageRecord>(&line) {
                Ok(r) => records.push(r),
                Err(e) => log::warn!("lineage line {} unreadable: {e}", n + 1),
            }
        }
        Ok(records)
    }

    /// Full causal chain of the stages that produced `artifact_key`, in
    /// execution order (the producing stage last).
    ///
    /// Each input is resolved to the latest earlier record that output the
    /// same key with the same checksum. Empty if nothing produced the key.
    pub fn causal_chain(&self, artifact_key: &str) -> Result<Vec<LineageRecord>, StoreError> {
        let records = self.read_all()?;
        Ok(causal_chain(&records, artifact_key))
    }

    /// Chain ending at the record with `run_id`, which need not have outputs.
    pub fn chain_for_run(&self, run_id: &RunId) -> Result<Vec<LineageRecord>, StoreError> {
        let records = self.read_all()?;
        Ok(records
            .iter()
            .rposition(|r| &r.run_id == run_id)
            .map(|root| chain_from(&records, root))
            .unwrap_or_default())
    }
}

/// Resolve the chain over an in-memory record list.
pub fn causal_chain(records: &[LineageRecord], artifact_key: &str) -> Vec<LineageRecord> {
    records
        .iter()
        .rposition(|r| r.output_checksums.contains_key(artifact_key))
        .map(|root| chain_from(records, root))
        .unwrap_or_default()
}

fn chain_from(records: &[LineageRecord], root: usize) -> Vec<LineageRecord> {
    let mut chosen: HashSet<usize> = HashSet::new();
    let mut stack = vec![root];
    while let Some(idx) = stack.pop() {
        if !chosen.insert(idx) {
            continue;
        }
        for (key, checksum) in &records[idx].input_checksums {
            let producer = records[..idx]
                .iter()
                .rposition(|r| r.output_checksums.get(key) == Some(checksum));
            if let Some(p) = producer {
                stack.push(p);
            }
        }
    }

    let mut ordered: Vec<usize> = chosen.into_iter().collect();
    ordered.sort_unstable();
    ordered.into_iter().map(|i| records[i].clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn sum(s: &str) -> Checksum {
        Checksum::of_bytes(s.as_bytes())
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = LineageLog::new(dir.path().join("logs/lineage.jsonl"));

        let rec = log
            .append(
                StageRun::new(Stage::Ingest)
                    .output("raw/ticker=BBVA.MC/bars.parquet", sum("raw"))
                    .rows("bars", 250),
            )
            .unwrap();
        assert!(!rec.is_replay());

        let all = log.read_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].row_counts["bars"], 250);
    }

    #[test]
    fn identical_rerun_is_marked_as_replay() {
        let dir = tempfile::tempdir().unwrap();
        let log = LineageLog::new(dir.path().join("lineage.jsonl"));
        let run = || {
            StageRun::new(Stage::Validate)
                .input("raw/x", sum("raw"))
                .output("validated/x", sum("validated"))
        };

        let first = log.append(run()).unwrap();
        let second = log.append(run()).unwrap();
        let third = log.append(run()).unwrap();

        assert!(!first.is_replay());
        assert_eq!(second.replay_of, Some(first.run_id.clone()));
        assert_eq!(third.replay_of, Some(first.run_id));
        // Append-only: all three records are kept.
        assert_eq!(log.read_all().unwrap().len(), 3);
    }

    #[test]
    fn replay_index_sees_lines_from_other_writers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lineage.jsonl");
        let a = LineageLog::new(&path);
        let b = LineageLog::new(&path);
        let run = |tag: &str| {
            StageRun::new(Stage::Ingest)
                .input("source/x", sum(tag))
                .output("raw/x", sum("raw"))
        };

        // Warm `a`'s index, then let `b` write a record `a` has not seen.
        for k in 0..50 {
            a.append(run(&format!("filler-{k}"))).unwrap();
        }
        let original = b.append(run("shared")).unwrap();
        assert!(!original.is_replay());

        let rerun = a.append(run("shared")).unwrap();
        assert_eq!(rerun.replay_of, Some(original.run_id.clone()));
        let again = b.append(run("shared")).unwrap();
        assert_eq!(again.replay_of, Some(original.run_id));

        // A fresh handle rebuilds the same answer from the whole file.
        let fresh = LineageLog::new(&path);
        assert!(fresh.append(run("filler-7")).unwrap().is_replay());
        assert_eq!(fresh.read_all().unwrap().len(), 54);
    }

    #[test]
    fn unterminated_tail_is_not_indexed_until_complete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lineage.jsonl");
        let log = LineageLog::new(&path);
        let run = || StageRun::new(Stage::BuildEvents).output("events", sum("events"));

        let first = log.append(run()).unwrap();
        let mut text = fs::read_to_string(&path).unwrap();
        let line = text.clone();
        // Another writer mid-way through its line.
        text.push_str(&line[..line.len() / 2]);
        fs::write(&path, &text).unwrap();

        let second = log.append(run()).unwrap();
        assert_eq!(second.replay_of, Some(first.run_id));
    }

    #[test]
    fn changed_output_is_not_a_replay() {
        let dir = tempfile::tempdir().unwrap();
        let log = LineageLog::new(dir.path().join("lineage.jsonl"));
        log.append(StageRun::new(Stage::Validate).output("v", sum("a")))
            .unwrap();
        let rec = log
            .append(StageRun::new(Stage::Validate).output("v", sum("b")))
            .unwrap();
        assert!(!rec.is_replay());
    }

    #[test]
    fn causal_chain_follows_checksums() {
        let dir = tempfile::tempdir().unwrap();
        let log = LineageLog::new(dir.path().join("lineage.jsonl"));

        log.append(StageRun::new(Stage::Ingest).output("raw", sum("raw-v1")))
            .unwrap();
        log.append(
            StageRun::new(Stage::Validate)
                .input("raw", sum("raw-v1"))
                .output("validated", sum("val-v1")),
        )
        .unwrap();
        log.append(StageRun::new(Stage::BuildEvents).output("events", sum("evt")))
            .unwrap();
        log.append(StageRun::new(Stage::AggregateMacro).output("macro", sum("mac")))
            .unwrap();
        // Unrelated ingest of another ticker.
        log.append(StageRun::new(Stage::Ingest).output("raw-other", sum("o")))
            .unwrap();
        log.append(
            StageRun::new(Stage::AssembleFeatures)
                .input("validated", sum("val-v1"))
                .input("events", sum("evt"))
                .input("macro", sum("mac"))
                .output("features", sum("feat")),
        )
        .unwrap();

        let chain = log.causal_chain("features").unwrap();
        let stages: Vec<Stage> = chain.iter().map(|r| r.stage_name).collect();
        assert_eq!(
            stages,
            vec![
                Stage::Ingest,
                Stage::Validate,
                Stage::BuildEvents,
                Stage::AggregateMacro,
                Stage::AssembleFeatures
            ]
        );
        assert!(chain
            .iter()
            .all(|r| !r.output_checksums.contains_key("raw-other")));
    }

    #[test]
    fn causal_chain_ignores_stale_producer() {
        let records = {
            let dir = tempfile::tempdir().unwrap();
            let log = LineageLog::new(dir.path().join("lineage.jsonl"));
            log.append(StageRun::new(Stage::Ingest).output("raw", sum("v1")))
                .unwrap();
            log.append(StageRun::new(Stage::Ingest).output("raw", sum("v2")))
                .unwrap();
            log.append(
                StageRun::new(Stage::Validate)
                    .input("raw", sum("v1"))
                    .output("validated", sum("x")),
            )
            .unwrap();
            log.read_all().unwrap()
        };
        let chain = causal_chain(&records, "validated");
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].output_checksums["raw"], sum("v1"));
    }

    #[test]
    fn unknown_artifact_has_empty_chain() {
        let dir = tempfile::tempdir().unwrap();
        let log = LineageLog::new(dir.path().join("lineage.jsonl"));
        assert!(log.causal_chain("nothing").unwrap().is_empty());
    }

    #[test]
    fn concurrent_appends_produce_whole_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(LineageLog::new(dir.path().join("lineage.jsonl")));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for i in 0..10 {
                        log.append(
                            StageRun::new(Stage::AssembleFeatures)
                                .output(format!("features/{t}/{i}"), sum(&format!("{t}-{i}")))
                                .rows("rows", i),
                        )
                        .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let content = fs::read_to_string(log.path()).unwrap();
        assert_eq!(content.lines().count(), 80);
        for line in content.lines() {
            serde_json::from_str::<LineageRecord>(line).unwrap();
        }
    }

    #[test]
    fn drops_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let log = LineageLog::new(dir.path().join("lineage.jsonl"));
        let drop = RowDrop {
            ticker: "SAN.MC".into(),
            date: NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
            reason: DropReason::MissingExogenous,
            detail: None,
        };
        log.append(StageRun::new(Stage::AssembleFeatures).drops(vec![drop.clone()]))
            .unwrap();
        assert_eq!(log.read_all().unwrap()[0].drops, vec![drop]);
    }
}
