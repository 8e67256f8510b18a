//! Content-addressed artifact store with Hive-style partitioning.
//!
//! Layout: `{root}/{kind}/{partition}=.../{name}` plus a `{name}.meta.json`
//! sidecar holding the payload checksum and commit time.
//!
//! - Atomic writes: payload goes to a unique `.tmp` file, then is renamed into place.
//! - The meta sidecar is committed after the payload, so an artifact without
//!   a matching meta is treated as absent.
//! - Rewriting identical bytes is a no-op on the payload; only the meta is refreshed.

use crate::domain::{file_stem_for, Checksum, ConfigHash, DateRange};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt artifact {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("parquet I/O error: {0}")]
    Parquet(String),

    #[error("csv encoding error: {0}")]
    Csv(String),

    #[error("timed out waiting for lock '{key}'")]
    LockTimeout { key: String },
}

pub(crate) fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Artifact families; each maps to a top-level directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Raw,
    Validation,
    Validated,
    Exogenous,
    Macro,
    Features,
    Scaler,
    Model,
    Metrics,
}

impl ArtifactKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            ArtifactKind::Raw => "raw",
            ArtifactKind::Validation => "validation",
            ArtifactKind::Validated => "validated",
            ArtifactKind::Exogenous => "exogenous",
            ArtifactKind::Macro => "macro",
            ArtifactKind::Features => "features",
            ArtifactKind::Scaler => "scalers",
            ArtifactKind::Model => "models",
            ArtifactKind::Metrics => "metrics",
        }
    }
}

/// Explicit artifact key: kind + ordered partitions + file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub kind: ArtifactKind,
    pub partitions: Vec<(String, String)>,
    pub name: String,
}

impl ArtifactKey {
    fn new(kind: ArtifactKind, partitions: &[(&str, String)], name: &str) -> Self {
        Self {
            kind,
            partitions: partitions
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            name: name.to_string(),
        }
    }

    /// Raw snapshot keyed by (ticker, fetch date range).
    pub fn raw_snapshot(ticker: &str, range: &DateRange) -> Self {
        Self::new(
            ArtifactKind::Raw,
            &[("ticker", file_stem_for(ticker)), ("range", range.key())],
            "bars.parquet",
        )
    }

    pub fn validation_report(ticker: &str, range: &DateRange) -> Self {
        Self::new(
            ArtifactKind::Validation,
            &[("ticker", file_stem_for(ticker)), ("range", range.key())],
            "report.json",
        )
    }

    /// One CSV row per ticker for a validation batch.
    pub fn validation_summary(range: &DateRange) -> Self {
        Self::new(
            ArtifactKind::Validation,
            &[("range", range.key())],
            "summary.csv",
        )
    }

    /// Validated (possibly gap-filled) prices; only written for passing tickers.
    pub fn validated_prices(ticker: &str, range: &DateRange) -> Self {
        Self::new(
            ArtifactKind::Validated,
            &[("ticker", file_stem_for(ticker)), ("range", range.key())],
            "prices.json",
        )
    }

    pub fn event_column(category: &str, range: &DateRange) -> Self {
        Self::new(
            ArtifactKind::Exogenous,
            &[("category", category.to_string()), ("range", range.key())],
            "column.json",
        )
    }

    pub fn macro_column(indicator: &str, range: &DateRange) -> Self {
        Self::new(
            ArtifactKind::Macro,
            &[("indicator", indicator.to_string()), ("range", range.key())],
            "column.json",
        )
    }

    /// Feature snapshot keyed by (ticker, feature-config hash).
    pub fn feature_snapshot(ticker: &str, config: &ConfigHash) -> Self {
        Self::new(
            ArtifactKind::Features,
            &[("ticker", file_stem_for(ticker)), ("config", config.0.clone())],
            "snapshot.json",
        )
    }

    pub fn scaler(ticker: &str, config: &ConfigHash) -> Self {
        Self::new(
            ArtifactKind::Scaler,
            &[("ticker", file_stem_for(ticker)), ("config", config.0.clone())],
            "scaler.json",
        )
    }

    /// Model artifact keyed by (ticker, architecture).
    pub fn model(ticker: &str, architecture: &str) -> Self {
        Self::new(
            ArtifactKind::Model,
            &[("ticker", file_stem_for(ticker)), ("arch", architecture.to_string())],
            "model.json",
        )
    }

    pub fn metrics(ticker: &str, architecture: &str) -> Self {
        Self::new(
            ArtifactKind::Metrics,
            &[("ticker", file_stem_for(ticker)), ("arch", architecture.to_string())],
            "metrics.json",
        )
    }

    /// Per-ticker metrics report across architectures.
    pub fn metrics_report(ticker: &str) -> Self {
        Self::new(
            ArtifactKind::Metrics,
            &[("ticker", file_stem_for(ticker))],
            "report.json",
        )
    }

    pub fn relative_path(&self) -> PathBuf {
        let mut p = PathBuf::from(self.kind.dir_name());
        for (k, v) in &self.partitions {
            p.push(format!("{k}={v}"));
        }
        p.push(&self.name);
        p
    }

    /// Stable string id, used as the lineage key.
    pub fn id(&self) -> String {
        let mut s = self.kind.dir_name().to_string();
        for (k, v) in &self.partitions {
            s.push('/');
            s.push_str(k);
            s.push('=');
            s.push_str(v);
        }
        s.push('/');
        s.push_str(&self.name);
        s
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Sidecar committed next to every payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub key: String,
    pub checksum: Checksum,
    pub bytes: u64,
    pub row_count: Option<usize>,
    pub created_at: DateTime<Utc>,
}

impl ArtifactMeta {
    /// Age relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

/// Result of a put.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    pub key: String,
    pub checksum: Checksum,
    /// True when the committed payload already had these exact bytes.
    pub unchanged: bool,
}

/// Content-addressed, atomically committed artifact store.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &ArtifactKey) -> PathBuf {
        self.root.join(key.relative_path())
    }

    fn meta_path(&self, key: &ArtifactKey) -> PathBuf {
        let mut p = self.path_for(key).into_os_string();
        p.push(".meta.json");
        PathBuf::from(p)
    }

    /// Commit raw bytes under `key`.
    pub fn put_bytes(
        &self,
        key: &ArtifactKey,
        bytes: &[u8],
        row_count: Option<usize>,
    ) -> Result<WriteOutcome, StoreError> {
        self.put_bytes_at(key, bytes, row_count, Utc::now())
    }

    /// Commit raw bytes with an explicit commit time.
    pub fn put_bytes_at(
        &self,
        key: &ArtifactKey,
        bytes: &[u8],
        row_count: Option<usize>,
        created_at: DateTime<Utc>,
    ) -> Result<WriteOutcome, StoreError> {
        let checksum = Checksum::of_bytes(bytes);
        let path = self.path_for(key);

        let unchanged = match self.meta(key)? {
            Some(meta) if meta.checksum == checksum => self.payload_matches(&path, &checksum),
            _ => false,
        };

        if !unchanged {
            atomic_write(&path, bytes)?;
        }

        let meta = ArtifactMeta {
            key: key.id(),
            checksum: checksum.clone(),
            bytes: bytes.len() as u64,
            row_count,
            created_at,
        };
        atomic_write(&self.meta_path(key), &serde_json::to_vec_pretty(&meta)?)?;

        log::debug!(
            "committed {} ({} bytes, {})",
            key,
            bytes.len(),
            if unchanged { "unchanged" } else { "new" }
        );

        Ok(WriteOutcome {
            key: key.id(),
            checksum,
            unchanged,
        })
    }

    /// Serialize `value` as pretty JSON and commit it.
    pub fn put_json<T: Serialize>(
        &self,
        key: &ArtifactKey,
        value: &T,
        row_count: Option<usize>,
    ) -> Result<WriteOutcome, StoreError> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.put_bytes(key, &bytes, row_count)
    }

    /// Same as [`put_json`](Self::put_json) with an explicit commit time.
    pub fn put_json_at<T: Serialize>(
        &self,
        key: &ArtifactKey,
        value: &T,
        row_count: Option<usize>,
        created_at: DateTime<Utc>,
    ) -> Result<WriteOutcome, StoreError> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.put_bytes_at(key, &bytes, row_count, created_at)
    }

    /// Read the committed meta sidecar, if any.
    pub fn meta(&self, key: &ArtifactKey) -> Result<Option<ArtifactMeta>, StoreError> {
        let path = self.meta_path(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    /// Read committed bytes, verifying them against the meta checksum.
    ///
    /// Returns `Ok(None)` if the artifact was never committed.
    pub fn get_bytes(&self, key: &ArtifactKey) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(meta) = self.meta(key)? else {
            return Ok(None);
        };
        let path = self.path_for(key);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path)(e)),
        };
        if Checksum::of_bytes(&bytes) != meta.checksum {
            return Err(StoreError::Corrupt {
                key: key.id(),
                reason: "payload checksum does not match meta".into(),
            });
        }
        Ok(Some(bytes))
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &ArtifactKey) -> Result<Option<T>, StoreError> {
        match self.get_bytes(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn exists(&self, key: &ArtifactKey) -> bool {
        self.meta_path(key).exists() && self.path_for(key).exists()
    }

    fn payload_matches(&self, path: &Path, checksum: &Checksum) -> bool {
        fs::read(path)
            .map(|b| &Checksum::of_bytes(&b) == checksum)
            .unwrap_or(false)
    }
}

/// Write to a unique temp file in the target directory, fsync, then rename.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(format!(".{}.{n}.tmp", std::process::id()));
    let tmp = PathBuf::from(tmp_name);

    let write = || -> std::io::Result<()> {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        Ok(())
    };
    if let Err(e) = write() {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(&tmp)(e));
    }

    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        io_err(path)(e)
    })
}
