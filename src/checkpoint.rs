//! Intermediate run state
//!
//! A small JSON file (`intermediate_fname`) mapping a run id to how far that run
//! got. The run id hashes everything that determines the output (strategy,
//! configuration, output path and the model files), so a rerun with the same
//! inputs finds its cursor and continues after the last flushed chunk instead of
//! starting over.

use crate::config::{GuessConfig, GuessStrategy};
use crate::{ALICEGuessError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Hash of the model files a run loads.
///
/// Each present file contributes its path and a hash of its contents; `None`
/// contributes nothing, so runs on an in-process oracle share fingerprint 0.
pub fn model_fingerprint(files: &[Option<&Path>]) -> Result<u64> {
    let mut parts = Vec::new();
    for path in files.iter().flatten() {
        let bytes = fs::read(path)?;
        parts.push((path.to_string_lossy().into_owned(), fxhash::hash64(&bytes)));
    }
    if parts.is_empty() {
        return Ok(0);
    }
    Ok(fxhash::hash64(&parts))
}

/// Identity of a run: hash of strategy, configuration, output path and model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(u64);

impl RunId {
    pub fn derive(
        strategy: &GuessStrategy,
        config: &GuessConfig,
        output: &Path,
        model: u64,
    ) -> Result<Self> {
        let config_json = serde_json::to_string(config)?;
        let key = (
            format!("{:?}", strategy),
            config_json,
            output.to_string_lossy().into_owned(),
            model,
        );
        Ok(Self(fxhash::hash64(&key)))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Progress of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCursor {
    /// Records known to be flushed to the output file
    pub records_written: u64,
    pub chunks_flushed: u64,
    /// Output file length matching `records_written`
    pub bytes_flushed: u64,
    pub finished: bool,
    /// RFC 3339
    pub updated_at: String,
}

impl RunCursor {
    /// Cursor stamped with the current time
    pub fn new(records_written: u64, chunks_flushed: u64, bytes_flushed: u64, finished: bool) -> Self {
        Self {
            records_written,
            chunks_flushed,
            bytes_flushed,
            finished,
            updated_at: chrono::Local::now().to_rfc3339(),
        }
    }
}

/// Run cursors, optionally backed by a file
#[derive(Debug, Default)]
pub struct IntermediateStore {
    path: Option<PathBuf>,
    runs: BTreeMap<String, RunCursor>,
}

impl IntermediateStore {
    /// Nothing is persisted
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load `path` if it exists, otherwise start empty
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let runs = if path.exists() {
            let text = fs::read_to_string(&path)?;
            if text.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&text)?
            }
        } else {
            BTreeMap::new()
        };
        log::debug!("Intermediate store {} holds {} runs", path.display(), runs.len());

        Ok(Self {
            path: Some(path),
            runs,
        })
    }

    /// `None` selects the in-memory store
    pub fn from_option(path: Option<PathBuf>) -> Result<Self> {
        match path {
            Some(path) => Self::open(path),
            None => Ok(Self::in_memory()),
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.path.is_some()
    }

    pub fn cursor(&self, id: &RunId) -> Option<&RunCursor> {
        self.runs.get(&id.to_string())
    }

    /// Cursor of an unfinished run, if there is one to continue
    pub fn resume_point(&self, id: &RunId) -> Option<&RunCursor> {
        self.cursor(id).filter(|c| !c.finished)
    }

    /// Record progress and persist it
    pub fn record(&mut self, id: &RunId, cursor: RunCursor) -> Result<()> {
        self.runs.insert(id.to_string(), cursor);
        self.save()
    }

    /// Forget a run
    pub fn clear(&mut self, id: &RunId) -> Result<()> {
        if self.runs.remove(&id.to_string()).is_some() {
            self.save()?;
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };

        let mut temp_file = NamedTempFile::new_in(parent)?;
        let json = serde_json::to_string_pretty(&self.runs)?;
        temp_file.write_all(json.as_bytes())?;
        temp_file.flush()?;
        temp_file
            .persist(path)
            .map_err(|e| ALICEGuessError::Io(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn strategy() -> GuessStrategy {
        GuessStrategy::Enumerate {
            threshold: 1e-5,
            budget: None,
            fork_length: None,
        }
    }

    #[test]
    fn test_run_id_depends_on_inputs() {
        let config = GuessConfig::default();
        let a = RunId::derive(&strategy(), &config, Path::new("out.tsv"), 0).unwrap();
        let b = RunId::derive(&strategy(), &config, Path::new("out.tsv"), 0).unwrap();
        assert_eq!(a, b);

        let c = RunId::derive(&strategy(), &config, Path::new("other.tsv"), 0).unwrap();
        assert_ne!(a, c);

        let tweaked = GuessConfig {
            max_len: 12,
            ..GuessConfig::default()
        };
        let d = RunId::derive(&strategy(), &tweaked, Path::new("out.tsv"), 0).unwrap();
        assert_ne!(a, d);

        let e = RunId::derive(&strategy(), &config, Path::new("out.tsv"), 42).unwrap();
        assert_ne!(a, e);

        assert_eq!(a.to_string().len(), 16);
    }

    #[test]
    fn test_model_fingerprint_follows_file_contents() {
        let dir = TempDir::new().unwrap();
        let arch = dir.path().join("arch.json");
        let weights = dir.path().join("weights.bin");
        fs::write(&arch, r#"{"order": 2}"#).unwrap();
        fs::write(&weights, [1u8, 2, 3, 4]).unwrap();

        assert_eq!(model_fingerprint(&[None, None]).unwrap(), 0);
        let first = model_fingerprint(&[Some(arch.as_path()), Some(weights.as_path())]).unwrap();
        assert_ne!(first, 0);
        assert_eq!(model_fingerprint(&[Some(arch.as_path()), Some(weights.as_path())]).unwrap(), first);

        // Retrained weights of the same size under the same path
        fs::write(&weights, [4u8, 3, 2, 1]).unwrap();
        let retrained = model_fingerprint(&[Some(arch.as_path()), Some(weights.as_path())]).unwrap();
        assert_ne!(first, retrained);

        let config = GuessConfig::default();
        let out = Path::new("out.tsv");
        assert_ne!(
            RunId::derive(&strategy(), &config, out, first).unwrap(),
            RunId::derive(&strategy(), &config, out, retrained).unwrap()
        );

        assert!(matches!(
            model_fingerprint(&[Some(dir.path().join("missing.bin").as_path())]),
            Err(ALICEGuessError::Io(_))
        ));
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let id = RunId(0xabc);

        let mut store = IntermediateStore::open(&path).unwrap();
        assert!(store.is_persistent());
        assert!(store.resume_point(&id).is_none());
        store.record(&id, RunCursor::new(2000, 2, 48_000, false)).unwrap();

        let reloaded = IntermediateStore::open(&path).unwrap();
        let cursor = reloaded.resume_point(&id).unwrap();
        assert_eq!(cursor.records_written, 2000);
        assert_eq!(cursor.chunks_flushed, 2);
        assert_eq!(cursor.bytes_flushed, 48_000);
        assert!(chrono::DateTime::parse_from_rfc3339(&cursor.updated_at).is_ok());
    }

    #[test]
    fn test_finished_run_is_not_resumed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let id = RunId(7);

        let mut store = IntermediateStore::open(&path).unwrap();
        store.record(&id, RunCursor::new(10, 1, 80, true)).unwrap();
        assert!(store.cursor(&id).is_some());
        assert!(store.resume_point(&id).is_none());

        store.clear(&id).unwrap();
        let reloaded = IntermediateStore::open(&path).unwrap();
        assert!(reloaded.cursor(&id).is_none());
    }

    #[test]
    fn test_in_memory_store_writes_nothing() {
        let mut store = IntermediateStore::from_option(None).unwrap();
        assert!(!store.is_persistent());
        store.record(&RunId(1), RunCursor::new(5, 1, 40, false)).unwrap();
        assert_eq!(store.resume_point(&RunId(1)).unwrap().records_written, 5);
    }

    #[test]
    fn test_cursor_without_byte_offset_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(
            &path,
            r#"{"0000000000000009": {"records_written": 3, "chunks_flushed": 1, "finished": false, "updated_at": "2026-01-01T00:00:00+00:00"}}"#,
        )
        .unwrap();
        assert!(matches!(
            IntermediateStore::open(&path),
            Err(ALICEGuessError::Json(_))
        ));
    }

    #[test]
    fn test_corrupt_store_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            IntermediateStore::open(&path),
            Err(ALICEGuessError::Json(_))
        ));
    }
}
