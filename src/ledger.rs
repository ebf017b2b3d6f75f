//! Per-worker record of URLs already written, and the append-only output file it is rebuilt from.
//!
//! The output file is the only durable state a fetch worker has. The ledger is never persisted
//! on its own: every start re-reads the file, so whatever made it to disk is skipped next time.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        LedgerError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One line of a worker's output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub url: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct UrlOnly {
    url: String,
}

/// URLs present in one worker's output file.
#[derive(Debug, Default)]
pub struct SeenUrlLedger {
    urls: HashSet<String>,
}

impl SeenUrlLedger {
    /// Scan `path` and collect every URL in it. A missing file is an empty ledger; lines that
    /// fail to parse (typically a write cut short by a crash) are skipped.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(LedgerError::io(path, e)),
        };

        let mut urls = HashSet::new();
        let mut skipped = 0usize;
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| LedgerError::io(path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<UrlOnly>(&line) {
                Ok(entry) => {
                    urls.insert(entry.url);
                }
                Err(_) => skipped += 1,
            }
        }

        if skipped > 0 {
            tracing::warn!(path = %path.display(), skipped, "skipped unreadable output lines");
        }
        tracing::info!(path = %path.display(), urls = urls.len(), "rebuilt seen-url ledger");

        Ok(Self { urls })
    }

    pub fn contains(&self, url: &str) -> bool {
        self.urls.contains(url)
    }

    /// Returns false if the URL was already present.
    pub fn insert(&mut self, url: &str) -> bool {
        self.urls.insert(url.to_string())
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

/// Append-only JSONL writer owned by exactly one worker.
#[derive(Debug)]
pub struct JsonlAppender {
    path: PathBuf,
    file: File,
}

impl JsonlAppender {
    /// Open (creating parents and the file as needed) for appending. If a previous run died
    /// mid-line, a newline is written first so the next record starts on its own line.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| LedgerError::io(parent, e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(|e| LedgerError::io(path, e))?;

        let len = file.metadata().map_err(|e| LedgerError::io(path, e))?.len();
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::Start(len - 1))
                .and_then(|_| file.read_exact(&mut last))
                .map_err(|e| LedgerError::io(path, e))?;
            if last[0] != b'\n' {
                file.write_all(b"\n").map_err(|e| LedgerError::io(path, e))?;
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one record as a single line and flush it.
    pub fn append(&mut self, record: &OutputRecord) -> Result<(), LedgerError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .and_then(|_| self.file.flush())
            .map_err(|e| LedgerError::io(&self.path, e))
    }
}

/// Ledger and appender together: the gate every successful fetch passes through.
#[derive(Debug)]
pub struct DedupOutput {
    ledger: SeenUrlLedger,
    writer: JsonlAppender,
}

impl DedupOutput {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LedgerError> {
        let ledger = SeenUrlLedger::load(&path)?;
        let writer = JsonlAppender::open(&path)?;
        Ok(Self { ledger, writer })
    }

    pub fn is_seen(&self, url: &str) -> bool {
        self.ledger.contains(url)
    }

    /// Append unless the URL is already recorded. Returns whether a line was written.
    pub fn write(&mut self, url: &str, content: String) -> Result<bool, LedgerError> {
        if self.ledger.contains(url) {
            return Ok(false);
        }
        self.writer.append(&OutputRecord {
            url: url.to_string(),
            content,
        })?;
        self.ledger.insert(url);
        Ok(true)
    }

    pub fn seen_count(&self) -> usize {
        self.ledger.len()
    }

    pub fn path(&self) -> &Path {
        self.writer.path()
    }
}
