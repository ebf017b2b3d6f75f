//! Merge every worker output file in a directory into one file with unique URLs.

use crate::ledger::{JsonlAppender, LedgerError, OutputRecord};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Counts reported by a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub files: usize,
    pub unique_records: usize,
    pub duplicates: usize,
    pub unreadable: usize,
}

/// All `*.jsonl` files directly under `data_dir`, sorted by name, excluding `exclude`.
fn input_files(data_dir: &Path, exclude: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(data_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        if path == exclude || same_file(&path, exclude) {
            continue;
        }
        files.push(path);
    }
    files.sort();
    Ok(files)
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Write the first occurrence of every URL found in `data_dir/*.jsonl` to `output`.
///
/// `output` is truncated first. It may live inside `data_dir`; it is never read as an input.
#[tracing::instrument(fields(data_dir = %data_dir.as_ref().display(), output = %output.as_ref().display()), skip(data_dir, output))]
pub fn merge_outputs<P: AsRef<Path>, Q: AsRef<Path>>(
    data_dir: P,
    output: Q,
) -> Result<MergeReport, LedgerError> {
    let data_dir = data_dir.as_ref();
    let output = output.as_ref();

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| LedgerError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    File::create(output).map_err(|source| LedgerError::Io {
        path: output.to_path_buf(),
        source,
    })?;

    let files = input_files(data_dir, output).map_err(|source| LedgerError::Io {
        path: data_dir.to_path_buf(),
        source,
    })?;

    let mut writer = JsonlAppender::open(output)?;
    let mut seen: HashSet<String> = HashSet::new();
    let mut report = MergeReport {
        files: files.len(),
        ..MergeReport::default()
    };

    for path in &files {
        let file = File::open(path).map_err(|source| LedgerError::Io {
            path: path.clone(),
            source,
        })?;

        for line in BufReader::new(file).lines() {
            let line = line.map_err(|source| LedgerError::Io {
                path: path.clone(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }

            let record: OutputRecord = match serde_json::from_str(&line) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "skipping unreadable line");
                    report.unreadable += 1;
                    continue;
                }
            };

            if seen.contains(&record.url) {
                report.duplicates += 1;
                continue;
            }
            writer.append(&record)?;
            seen.insert(record.url);
            report.unique_records += 1;
        }
    }

    tracing::info!(
        files = report.files,
        unique = report.unique_records,
        duplicates = report.duplicates,
        "merged worker outputs"
    );
    Ok(report)
}
