//! Corpus scanner.
//!
//! Walks the corpus root and classifies every supported file against the
//! persisted [`SyncState`]:
//!
//! - **new**: no entry for the path
//! - **changed**: fingerprint differs, or the entry is marked incomplete
//! - **unchanged**: same fingerprint and a complete entry (an mtime change
//!   alone does not count)
//! - **removed**: entry exists but the file is gone
//!
//! Unsupported extensions are counted as skipped. Unreadable files,
//! unreadable directories and symlink loops become [`ScanWarning`]s; the
//! scan carries on and never reports paths below an unreadable location as
//! removed.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Component, Path};
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use walkdir::{DirEntry, WalkDir};

use crate::config::CorpusConfig;
use crate::models::{Document, DocumentFormat};
use crate::state::SyncState;

const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/node_modules/**", "**/target/**"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanWarning {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFile {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Default, Clone)]
pub struct ScanReport {
    pub new: Vec<Document>,
    pub changed: Vec<Document>,
    pub unchanged: Vec<Document>,
    /// Paths present in the sync state but no longer on disk.
    pub removed: Vec<String>,
    pub skipped: Vec<SkippedFile>,
    pub warnings: Vec<ScanWarning>,
}

impl ScanReport {
    /// Documents that need (re)indexing, new first.
    pub fn pending(&self) -> impl Iterator<Item = &Document> {
        self.new.iter().chain(self.changed.iter())
    }

    pub fn has_changes(&self) -> bool {
        !self.new.is_empty() || !self.changed.is_empty() || !self.removed.is_empty()
    }
}

pub fn scan_corpus(config: &CorpusConfig, state: &SyncState) -> Result<ScanReport> {
    let root = &config.root;
    if !root.is_dir() {
        bail!("Corpus root does not exist or is not a directory: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;
    let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    excludes.extend(config.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut report = ScanReport::default();
    let mut seen: HashSet<String> = HashSet::new();
    // Relative prefixes whose contents could not be listed.
    let mut unreadable: Vec<String> = Vec::new();

    let include_hidden = config.include_hidden;
    let walker = WalkDir::new(root)
        .follow_links(config.follow_symlinks)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || include_hidden || !is_hidden(e));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let rel = err
                    .path()
                    .map(|p| relative_path(root, p))
                    .unwrap_or_default();
                let message = if err.loop_ancestor().is_some() {
                    "symlink loop detected".to_string()
                } else {
                    err.to_string()
                };
                tracing::warn!(path = %rel, %message, "scan warning");
                unreadable.push(rel.clone());
                report.warnings.push(ScanWarning { path: rel, message });
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let rel = relative_path(root, entry.path());
        if exclude_set.is_match(&rel) || !include_set.is_match(&rel) {
            continue;
        }

        let Some(format) = DocumentFormat::from_path(entry.path()) else {
            report.skipped.push(SkippedFile {
                path: rel,
                reason: "unsupported format".to_string(),
            });
            continue;
        };

        seen.insert(rel.clone());
        let doc = match describe(entry.path(), &rel, format) {
            Ok(doc) => doc,
            Err(err) => {
                let message = format!("{:#}", err);
                tracing::warn!(path = %rel, %message, "unreadable file");
                report.warnings.push(ScanWarning { path: rel, message });
                continue;
            }
        };

        match state.get(&doc.path) {
            None => report.new.push(doc),
            Some(entry) if !entry.complete || entry.fingerprint != doc.fingerprint => {
                report.changed.push(doc)
            }
            Some(_) => report.unchanged.push(doc),
        }
    }

    for entry in state.entries() {
        if seen.contains(&entry.path) {
            continue;
        }
        if unreadable.iter().any(|prefix| is_under(&entry.path, prefix)) {
            continue;
        }
        report.removed.push(entry.path.clone());
    }

    report.new.sort_by(|a, b| a.path.cmp(&b.path));
    report.changed.sort_by(|a, b| a.path.cmp(&b.path));
    report.unchanged.sort_by(|a, b| a.path.cmp(&b.path));
    report.removed.sort();

    Ok(report)
}

fn describe(path: &Path, rel: &str, format: DocumentFormat) -> Result<Document> {
    let metadata = std::fs::metadata(path)?;
    let mtime = metadata
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;

    Ok(Document {
        path: rel.to_string(),
        abs_path: path.to_path_buf(),
        fingerprint: fingerprint_file(path)?,
        mtime,
        size: metadata.len(),
        format,
    })
}

/// Lowercase hex SHA-256 of the file's bytes, streamed.
pub fn fingerprint_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(hex::encode(hasher.finalize()))
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

/// `/`-separated path of `path` relative to `root`.
fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn is_under(path: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || path == prefix
        || (path.starts_with(prefix) && path[prefix.len()..].starts_with('/'))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}
