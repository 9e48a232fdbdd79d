//! Change detection: scanning roots, fingerprinting content, and
//! classifying sources against the manifest.
//!
//! Fingerprints hash file bytes, never timestamps, so a touched-but-unchanged
//! file stays unchanged and clock skew cannot fake a change.

use anyhow::Result;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::IndexConfig;
use crate::models::{DocumentSource, ManifestEntry, PathError, PathErrorKind};
use crate::readers::extension_of;

/// sha256 hex of `bytes`.
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Result of one pass over the roots.
#[derive(Debug, Default)]
pub struct ScanReport {
    /// Readable sources, sorted by path.
    pub sources: Vec<DocumentSource>,
    /// Paths that exist but could not be fingerprinted or walked. A
    /// directory here covers everything below it.
    pub unreadable: Vec<String>,
    /// Roots that do not exist on disk.
    pub missing_roots: Vec<String>,
    pub errors: Vec<PathError>,
}

impl ScanReport {
    /// Paths whose manifest entries must survive this scan even though
    /// no source was produced for them.
    pub fn protected(&self, path: &str) -> bool {
        let path = Path::new(path);
        self.unreadable
            .iter()
            .chain(&self.missing_roots)
            .any(|p| path.starts_with(p))
    }
}

/// Outcome of comparing a scan to the manifest.
#[derive(Debug, Default)]
pub struct Classification {
    pub new: Vec<DocumentSource>,
    pub changed: Vec<DocumentSource>,
    pub unchanged: Vec<DocumentSource>,
    /// Manifest paths absent from the scan, sorted.
    pub deleted: Vec<String>,
}

/// Classify `sources` against `manifest`.
///
/// `manifest` must already be limited to the paths this scan is responsible
/// for; every entry without a matching source is reported as deleted.
pub fn classify(
    sources: &[DocumentSource],
    manifest: &HashMap<String, ManifestEntry>,
) -> Classification {
    let mut out = Classification::default();
    let mut seen: HashSet<&str> = HashSet::with_capacity(sources.len());

    for source in sources {
        seen.insert(source.path.as_str());
        match manifest.get(&source.path) {
            None => out.new.push(source.clone()),
            Some(entry) if entry.fingerprint != source.fingerprint => {
                out.changed.push(source.clone())
            }
            Some(_) => out.unchanged.push(source.clone()),
        }
    }

    out.deleted = manifest
        .keys()
        .filter(|path| !seen.contains(path.as_str()))
        .cloned()
        .collect();
    out.deleted.sort();
    out
}

/// Make `path` absolute, resolving symlinks and `..` when it exists.
pub fn normalize_root(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    std::fs::canonicalize(&absolute).unwrap_or(absolute)
}

/// True when `path` lies at or below any of `roots`.
pub fn is_under(path: &str, roots: &[PathBuf]) -> bool {
    let path = Path::new(path);
    roots.iter().any(|root| path.starts_with(root))
}

/// True when two root sets share any subtree.
pub fn roots_overlap(a: &[PathBuf], b: &[PathBuf]) -> bool {
    a.iter()
        .any(|x| b.iter().any(|y| x.starts_with(y) || y.starts_with(x)))
}

/// Walk `roots` (already normalized) and fingerprint every eligible file.
///
/// A root that is itself a file is scanned as a single source. Blocking;
/// call from `spawn_blocking` in async contexts.
pub fn scan_roots(roots: &[PathBuf], config: &IndexConfig) -> Result<ScanReport> {
    let mut excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    excludes.extend(config.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;
    let allowed: HashSet<String> = config
        .extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
        .collect();

    let mut report = ScanReport::default();
    let mut seen = HashSet::new();

    for root in roots {
        if !root.exists() {
            tracing::warn!(root = %root.display(), "index root does not exist");
            report.missing_roots.push(root.display().to_string());
            report.errors.push(PathError {
                path: root.display().to_string(),
                kind: PathErrorKind::MissingRoot,
                message: "root does not exist".to_string(),
            });
            continue;
        }

        for entry in WalkDir::new(root).follow_links(config.follow_symlinks) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e
                        .path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| root.display().to_string());
                    tracing::warn!(path = %path, error = %e, "could not walk path");
                    report.unreadable.push(path.clone());
                    report.errors.push(PathError {
                        path,
                        kind: PathErrorKind::Read,
                        message: e.to_string(),
                    });
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            if exclude_set.is_match(relative) {
                continue;
            }
            let ext = extension_of(path);
            if !allowed.contains(&ext) {
                continue;
            }
            let key = path.display().to_string();
            if !seen.insert(key.clone()) {
                continue;
            }

            match fingerprint_file(path, &ext, config.max_file_bytes) {
                Ok(source) => report.sources.push(source),
                Err(error) => {
                    report.unreadable.push(key);
                    report.errors.push(error);
                }
            }
        }
    }

    // Sort for deterministic ordering
    report.sources.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(report)
}

fn fingerprint_file(path: &Path, ext: &str, max_bytes: u64) -> Result<DocumentSource, PathError> {
    let key = path.display().to_string();
    let read_error = |e: std::io::Error| PathError {
        path: key.clone(),
        kind: PathErrorKind::Read,
        message: e.to_string(),
    };

    let metadata = std::fs::metadata(path).map_err(read_error)?;
    if metadata.len() > max_bytes {
        return Err(PathError {
            path: key.clone(),
            kind: PathErrorKind::TooLarge,
            message: format!("{} bytes exceeds limit of {}", metadata.len(), max_bytes),
        });
    }
    let bytes = std::fs::read(path).map_err(read_error)?;
    let modified: DateTime<Utc> = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_default();

    Ok(DocumentSource {
        path: key.clone(),
        modified,
        size: metadata.len(),
        fingerprint: fingerprint_bytes(&bytes),
        ext: ext.to_string(),
    })
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
