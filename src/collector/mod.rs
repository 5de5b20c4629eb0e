use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Descriptor of one candidate file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileMeta {
    /// Resolved absolute path; the file's identity
    pub path: PathBuf,
    /// Path relative to the scanned folder, used for reporting and indexing
    pub relative_path: String,
    /// Size in bytes
    pub size: u64,
    /// Last modification time
    pub mtime: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Walks target folders and produces an ordered sequence of file
/// descriptors.
///
/// Include/exclude filters are plain substring matches against the
/// relative path: a file passes when it matches at least one include
/// (if any are configured) and no exclude.
#[derive(Debug, Clone, Default)]
pub struct FileCollector {
    folders: Vec<PathBuf>,
    include: Vec<String>,
    exclude: Vec<String>,
}

impl FileCollector {
    pub fn new(folders: Vec<PathBuf>) -> Self {
        Self {
            folders,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }

    pub fn with_include(mut self, include: Vec<String>) -> Self {
        self.include = include;
        self
    }

    pub fn with_exclude(mut self, exclude: Vec<String>) -> Self {
        self.exclude = exclude;
        self
    }

    /// Walk all folders recursively, depth-first with entries sorted by
    /// name, and return the matching files in discovery order.
    pub fn collect(&self) -> Result<Vec<FileMeta>, CollectorError> {
        let mut files = Vec::new();
        for folder in &self.folders {
            self.walk(folder, folder, &mut files)?;
        }
        Ok(files)
    }

    fn walk(
        &self,
        root: &Path,
        dir: &Path,
        files: &mut Vec<FileMeta>,
    ) -> Result<(), CollectorError> {
        let entries = fs::read_dir(dir).map_err(|source| CollectorError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| CollectorError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            paths.push(entry.path());
        }
        paths.sort();

        for path in paths {
            if path.is_dir() {
                self.walk(root, &path, files)?;
                continue;
            }
            let relative_path = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .to_string();
            if !self.matches(&relative_path) {
                continue;
            }
            let metadata = match fs::metadata(&path) {
                Ok(metadata) => metadata,
                Err(e) => {
                    // File may have vanished between listing and stat
                    warn!("Skipping unreadable file {}: {}", path.display(), e);
                    continue;
                }
            };
            let mtime = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            files.push(FileMeta {
                path,
                relative_path,
                size: metadata.len(),
                mtime,
            });
        }
        Ok(())
    }

    fn matches(&self, relative_path: &str) -> bool {
        if !self.include.is_empty() && !self.include.iter().any(|p| relative_path.contains(p)) {
            return false;
        }
        !self.exclude.iter().any(|p| relative_path.contains(p))
    }
}
