// Local workspace scanning with glob excludes

use glob::Pattern;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

use crate::errors::{OrchestratorError, OrchestratorResult};

/// A regular file found under the workspace root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    /// Path relative to the root, `/`-separated
    pub relative: String,
    pub path: PathBuf,
    pub size: u64,
    /// Seconds since the Unix epoch
    pub mtime: Option<u64>,
}

/// Compiled exclude patterns
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    patterns: Vec<Pattern>,
}

impl ExcludeSet {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> OrchestratorResult<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                let p = p.as_ref().trim_end_matches('/');
                Pattern::new(p).map_err(|e| {
                    OrchestratorError::InvalidConfig(format!("bad exclude pattern '{}': {}", p, e))
                })
            })
            .collect::<OrchestratorResult<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// A path is excluded when a pattern matches the whole relative path or
    /// any single component of it
    pub fn is_excluded(&self, relative: &str) -> bool {
        self.patterns.iter().any(|pattern| {
            pattern.matches(relative)
                || relative.split('/').any(|component| pattern.matches(component))
        })
    }
}

/// Walk `root` and return every non-excluded regular file, sorted by path
pub fn scan_workspace(root: &Path, excludes: &ExcludeSet) -> OrchestratorResult<Vec<LocalFile>> {
    if !root.is_dir() {
        return Err(OrchestratorError::Sync {
            path: root.display().to_string(),
            reason: "local workspace is not a directory".to_string(),
        });
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| {
            relative_path(root, entry.path())
                .map(|rel| rel.is_empty() || !excludes.is_excluded(&rel))
                .unwrap_or(false)
        });

    for entry in walker {
        let entry = entry.map_err(|e| OrchestratorError::Sync {
            path: e
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| root.display().to_string()),
            reason: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(relative) = relative_path(root, entry.path()) else {
            continue;
        };
        let metadata = entry.metadata().map_err(|e| OrchestratorError::Sync {
            path: relative.clone(),
            reason: e.to_string(),
        })?;
        files.push(LocalFile {
            relative,
            path: entry.path().to_path_buf(),
            size: metadata.len(),
            mtime: metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs()),
        });
    }

    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(files)
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// Hex SHA-256 of a local file
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scan_skips_excluded_dirs_and_files() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("data/nested")).unwrap();
        fs::create_dir_all(root.join(".git/objects")).unwrap();
        fs::create_dir_all(root.join("src/__pycache__")).unwrap();
        fs::write(root.join("train.py"), "print('hi')").unwrap();
        fs::write(root.join("data/nested/a.jsonl"), "{}").unwrap();
        fs::write(root.join(".git/objects/x"), "blob").unwrap();
        fs::write(root.join("src/__pycache__/m.cpython-311.pyc"), "bytecode").unwrap();
        fs::write(root.join("src/model.pyc"), "bytecode").unwrap();

        let excludes = ExcludeSet::new(&[".git", "__pycache__", "*.pyc"]).unwrap();
        let files = scan_workspace(root, &excludes).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.relative.as_str()).collect();
        assert_eq!(names, vec!["data/nested/a.jsonl", "train.py"]);
        assert_eq!(files[1].size, 11);
    }

    #[test]
    fn test_bad_pattern_is_invalid_config() {
        assert!(matches!(
            ExcludeSet::new(&["[unclosed"]),
            Err(OrchestratorError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_sha256_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, "abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
