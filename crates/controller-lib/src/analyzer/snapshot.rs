//! Read-only folder snapshots
//!
//! A snapshot is the complete input of an analysis: every relative file
//! path under the folder plus the content of the small set of manifest and
//! config files the detector reads.

use super::detector::is_manifest;
use crate::error::{ControlError, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Directories that never contain deployable sources of their own
const SKIPPED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    "node_modules",
    "target",
    "vendor",
    "__pycache__",
    ".venv",
    "venv",
    "dist",
    "build",
    "_build",
    "deps",
    ".next",
];

/// Config files read for service references and database hints
const CONFIG_FILES: &[&str] = &[
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yml",
    "compose.yaml",
    ".env",
    ".env.example",
    "tsconfig.json",
];

/// Larger files are listed but not captured
const MAX_CAPTURED_BYTES: u64 = 256 * 1024;

/// Immutable listing of a folder plus captured manifest contents
#[derive(Debug, Clone, Default)]
pub struct FolderSnapshot {
    root: PathBuf,
    files: Vec<String>,
    contents: BTreeMap<String, String>,
}

impl FolderSnapshot {
    /// Walk `root` and capture manifests; any unreadable entry fails the scan
    pub fn scan(root: &Path) -> Result<Self> {
        let meta = std::fs::metadata(root).map_err(|e| ControlError::scan(root, e))?;
        if !meta.is_dir() {
            return Err(ControlError::scan(root, "not a directory"));
        }

        let mut files = Vec::new();
        let mut contents = BTreeMap::new();

        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                !(e.depth() > 0
                    && e.file_type().is_dir()
                    && SKIPPED_DIRS.iter().any(|d| e.file_name() == *d))
            });

        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| root.to_path_buf());
                ControlError::scan(path, e)
            })?;

            if !entry.file_type().is_file() {
                continue;
            }

            let relative = relative_path(root, entry.path());
            if is_captured(&relative) {
                let len = entry
                    .metadata()
                    .map_err(|e| ControlError::scan(entry.path(), e))?
                    .len();
                if len <= MAX_CAPTURED_BYTES {
                    let bytes =
                        std::fs::read(entry.path()).map_err(|e| ControlError::scan(entry.path(), e))?;
                    contents.insert(relative.clone(), String::from_utf8_lossy(&bytes).into_owned());
                }
            }
            files.push(relative);
        }

        files.sort();
        debug!(
            root = %root.display(),
            files = files.len(),
            captured = contents.len(),
            "Folder scanned"
        );

        Ok(Self {
            root: root.to_path_buf(),
            files,
            contents,
        })
    }

    /// Build a snapshot from an in-memory listing
    pub fn from_files<I, P>(root: impl Into<PathBuf>, files: I) -> Self
    where
        I: IntoIterator<Item = (P, Option<String>)>,
        P: Into<String>,
    {
        let mut listing = Vec::new();
        let mut contents = BTreeMap::new();
        for (path, content) in files {
            let path = path.into();
            if let Some(content) = content {
                contents.insert(path.clone(), content);
            }
            listing.push(path);
        }
        listing.sort();
        listing.dedup();
        Self {
            root: root.into(),
            files: listing,
            contents,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Folder name of the root, used to name a root-level service
    pub fn root_name(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn content(&self, path: &str) -> Option<&str> {
        self.contents.get(path).map(String::as_str)
    }

    /// Captured files directly or transitively under `dir`
    pub fn captured_under<'a>(&'a self, dir: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.contents
            .iter()
            .filter(move |(path, _)| is_under(path, dir))
            .map(|(p, c)| (p.as_str(), c.as_str()))
    }

    /// SHA-256 over the listing and captured contents
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for file in &self.files {
            hasher.update(file.as_bytes());
            hasher.update(b"\n");
        }
        for (path, content) in &self.contents {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(content.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}

/// Whether `path` lies under the relative directory `dir` ("." is the root)
pub fn is_under(path: &str, dir: &str) -> bool {
    dir == "." || path.strip_prefix(dir).map_or(false, |rest| rest.starts_with('/'))
}

/// Directory part of a relative path ("." for top-level files)
pub fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => ".",
    }
}

/// Final component of a relative path
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn is_captured(relative: &str) -> bool {
    let name = file_name(relative);
    if is_manifest(name) || CONFIG_FILES.contains(&name) {
        return true;
    }
    let in_config_dir = parent_dir(relative)
        .split('/')
        .any(|component| component == "config");
    in_config_dir
        && [".yml", ".yaml", ".json", ".toml", ".env"]
            .iter()
            .any(|ext| name.ends_with(ext))
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scan_captures_manifests_and_skips_dependencies() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::write(root.join("package.json"), r#"{"name":"web"}"#).unwrap();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("src/index.js"), "console.log(1)").unwrap();
        std::fs::create_dir_all(root.join("node_modules/express")).unwrap();
        std::fs::write(root.join("node_modules/express/package.json"), "{}").unwrap();

        let snapshot = FolderSnapshot::scan(root).unwrap();

        assert_eq!(snapshot.files(), &["package.json", "src/index.js"]);
        assert_eq!(snapshot.content("package.json"), Some(r#"{"name":"web"}"#));
        assert!(snapshot.content("src/index.js").is_none());
    }

    #[test]
    fn test_scan_missing_folder_reports_path() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");

        match FolderSnapshot::scan(&missing) {
            Err(ControlError::Scan { path, .. }) => assert_eq!(path, missing),
            other => panic!("expected scan error, got {:?}", other.map(|s| s.files().len())),
        }
    }

    #[test]
    fn test_digest_changes_with_content() {
        let a = FolderSnapshot::from_files("/w", [("go.mod", Some("module a".to_string()))]);
        let b = FolderSnapshot::from_files("/w", [("go.mod", Some("module b".to_string()))]);
        let a2 = FolderSnapshot::from_files("/w", [("go.mod", Some("module a".to_string()))]);

        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.digest(), a2.digest());
    }

    #[test]
    fn test_path_helpers() {
        assert!(is_under("api/src/main.rs", "api"));
        assert!(!is_under("apigw/main.go", "api"));
        assert!(is_under("anything", "."));
        assert_eq!(parent_dir("api/package.json"), "api");
        assert_eq!(parent_dir("package.json"), ".");
        assert_eq!(file_name("a/b/Dockerfile"), "Dockerfile");
        assert!(is_captured("config/settings.yaml"));
        assert!(!is_captured("src/settings.yaml"));
    }
}
