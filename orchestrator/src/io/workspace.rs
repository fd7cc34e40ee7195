//! Per-project generated workspace. Every access goes through a relative path.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::debug;
use walkdir::WalkDir;

use crate::core::contract::Baseline;
use crate::core::files::check_relative_path;
use crate::core::imports::{is_manifest, manifest_dependencies};
use crate::core::types::FileSpec;
use crate::io::atomic::write_atomic;

/// Directories never listed (tool caches, installed packages, VCS data).
const IGNORED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "__pycache__",
    ".venv",
    "venv",
    ".pytest_cache",
    "dist",
    "build",
];

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path for a workspace-relative path; rejects escapes.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let normalized =
            check_relative_path(relative).map_err(|err| anyhow!("workspace path: {err}"))?;
        Ok(self.root.join(normalized))
    }

    /// Sorted relative paths of every file in the workspace.
    pub fn list_files(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                !(entry.file_type().is_dir()
                    && IGNORED_DIRS.contains(&entry.file_name().to_string_lossy().as_ref()))
            });
        for entry in walker {
            let entry = entry.with_context(|| format!("walk {}", self.root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .with_context(|| format!("strip prefix {}", self.root.display()))?;
            files.push(relative.to_string_lossy().replace('\\', "/"));
        }
        files.sort();
        Ok(files)
    }

    /// Text content of a file, `None` when it is missing or not UTF-8.
    pub fn read_file(&self, relative: &str) -> Result<Option<String>> {
        let path = self.resolve(relative)?;
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        Ok(String::from_utf8(bytes).ok())
    }

    /// Read the given paths, skipping ones that do not exist yet.
    pub fn read_files<'a, I>(&self, paths: I) -> Result<Vec<FileSpec>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut out = Vec::new();
        for path in paths {
            if let Some(content) = self.read_file(path)? {
                out.push(FileSpec::new(path, content));
            }
        }
        Ok(out)
    }

    /// Write files after checking every path, so a bad path writes nothing.
    pub fn write_files(&self, files: &[FileSpec]) -> Result<Vec<String>> {
        let mut targets = Vec::with_capacity(files.len());
        for file in files {
            let normalized = check_relative_path(&file.path)
                .map_err(|err| anyhow!("workspace path: {err}"))?;
            targets.push((normalized, file));
        }
        let mut written = Vec::with_capacity(targets.len());
        for (relative, file) in targets {
            let path = self.root.join(&relative);
            write_atomic(&path, &file.content)?;
            debug!(path = %relative, bytes = file.content.len(), "wrote workspace file");
            written.push(relative);
        }
        Ok(written)
    }

    /// Existing files plus the dependencies their manifests declare.
    pub fn baseline(&self) -> Result<Baseline> {
        let files: BTreeSet<String> = self.list_files()?.into_iter().collect();
        let mut dependencies = BTreeSet::new();
        for path in files.iter().filter(|path| is_manifest(path)) {
            let Some(content) = self.read_file(path)? else {
                continue;
            };
            if let Some(deps) = manifest_dependencies(path, &content) {
                dependencies.extend(deps);
            }
        }
        Ok(Baseline {
            files,
            dependencies,
        })
    }
}
