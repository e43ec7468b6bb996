// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::{Component, Path, PathBuf};

use crate::app::errors::{AppError, AppResult};

pub const SCRIPT_FILE_NAME: &str = "sbatch.sh";
pub const FILES_DIR_NAME: &str = "files";
pub const STDOUT_FILE_NAME: &str = "stdout.txt";
pub const STDERR_FILE_NAME: &str = "stderr.txt";

/// Per-job directory layout on the cluster:
/// `<root>/<system_id>/sbatch.sh` and `<root>/<system_id>/files/...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLayout {
    root: String,
}

impl JobLayout {
    pub fn new(root: impl Into<String>) -> Self {
        let root = root.into();
        let trimmed = root.trim_end_matches('/');
        let root = if trimmed.is_empty() {
            "/".to_string()
        } else {
            trimmed.to_string()
        };
        Self { root }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// `<root>/<system_id>`. Ids that are not a single plain path component are refused.
    pub fn job_dir(&self, system_id: &str) -> AppResult<String> {
        validate_system_id(system_id)?;
        Ok(join(&self.root, system_id))
    }

    pub fn files_dir(&self, system_id: &str) -> AppResult<String> {
        Ok(join(&self.job_dir(system_id)?, FILES_DIR_NAME))
    }

    pub fn script_path(&self, system_id: &str) -> AppResult<String> {
        Ok(join(&self.job_dir(system_id)?, SCRIPT_FILE_NAME))
    }

    pub fn stdout_path(&self, system_id: &str) -> AppResult<String> {
        Ok(join(&self.files_dir(system_id)?, STDOUT_FILE_NAME))
    }

    pub fn stderr_path(&self, system_id: &str) -> AppResult<String> {
        Ok(join(&self.files_dir(system_id)?, STDERR_FILE_NAME))
    }

    /// Absolute destination for a caller-supplied path relative to `files/`.
    /// Paths that normalize to `files/` itself or anything outside it are rejected.
    pub fn file_in_job(&self, system_id: &str, relative_path: &str) -> AppResult<String> {
        let files = self.files_dir(system_id)?;
        contained_path(&files, relative_path)
    }
}

fn join(base: &str, child: &str) -> String {
    if base.ends_with('/') {
        format!("{base}{child}")
    } else {
        format!("{base}/{child}")
    }
}

fn validate_system_id(system_id: &str) -> AppResult<()> {
    // also becomes the `#SBATCH --job-name` value, which sbatch splits on whitespace
    let bad = system_id.is_empty()
        || system_id == "."
        || system_id == ".."
        || !system_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if bad {
        return Err(AppError::invalid_argument(format!(
            "system id '{}' cannot be used as a directory name",
            system_id.escape_debug()
        )));
    }
    Ok(())
}

/// Joins `relative_path` under `base` and checks the normalized result stays strictly
/// inside `base`.
pub fn contained_path(base: &str, relative_path: &str) -> AppResult<String> {
    if relative_path.contains('\0') {
        return Err(AppError::invalid_argument("relative path contains NUL"));
    }
    let rel = Path::new(relative_path);
    if rel.is_absolute() {
        return Err(AppError::invalid_argument(format!(
            "path '{relative_path}' must be relative"
        )));
    }
    let base_norm = normalize_path(base);
    let joined = normalize_path(base_norm.join(rel));
    if joined == base_norm || !joined.starts_with(&base_norm) {
        return Err(AppError::invalid_argument(format!(
            "path '{relative_path}' escapes the job directory"
        )));
    }
    Ok(joined.to_string_lossy().into_owned())
}

/// True when `candidate` is strictly below `base`, compared component-wise after
/// syntactic normalization.
pub fn is_strictly_within(base: &str, candidate: &str) -> bool {
    let base = normalize_path(base);
    let candidate = normalize_path(candidate);
    candidate != base && candidate.starts_with(&base)
}

/// Path of `path` relative to `base`, for reporting to the control plane.
pub fn relative_to(base: &str, path: &str) -> Option<String> {
    let base = normalize_path(base);
    let path = normalize_path(path);
    path.strip_prefix(&base)
        .ok()
        .map(|p| p.to_string_lossy().into_owned())
        .filter(|p| !p.is_empty())
}

/// Normalize a path syntactically
/// - remove `.`
/// - resolve .. where possible
/// - keeps an absolute root if present
pub fn normalize_path(p: impl AsRef<Path>) -> PathBuf {
    let mut out = PathBuf::new();
    let mut comps = p.as_ref().components().peekable();
    while let Some(c) = comps.peek() {
        match c {
            Component::Prefix(prefix) => {
                out.push(Path::new(prefix.as_os_str()));
                comps.next();
            }
            Component::RootDir => {
                out.push(Path::new(std::path::MAIN_SEPARATOR_STR));
                comps.next();
            }
            _ => break,
        }
    }
    let anchored = out.has_root();

    for comp in comps {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                let last_is_normal = matches!(out.components().next_back(), Some(Component::Normal(_)));
                if last_is_normal {
                    out.pop();
                } else if !anchored {
                    // relative paths keep leading `..`; `/..` is `/`
                    out.push("..");
                }
            }
            Component::Normal(seg) => out.push(seg),
            Component::Prefix(_) | Component::RootDir => {}
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> JobLayout {
        JobLayout::new("/scratch/hpc/")
    }

    #[test]
    fn layout_paths() {
        let l = layout();
        assert_eq!(l.job_dir("job-42").unwrap(), "/scratch/hpc/job-42");
        assert_eq!(l.files_dir("job-42").unwrap(), "/scratch/hpc/job-42/files");
        assert_eq!(l.script_path("job-42").unwrap(), "/scratch/hpc/job-42/sbatch.sh");
        assert_eq!(
            l.stdout_path("job-42").unwrap(),
            "/scratch/hpc/job-42/files/stdout.txt"
        );
        assert_eq!(
            l.stderr_path("job-42").unwrap(),
            "/scratch/hpc/job-42/files/stderr.txt"
        );
    }

    #[test]
    fn system_ids_must_be_plain_components() {
        let l = layout();
        for id in [
            "",
            ".",
            "..",
            "a/b",
            "a\nb",
            "job-1 --qos=high --exclusive",
            "job\t1",
            "it's",
            "a\\b",
        ] {
            assert!(l.job_dir(id).is_err(), "{id:?} should be rejected");
        }
    }

    #[test]
    fn file_in_job_stays_under_files() {
        let l = layout();
        assert_eq!(
            l.file_in_job("j", "in/data.csv").unwrap(),
            "/scratch/hpc/j/files/in/data.csv"
        );
        assert_eq!(
            l.file_in_job("j", "./a/../b.txt").unwrap(),
            "/scratch/hpc/j/files/b.txt"
        );
        for rel in ["../sbatch.sh", "a/../../x", "/etc/passwd", ".", ""] {
            assert!(l.file_in_job("j", rel).is_err(), "{rel:?} should be rejected");
        }
    }

    #[test]
    fn strict_containment() {
        assert!(is_strictly_within("/r/j/files", "/r/j/files/out.txt"));
        assert!(is_strictly_within("/r/j/files/", "/r/j/files/a/b"));
        assert!(!is_strictly_within("/r/j/files", "/r/j/files"));
        assert!(!is_strictly_within("/r/j/files", "/r/j/files-evil/x"));
        assert!(!is_strictly_within("/r/j/files", "/etc/passwd"));
        assert!(!is_strictly_within("/r/j/files", "/r/j/files/../sbatch.sh"));
    }

    #[test]
    fn relative_to_strips_base() {
        assert_eq!(
            relative_to("/r/j/files", "/r/j/files/sub/o.txt").as_deref(),
            Some("sub/o.txt")
        );
        assert_eq!(relative_to("/r/j/files", "/r/j/files"), None);
        assert_eq!(relative_to("/r/j/files", "/other"), None);
    }

    #[test]
    fn normalize_keeps_leading_parent_on_relative_paths() {
        assert_eq!(normalize_path("../a/./b/.."), PathBuf::from("../a"));
        assert_eq!(normalize_path("/../a"), PathBuf::from("/a"));
    }
}
