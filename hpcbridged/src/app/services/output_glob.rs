// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use globset::{Glob, GlobBuilder, GlobMatcher};

use crate::app::errors::{AppError, AppResult};

/// Compiles an output-file pattern. `*` does not cross `/`; use `**` for that.
/// Patterns are interpreted relative to the job's `files/` directory.
pub fn compile_output_glob(pattern: &str) -> AppResult<GlobMatcher> {
    if pattern.trim().is_empty() {
        return Err(AppError::invalid_argument("empty output glob"));
    }
    if pattern.starts_with('/') {
        return Err(AppError::invalid_argument(format!(
            "output glob '{pattern}' must be relative"
        )));
    }
    if pattern.split('/').any(|part| part == "..") {
        return Err(AppError::invalid_argument(format!(
            "output glob '{pattern}' must not contain '..'"
        )));
    }
    let glob: Glob = GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|err| AppError::invalid_argument(format!("invalid output glob '{pattern}': {err}")))?;
    Ok(glob.compile_matcher())
}

/// Validates every pattern before any remote work starts.
pub fn validate_output_globs(patterns: &[String]) -> AppResult<()> {
    for pattern in patterns {
        compile_output_glob(pattern)?;
    }
    Ok(())
}
