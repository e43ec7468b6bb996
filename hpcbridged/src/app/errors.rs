// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::fmt;

pub mod codes {
    pub const AUTHENTICATION_FAILURE: &str = "authentication_failure";
    pub const CONNECTION_FAILURE: &str = "connection_failure";
    pub const INVALID_ARGUMENT: &str = "invalid_argument";
    pub const NOT_FOUND: &str = "not_found";
    pub const CONFLICT: &str = "conflict";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const REMOTE_ERROR: &str = "remote_error";
    pub const LOCAL_ERROR: &str = "local_error";
    pub const TIMEOUT: &str = "timeout";
    pub const CONTROL_PLANE_ERROR: &str = "control_plane_error";
    pub const WORKING_DIRECTORY: &str = "unable_to_create_working_directory";
    pub const TRANSFER_FAILED: &str = "transfer_failed";
    pub const EXTRACTION_FAILED: &str = "extraction_failed";
    pub const ARCHIVE_CREATION_FAILED: &str = "archive_creation_failed";
    pub const UPLOAD_TO_CLOUD_FAILED: &str = "upload_to_cloud_failed";
    pub const BAD_SCHEDULER_RESPONSE: &str = "bad_scheduler_response";
    pub const MALFORMED_ACCOUNTING: &str = "malformed_accounting";
}

/// What went wrong. Transfer-related kinds carry the job-relative path they concern so
/// callers can react per file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppErrorKind {
    InvalidArgument,
    NotFound,
    Conflict,
    Internal,
    Remote,
    ControlPlane,
    UnableToCreateWorkingDirectory,
    TransferFailed { path: String },
    ExtractionFailed { path: String },
    ArchiveCreationFailed { path: String },
    UploadToCloudFailed { path: String },
    BadSchedulerResponse,
    MalformedAccounting,
}

#[derive(Debug, Clone)]
pub struct AppError {
    kind: AppErrorKind,
    code: &'static str,
    message: String,
    context: Option<String>,
}

impl AppError {
    pub fn new(kind: AppErrorKind, code: &'static str) -> Self {
        Self {
            kind,
            code,
            message: code.to_string(),
            context: None,
        }
    }

    pub fn with_message(
        kind: AppErrorKind,
        code: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::with_message(
            AppErrorKind::InvalidArgument,
            codes::INVALID_ARGUMENT,
            message,
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_message(AppErrorKind::Internal, codes::INTERNAL_ERROR, message)
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::with_message(AppErrorKind::Remote, codes::REMOTE_ERROR, message)
    }

    pub fn transfer_failed(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::with_message(
            AppErrorKind::TransferFailed { path: path.clone() },
            codes::TRANSFER_FAILED,
            format!("transfer of '{path}' failed"),
        )
    }

    pub fn extraction_failed(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::with_message(
            AppErrorKind::ExtractionFailed { path: path.clone() },
            codes::EXTRACTION_FAILED,
            format!("extraction of '{path}' failed"),
        )
    }

    pub fn archive_creation_failed(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::with_message(
            AppErrorKind::ArchiveCreationFailed { path: path.clone() },
            codes::ARCHIVE_CREATION_FAILED,
            format!("could not create archive of '{path}'"),
        )
    }

    pub fn upload_to_cloud_failed(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::with_message(
            AppErrorKind::UploadToCloudFailed { path: path.clone() },
            codes::UPLOAD_TO_CLOUD_FAILED,
            format!("upload of '{path}' to the control plane failed"),
        )
    }

    pub fn kind(&self) -> &AppErrorKind {
        &self.kind
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ctx) = &self.context {
            write!(f, "{} ({})", self.message, ctx)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_kinds_carry_the_relative_path() {
        let err = AppError::extraction_failed("inputs/data.zip");
        assert_eq!(
            err.kind(),
            &AppErrorKind::ExtractionFailed {
                path: "inputs/data.zip".to_string()
            }
        );
        assert_eq!(err.code(), codes::EXTRACTION_FAILED);
        assert!(err.message().contains("inputs/data.zip"));
    }

    #[test]
    fn display_appends_context() {
        let err = AppError::remote("sbatch failed").with_context("exit status 1");
        assert_eq!(err.to_string(), "sbatch failed (exit status 1)");
        assert_eq!(err.context(), Some("exit status 1"));
    }
}
