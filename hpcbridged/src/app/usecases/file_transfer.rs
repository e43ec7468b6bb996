// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use tokio::io::AsyncRead;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{ControlPlanePort, SessionPoolPort};
use crate::app::services::output_glob::validate_output_globs;
use crate::app::services::remote_path::{JobLayout, is_strictly_within, relative_to};
use crate::app::types::{ArchiveKind, Job};

const UPLOAD_MODE: u32 = 0o600;

/// Moves job inputs onto the cluster and job outputs back to the control plane.
pub struct FileTransferService {
    pool: Arc<dyn SessionPoolPort>,
    control_plane: Arc<dyn ControlPlanePort>,
    layout: JobLayout,
}

impl FileTransferService {
    pub fn new(
        pool: Arc<dyn SessionPoolPort>,
        control_plane: Arc<dyn ControlPlanePort>,
        layout: JobLayout,
    ) -> Self {
        Self {
            pool,
            control_plane,
            layout,
        }
    }

    pub fn layout(&self) -> &JobLayout {
        &self.layout
    }

    /// Creates `<root>/<system_id>/` and its `files/` subdirectory.
    #[tracing::instrument(name = "transfer", level = "debug", skip(self), fields(op = "initialize_job"))]
    pub async fn initialize_job(&self, system_id: &str) -> AppResult<()> {
        let job_dir = self.layout.job_dir(system_id)?;
        let files_dir = self.layout.files_dir(system_id)?;
        let session = self.pool.acquire().await?;
        let status = session.mkdir(&[&job_dir, &files_dir]).await?;
        if status != 0 {
            tracing::warn!(status, path = %job_dir, "could not create working directory");
            return Err(AppError::with_message(
                AppErrorKind::UnableToCreateWorkingDirectory,
                codes::WORKING_DIRECTORY,
                format!("mkdir for '{job_dir}' exited with status {status}"),
            ));
        }
        tracing::debug!(path = %job_dir, "working directory created");
        Ok(())
    }

    /// Streams exactly `length` bytes from `source` to `files/<relative_path>`,
    /// extracting it in place when it is an archive.
    #[tracing::instrument(
        name = "transfer",
        level = "debug",
        skip(self, source),
        fields(op = "upload_file")
    )]
    pub async fn upload_file(
        &self,
        system_id: &str,
        relative_path: &str,
        length: u64,
        archive_kind: Option<ArchiveKind>,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> AppResult<()> {
        let destination = self.layout.file_in_job(system_id, relative_path)?;
        let parent = Path::new(&destination)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .ok_or_else(|| AppError::invalid_argument("destination has no parent directory"))?;

        let session = self.pool.acquire().await?;
        let failed = |detail: String| {
            tracing::warn!(path = %relative_path, detail = %detail, "upload failed");
            AppError::transfer_failed(relative_path).with_context(detail)
        };

        match session.mkdir(&[&parent]).await {
            Ok(0) => {}
            Ok(status) => return Err(failed(format!("mkdir exited with status {status}"))),
            Err(err) => return Err(failed(err.to_string())),
        }
        let written = session
            .upload_stream(&destination, UPLOAD_MODE, length, source)
            .await
            .map_err(|err| failed(err.to_string()))?;
        if written != length {
            return Err(failed(format!(
                "source ended after {written} of {length} bytes"
            )));
        }

        if let Some(ArchiveKind::Zip) = archive_kind {
            let extracted = session.unzip(&destination, &parent).await;
            match extracted {
                Ok(0) => {}
                Ok(status) => {
                    tracing::warn!(path = %relative_path, status, "extraction failed");
                    return Err(AppError::extraction_failed(relative_path)
                        .with_context(format!("unzip exited with status {status}")));
                }
                Err(err) => {
                    tracing::warn!(path = %relative_path, error = %err, "extraction failed");
                    return Err(AppError::extraction_failed(relative_path).with_context(err.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Removes the job's directory tree. Failures are logged, never returned.
    #[tracing::instrument(name = "transfer", level = "debug", skip(self), fields(op = "cleanup"))]
    pub async fn cleanup(&self, system_id: &str) {
        let job_dir = match self.layout.job_dir(system_id) {
            Ok(dir) => dir,
            Err(err) => {
                tracing::warn!(error = %err, "refusing to clean up");
                return;
            }
        };
        let session = match self.pool.acquire().await {
            Ok(session) => session,
            Err(err) => {
                tracing::warn!(path = %job_dir, error = %err, "cleanup skipped, no session");
                return;
            }
        };
        match session.rm(&job_dir).await {
            Ok(0) => tracing::debug!(path = %job_dir, "working directory removed"),
            Ok(status) => tracing::warn!(path = %job_dir, status, "could not remove working directory"),
            Err(err) => tracing::warn!(path = %job_dir, error = %err, "could not remove working directory"),
        }
    }

    /// Sends every output matching the application's globs to the control plane and
    /// returns the paths it submitted, relative to `files/`.
    ///
    /// Matches whose real path is not inside `files/` are skipped without being opened.
    /// Directories are zipped first and submitted as `<name>.zip`.
    #[tracing::instrument(
        name = "transfer",
        level = "debug",
        skip(self, job),
        fields(op = "transfer_outputs", system_id = %job.system_id)
    )]
    pub async fn transfer_outputs(&self, job: &Job) -> AppResult<Vec<String>> {
        let globs = &job.application.output_file_globs;
        validate_output_globs(globs)?;
        let files_dir = self.layout.files_dir(&job.system_id)?;
        if globs.is_empty() {
            return Ok(Vec::new());
        }

        let session = self.pool.acquire().await?;
        let boundary = session.real_path(&files_dir).await?;

        let mut seen = HashSet::new();
        let mut matches = Vec::new();
        for glob in globs {
            for path in session.list_glob(&files_dir, glob).await? {
                if seen.insert(path.clone()) {
                    matches.push(path);
                }
            }
        }
        tracing::debug!(count = matches.len(), "output candidates");

        let mut submitted = Vec::new();
        for path in matches {
            let real = match session.real_path(&path).await {
                Ok(real) => real,
                Err(err) => {
                    tracing::warn!(path = %path, error = %err, "cannot resolve output, skipping");
                    continue;
                }
            };
            if !is_strictly_within(&boundary, &real) {
                tracing::warn!(
                    path = %path,
                    resolved = %real,
                    "output resolves outside the job's files directory, skipping"
                );
                continue;
            }
            let Some(relative) = relative_to(&boundary, &real) else {
                continue;
            };
            let Some(stat) = session.stat(&real).await? else {
                tracing::info!(path = %real, "output vanished before transfer, skipping");
                continue;
            };

            let (source, length, upload_path) = if stat.is_dir {
                let archive = format!("{real}.zip");
                // zip adds to an existing archive instead of replacing it
                match session.rm(&archive).await {
                    Ok(0) => {}
                    Ok(status) => {
                        return Err(AppError::archive_creation_failed(&relative)
                            .with_context(format!("removing stale archive exited with status {status}")));
                    }
                    Err(err) => {
                        return Err(
                            AppError::archive_creation_failed(&relative).with_context(err.to_string())
                        );
                    }
                }
                match session.zip_directory(&real, &archive).await {
                    Ok(0) => {}
                    Ok(status) => {
                        return Err(AppError::archive_creation_failed(&relative)
                            .with_context(format!("zip exited with status {status}")));
                    }
                    Err(err) => {
                        return Err(
                            AppError::archive_creation_failed(&relative).with_context(err.to_string())
                        );
                    }
                }
                let Some(archive_stat) = session.stat(&archive).await? else {
                    return Err(AppError::archive_creation_failed(&relative)
                        .with_context("archive missing after zip"));
                };
                (archive, archive_stat.size, format!("{relative}.zip"))
            } else {
                (real, stat.size, relative)
            };

            let upload_failed = |err: AppError| {
                tracing::warn!(path = %upload_path, error = %err, "output upload failed");
                AppError::upload_to_cloud_failed(&upload_path).with_context(err.to_string())
            };
            let reader = session
                .download_stream(&source)
                .await
                .map_err(upload_failed)?;
            self.control_plane
                .submit_file(&job.system_id, &upload_path, length, reader)
                .await
                .map_err(upload_failed)?;
            tracing::debug!(path = %upload_path, bytes = length, "output submitted");
            submitted.push(upload_path);
        }
        Ok(submitted)
    }
}
