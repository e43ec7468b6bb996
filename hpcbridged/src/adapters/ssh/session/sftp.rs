// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result, anyhow};
use russh_sftp::client::SftpSession;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::protocol::{FileAttributes, OpenFlags, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::app::ports::{RemoteFileStat, RemoteReader};

use super::SessionManager;

/// One entry found while walking a remote tree, relative to the walk root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    pub relative: String,
    pub is_dir: bool,
}

impl SessionManager {
    async fn sftp(&self) -> Result<SftpSession> {
        let guard = self.handle.lock().await;
        let handle = guard
            .as_ref()
            .ok_or_else(|| anyhow!("SSH handle lost before opening SFTP"))?;
        let channel = handle.channel_open_session().await?;
        drop(guard);
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpSession::new(channel.into_stream()).await?;
        Ok(sftp)
    }

    /// Creates every component of every path. Returns 1 when the server refuses.
    pub async fn ensure_remote_dirs(&self, paths: &[&str]) -> Result<i32> {
        let sftp = self.sftp().await?;
        for path in paths {
            for cur in build_remote_dir_paths(path) {
                match sftp.metadata(&cur).await {
                    Ok(meta) if meta.is_dir() => continue,
                    Ok(_) => {
                        log::warn!("remote path exists but is not a directory: {cur}");
                        return Ok(1);
                    }
                    Err(err) if is_missing(&err) => {}
                    Err(err) => return Err(err).context(format!("stat {cur}")),
                }
                log::debug!("creating remote dir {cur}");
                match sftp.create_dir(&cur).await {
                    Ok(()) => {}
                    Err(err) if is_status_error(&err) => {
                        log::warn!("cannot create remote dir {cur}: {err}");
                        return Ok(1);
                    }
                    Err(err) => return Err(err).context(format!("creating path {cur}")),
                }
            }
        }
        Ok(0)
    }

    pub async fn stat(&self, path: &str) -> Result<Option<RemoteFileStat>> {
        let sftp = self.sftp().await?;
        match sftp.metadata(path).await {
            Ok(meta) => Ok(Some(RemoteFileStat {
                size: meta.size.unwrap_or(0),
                is_dir: meta.is_dir(),
            })),
            Err(err) if is_missing(&err) => Ok(None),
            Err(err) => Err(err).context(format!("stat {path}")),
        }
    }

    pub async fn canonicalize(&self, path: &str) -> Result<String> {
        let sftp = self.sftp().await?;
        sftp.canonicalize(path)
            .await
            .with_context(|| format!("realpath {path}"))
    }

    /// Depth-first listing of everything under `root`. Symlinked directories are
    /// reported but not entered.
    pub async fn walk(&self, root: &str) -> Result<Vec<WalkEntry>> {
        let sftp = self.sftp().await?;
        let root = root.trim_end_matches('/').to_string();
        let mut found = Vec::new();
        let mut stack: Vec<(String, String)> = vec![(root, String::new())];
        while let Some((remote_base, relative_base)) = stack.pop() {
            let entries = match sftp.read_dir(&remote_base).await {
                Ok(entries) => entries,
                Err(err) if is_missing(&err) => continue,
                Err(err) => return Err(err).context(format!("listing {remote_base}")),
            };
            for entry in entries {
                let name = entry.file_name();
                if name == "." || name == ".." {
                    continue;
                }
                let relative = if relative_base.is_empty() {
                    name.clone()
                } else {
                    format!("{relative_base}/{name}")
                };
                let is_dir = entry.file_type().is_dir();
                if is_dir {
                    stack.push((format!("{remote_base}/{name}"), relative.clone()));
                }
                found.push(WalkEntry { relative, is_dir });
            }
        }
        Ok(found)
    }

    /// Copies at most `length` bytes from `source` into `path` and returns the count.
    pub async fn upload(
        &self,
        path: &str,
        mode: u32,
        length: u64,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64> {
        let sftp = self.sftp().await?;
        let flags = OpenFlags::WRITE
            .union(OpenFlags::CREATE)
            .union(OpenFlags::TRUNCATE);
        let attrs = FileAttributes {
            permissions: Some(mode),
            ..Default::default()
        };
        let mut file = sftp
            .open_with_flags_and_attributes(path, flags, attrs)
            .await
            .with_context(|| format!("open remote {path}"))?;
        let mut limited = source.take(length);
        let written = tokio::io::copy(&mut limited, &mut file)
            .await
            .with_context(|| format!("write remote {path}"))?;
        file.flush().await?;
        file.shutdown().await?;
        let attrs = FileAttributes {
            permissions: Some(mode),
            ..Default::default()
        };
        if let Err(err) = sftp.set_metadata(path, attrs).await {
            if is_permission_denied(&err) {
                log::debug!("permission denied when setting mode for {path}: {err}");
            } else {
                log::warn!("error when setting mode for {path}: {err}");
            }
        }
        Ok(written)
    }

    pub async fn open_reader(&self, path: &str) -> Result<RemoteReader> {
        let sftp = self.sftp().await?;
        let file = sftp
            .open(path)
            .await
            .with_context(|| format!("open remote {path}"))?;
        Ok(Box::new(file))
    }
}

/// Every ancestor of an absolute path, shallowest first, ending with the path itself.
fn build_remote_dir_paths(remote_dir: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    for part in remote_dir.split('/').filter(|p| !p.is_empty()) {
        cur.push('/');
        cur.push_str(part);
        out.push(cur.clone());
    }
    out
}

fn is_status_error(err: &SftpError) -> bool {
    matches!(err, SftpError::Status(_))
}

fn is_missing(err: &SftpError) -> bool {
    matches!(err, SftpError::Status(status) if status.status_code == StatusCode::NoSuchFile)
}

fn is_permission_denied(err: &SftpError) -> bool {
    match err {
        SftpError::Status(status) => status.status_code == StatusCode::PermissionDenied,
        SftpError::IO(msg) => msg.to_lowercase().contains("permission denied"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_paths_cover_every_ancestor() {
        assert_eq!(
            build_remote_dir_paths("/scratch/hpc/job-1/files/"),
            vec![
                "/scratch".to_string(),
                "/scratch/hpc".to_string(),
                "/scratch/hpc/job-1".to_string(),
                "/scratch/hpc/job-1/files".to_string(),
            ]
        );
        assert!(build_remote_dir_paths("/").is_empty());
    }

    #[test]
    fn io_permission_errors_are_recognized() {
        assert!(is_permission_denied(&SftpError::IO(
            "Permission denied".to_string()
        )));
        assert!(!is_permission_denied(&SftpError::IO("reset".to_string())));
        assert!(!is_missing(&SftpError::IO("reset".to_string())));
    }
}
