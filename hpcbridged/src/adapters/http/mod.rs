// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! HTTP client for the cloud control plane.
//!
//! Endpoints live under `<base>/api/hpc/jobs/`; every request carries the configured
//! bearer token. Path segments are percent-encoded, so a system id never changes the
//! request target.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, Url};
use serde::Serialize;
use thiserror::Error;
use tokio_util::io::ReaderStream;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{ByteStream, ControlPlanePort};
use crate::app::types::{Job, JobState, SimpleDuration};

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("control plane returned status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("control plane URL {0} cannot carry a path")]
    BaseUrl(Url),
}

fn map_control_plane_error(err: ControlPlaneError) -> AppError {
    match err {
        ControlPlaneError::Api { status: 404, message } => {
            AppError::with_message(AppErrorKind::NotFound, codes::NOT_FOUND, message)
        }
        other => AppError::with_message(
            AppErrorKind::ControlPlane,
            codes::CONTROL_PLANE_ERROR,
            other.to_string(),
        ),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StateChangeRequest<'a> {
    system_id: &'a str,
    state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompletedRequest<'a> {
    system_id: &'a str,
    /// `HH:MM:SS`
    usage: Option<String>,
    success: bool,
}

#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    base_url: Url,
    token: String,
    client: Client,
}

impl HttpControlPlane {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| map_control_plane_error(err.into()))?;
        Self::with_client(base_url, token, client)
    }

    pub fn with_client(
        base_url: impl Into<String>,
        token: impl Into<String>,
        client: Client,
    ) -> AppResult<Self> {
        let raw = base_url.into();
        let base_url = Url::parse(&raw).map_err(|err| {
            AppError::invalid_argument(format!("invalid control plane URL {raw}: {err}"))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::invalid_argument(format!(
                "control plane URL {raw} cannot carry a path"
            )));
        }
        Ok(Self {
            base_url,
            token: token.into(),
            client,
        })
    }

    /// `<base>/api/hpc/jobs/<segments...>`, each segment encoded on its own.
    fn url(&self, segments: &[&str]) -> Result<Url, ControlPlaneError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ControlPlaneError::BaseUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(["api", "hpc", "jobs"])
            .extend(segments);
        Ok(url)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ControlPlaneError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(ControlPlaneError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &T,
    ) -> Result<(), ControlPlaneError> {
        let response = self
            .client
            .post(self.url(&[endpoint])?)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl ControlPlanePort for HttpControlPlane {
    #[tracing::instrument(name = "control_plane", level = "debug", skip(self, state, message), fields(op = "state_change", state = state.as_str()))]
    async fn request_state_change(
        &self,
        system_id: &str,
        state: JobState,
        message: Option<&str>,
    ) -> AppResult<()> {
        let body = StateChangeRequest {
            system_id,
            state,
            message,
        };
        self.post_json("state-change", &body)
            .await
            .map_err(map_control_plane_error)
    }

    #[tracing::instrument(name = "control_plane", level = "debug", skip(self), fields(op = "lookup"))]
    async fn lookup(&self, system_id: &str) -> AppResult<Job> {
        let fetch = async {
            let response = self
                .client
                .get(self.url(&["lookup", system_id])?)
                .bearer_auth(&self.token)
                .send()
                .await?;
            let job = Self::check(response).await?.json::<Job>().await?;
            Ok::<_, ControlPlaneError>(job)
        };
        fetch.await.map_err(map_control_plane_error)
    }

    #[tracing::instrument(name = "control_plane", level = "debug", skip(self, content), fields(op = "submit_file"))]
    async fn submit_file(
        &self,
        system_id: &str,
        relative_path: &str,
        length: u64,
        content: ByteStream,
    ) -> AppResult<()> {
        let file_name = relative_path
            .rsplit('/')
            .next()
            .unwrap_or(relative_path)
            .to_string();
        let part = Part::stream_with_length(Body::wrap_stream(ReaderStream::new(content)), length)
            .file_name(file_name);
        let form = Form::new()
            .text("systemId", system_id.to_string())
            .text("path", relative_path.to_string())
            .part("file", part);
        let send = async {
            let response = self
                .client
                .post(self.url(&["submit-file"])?)
                .bearer_auth(&self.token)
                .multipart(form)
                .send()
                .await?;
            Self::check(response).await?;
            Ok::<_, ControlPlaneError>(())
        };
        send.await.map_err(map_control_plane_error)
    }

    #[tracing::instrument(name = "control_plane", level = "debug", skip(self, usage), fields(op = "completed"))]
    async fn completed(
        &self,
        system_id: &str,
        usage: Option<SimpleDuration>,
        success: bool,
    ) -> AppResult<()> {
        let body = CompletedRequest {
            system_id,
            usage: usage.map(|u| u.to_string()),
            success,
        };
        self.post_json("completed", &body)
            .await
            .map_err(map_control_plane_error)
    }
}
