// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::anyhow;
use russh::client::Config;
use russh::keys::known_hosts::{learn_known_hosts, learn_known_hosts_path};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

mod auth;
mod exec;
mod sftp;

pub use auth::AuthenticationFailure;

/// Minimal russh client handler; only server key verification is customized.
#[derive(Clone, Debug)]
struct ClientHandler {
    host: String,
    addr: SocketAddr,
    known_hosts_path: Option<PathBuf>,
}

impl russh::client::Handler for ClientHandler {
    type Error = anyhow::Error;
    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        verify_server_key(
            &self.host,
            self.addr,
            server_public_key,
            self.known_hosts_path.as_deref(),
        )
    }
}

/// Parameters for establishing the SSH connection to the login node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshParams {
    /// Hostname or IP as configured; also used for known_hosts lookup.
    pub host: String,
    pub port: u16,
    pub username: String,
    pub identity_path: PathBuf,
    pub known_hosts_path: Option<PathBuf>,
    pub keepalive_secs: u64,
}

/// known_hosts file the login node's key is checked against; the user's default when unset.
#[derive(Clone, Copy, Debug)]
struct KnownHosts<'a>(Option<&'a Path>);

impl KnownHosts<'_> {
    fn check(
        &self,
        host: &str,
        port: u16,
        key: &russh::keys::ssh_key::PublicKey,
    ) -> std::result::Result<bool, russh::keys::Error> {
        match self.0 {
            Some(path) => russh::keys::check_known_hosts_path(host, port, key, path),
            None => russh::keys::check_known_hosts(host, port, key),
        }
    }

    fn learn(
        &self,
        host: &str,
        port: u16,
        key: &russh::keys::ssh_key::PublicKey,
    ) -> std::result::Result<(), russh::keys::Error> {
        match self.0 {
            Some(path) => learn_known_hosts_path(host, port, key, path),
            None => learn_known_hosts(host, port, key),
        }
    }
}

/// Names the key may be recorded under: the configured host, then the resolved IP.
fn known_host_names(host: &str, addr: SocketAddr) -> Vec<String> {
    let ip = addr.ip().to_string();
    if ip == host {
        vec![ip]
    } else {
        vec![host.to_string(), ip]
    }
}

/// Accepts keys already in known_hosts under any of [`known_host_names`]. Unknown hosts
/// are learned under the configured name; a mismatching key is an error.
fn verify_server_key(
    host: &str,
    addr: SocketAddr,
    key: &russh::keys::ssh_key::PublicKey,
    known_hosts_path: Option<&Path>,
) -> std::result::Result<bool, anyhow::Error> {
    let known_hosts = KnownHosts(known_hosts_path);
    let port = addr.port();
    for name in known_host_names(host, addr) {
        match known_hosts.check(&name, port, key) {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(err) => {
                log::warn!("host key check failed for {name}:{port}: {err}");
                return Err(anyhow!("host key check failed for {name}:{port}: {err}"));
            }
        }
    }

    log::info!("no known_hosts entry for {host}:{port}; recording the presented key");
    known_hosts.learn(host, port, key).map_err(|err| {
        log::warn!("cannot record host key for {host}:{port}: {err}");
        anyhow!("cannot record host key for {host}:{port}: {err}")
    })?;
    Ok(true)
}

/// Owns a single long-lived SSH connection. One pool slot holds one manager.
pub struct SessionManager {
    params: SshParams,
    config: Arc<Config>,
    // None until the first acquire and after shutdown
    handle: Arc<Mutex<Option<russh::client::Handle<ClientHandler>>>>,
    keepalive_task_handle: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl SessionManager {
    pub fn new(params: SshParams) -> Self {
        let cfg = Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(params.keepalive_secs.max(1))),
            // large windows keep multi-gigabyte output uploads from stalling on acks
            channel_buffer_size: 64,
            window_size: 1024 * 1024,
            ..Default::default()
        };
        Self {
            params,
            config: Arc::new(cfg),
            handle: Arc::new(Mutex::new(None)),
            keepalive_task_handle: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn needs_connect(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .is_none_or(|handle| handle.is_closed())
    }

    pub async fn shutdown(&self) {
        if let Some(task) = self.keepalive_task_handle.lock().await.take() {
            task.abort();
        }
        let mut handle_field = self.handle.lock().await;
        if let Some(handle) = handle_field.take() {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
        }
    }
}
