// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result, anyhow};
use russh::client::{AuthResult, Handle};
use russh::keys::PrivateKeyWithHashAlg;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{ClientHandler, SessionManager};

/// The login node refused the configured identity. Kept distinct from transport errors so
/// callers can report a credentials problem instead of an outage.
#[derive(Debug, thiserror::Error)]
#[error("public key authentication was rejected")]
pub struct AuthenticationFailure;

#[derive(Debug, PartialEq, Eq)]
enum AuthDecision {
    Success,
    Failure,
}

// Keyboard-interactive needs a human; a daemon only accepts a completed publickey login.
fn auth_decision(result: AuthResult) -> AuthDecision {
    match result {
        AuthResult::Success => AuthDecision::Success,
        AuthResult::Failure { .. } => AuthDecision::Failure,
    }
}

/// Pings at half the keepalive interval until the connection closes or the handle is taken.
fn spawn_keepalive(
    handle: Arc<Mutex<Option<Handle<ClientHandler>>>>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval / 2);
        loop {
            ticker.tick().await;
            let guard = handle.lock().await;
            let Some(handle) = guard.as_ref() else {
                break;
            };
            if handle.is_closed() {
                log::debug!("login node connection closed; keepalive stops");
                break;
            }
            if let Err(err) = handle.send_keepalive(true).await {
                log::debug!("keepalive to login node failed: {err}");
            }
        }
    })
}

impl SessionManager {
    async fn resolve_login_node(&self) -> Result<SocketAddr> {
        tokio::net::lookup_host((self.params.host.as_str(), self.params.port))
            .await
            .with_context(|| format!("resolving {}", self.params.host))?
            .next()
            .ok_or_else(|| anyhow!("no address found for {}", self.params.host))
    }

    async fn authenticate(&self, handle: &mut Handle<ClientHandler>) -> Result<()> {
        let identity = &self.params.identity_path;
        let key = russh::keys::load_secret_key(identity, None)
            .with_context(|| format!("cannot load identity {}", identity.display()))?;
        // RSA keys sign with the strongest hash the server offers; other key types ignore it
        let key = PrivateKeyWithHashAlg::new(
            Arc::new(key),
            handle.best_supported_rsa_hash().await?.flatten(),
        );
        let result = handle
            .authenticate_publickey(self.params.username.clone(), key)
            .await?;
        match auth_decision(result) {
            AuthDecision::Success => Ok(()),
            AuthDecision::Failure => Err(AuthenticationFailure.into()),
        }
    }

    /// Connects and authenticates unless an open connection already exists. Holding the
    /// handle lock for the whole handshake keeps concurrent callers from dialing twice.
    pub async fn ensure_connected(&self) -> Result<()> {
        let mut handle_field = self.handle.lock().await;
        if handle_field.as_ref().is_some_and(|h| !h.is_closed()) {
            return Ok(());
        }

        let addr = self.resolve_login_node().await?;
        log::info!("connecting to {}@{addr}", self.params.username);
        let handler = ClientHandler {
            host: self.params.host.clone(),
            addr,
            known_hosts_path: self.params.known_hosts_path.clone(),
        };
        let mut handle = russh::client::connect(self.config.clone(), addr, handler)
            .await
            .with_context(|| format!("ssh handshake with {addr} failed"))?;
        self.authenticate(&mut handle).await?;
        log::info!("authenticated as {}@{addr}", self.params.username);

        *handle_field = Some(handle);
        drop(handle_field);

        if let Some(interval) = self.config.keepalive_interval {
            let task = spawn_keepalive(self.handle.clone(), interval);
            if let Some(previous) = self.keepalive_task_handle.lock().await.replace(task) {
                previous.abort();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ssh::SshParams;
    use russh::{MethodKind, MethodSet};
    use std::path::PathBuf;

    #[test]
    fn auth_decision_success() {
        assert_eq!(auth_decision(AuthResult::Success), AuthDecision::Success);
    }

    #[test]
    fn partial_success_is_still_a_failure() {
        let methods = [MethodKind::KeyboardInteractive];
        let decision = auth_decision(AuthResult::Failure {
            remaining_methods: MethodSet::from(methods.as_slice()),
            partial_success: true,
        });
        assert_eq!(decision, AuthDecision::Failure);
    }

    #[tokio::test]
    async fn unreachable_login_node_leaves_the_manager_disconnected() {
        let manager = SessionManager::new(SshParams {
            host: "127.0.0.1".into(),
            port: 1,
            username: "svc".into(),
            identity_path: PathBuf::from("/nonexistent/id_ed25519"),
            known_hosts_path: None,
            keepalive_secs: 30,
        });

        let err = manager.ensure_connected().await.unwrap_err();

        assert!(format!("{err:#}").contains("127.0.0.1:1"));
        assert!(manager.needs_connect().await);
    }
}
