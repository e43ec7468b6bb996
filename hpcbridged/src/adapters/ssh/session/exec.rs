// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result, anyhow};
use russh::ChannelMsg;

use crate::app::ports::ExecCapture;

use super::SessionManager;

// Reported when the channel closes without an exit status, e.g. a command killed by a signal.
const NO_EXIT_STATUS: i32 = -1;

struct CaptureBuffer(ExecCapture);

impl CaptureBuffer {
    fn new() -> Self {
        Self(ExecCapture {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: NO_EXIT_STATUS,
        })
    }

    /// Folds one channel message in; `true` once the channel is closed.
    fn absorb(&mut self, msg: &ChannelMsg) -> bool {
        match msg {
            ChannelMsg::Data { data } => self.0.stdout.extend_from_slice(data),
            ChannelMsg::ExtendedData { data, ext: 1 } => self.0.stderr.extend_from_slice(data),
            ChannelMsg::ExitStatus { exit_status } => self.0.exit_code = *exit_status as i32,
            ChannelMsg::ExitSignal { signal_name, .. } => {
                let note = format!("terminated by signal {signal_name:?}\n");
                self.0.stderr.extend_from_slice(note.as_bytes());
            }
            ChannelMsg::Close => return true,
            _ => {}
        }
        false
    }
}

impl SessionManager {
    /// Runs `cmd` on a fresh channel and collects everything it writes.
    pub async fn exec_capture(&self, cmd: &str) -> Result<ExecCapture> {
        let guard = self.handle.lock().await;
        let handle = guard
            .as_ref()
            .ok_or_else(|| anyhow!("not connected to the login node"))?;
        let mut chan = handle
            .channel_open_session()
            .await
            .context("open session")?;
        drop(guard);
        log::debug!("executing '{cmd}'");
        chan.exec(true, cmd).await.context("exec request")?;
        let mut buffer = CaptureBuffer::new();
        while let Some(msg) = chan.wait().await {
            if buffer.absorb(&msg) {
                break;
            }
        }
        let _ = chan.close().await;
        Ok(buffer.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::{CryptoVec, Sig};

    #[test]
    fn output_streams_and_status_are_collected() {
        let mut buffer = CaptureBuffer::new();

        let msg = ChannelMsg::Data {
            data: CryptoVec::from_slice(b"Submitted batch job 7\n"),
        };
        assert!(!buffer.absorb(&msg));
        let msg = ChannelMsg::ExtendedData {
            data: CryptoVec::from_slice(b"warn"),
            ext: 1,
        };
        assert!(!buffer.absorb(&msg));
        assert!(!buffer.absorb(&ChannelMsg::ExitStatus { exit_status: 0 }));
        assert!(buffer.absorb(&ChannelMsg::Close));

        assert_eq!(buffer.0.stdout, b"Submitted batch job 7\n");
        assert_eq!(buffer.0.stderr, b"warn");
        assert_eq!(buffer.0.exit_code, 0);
    }

    #[test]
    fn other_extended_streams_are_ignored() {
        let mut buffer = CaptureBuffer::new();
        let msg = ChannelMsg::ExtendedData {
            data: CryptoVec::from_slice(b"skip"),
            ext: 2,
        };
        assert!(!buffer.absorb(&msg));
        assert!(buffer.0.stdout.is_empty());
        assert!(buffer.0.stderr.is_empty());
        assert_eq!(buffer.0.exit_code, NO_EXIT_STATUS);
    }

    #[test]
    fn signal_termination_keeps_a_failing_status() {
        let mut buffer = CaptureBuffer::new();
        let msg = ChannelMsg::ExitSignal {
            signal_name: Sig::KILL,
            core_dumped: false,
            error_message: String::new(),
            lang_tag: String::new(),
        };
        assert!(!buffer.absorb(&msg));
        assert_eq!(buffer.0.exit_code, NO_EXIT_STATUS);
        assert!(buffer.0.stderr_text().contains("KILL"));
    }
}
