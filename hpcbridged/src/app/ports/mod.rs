// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod clock;
pub mod control_plane;
pub mod job_store;
pub mod remote_session;

pub use clock::ClockPort;
pub use control_plane::{ByteStream, ControlPlanePort};
pub use job_store::JobStorePort;
pub use remote_session::{
    ExecCapture, PooledSession, RemoteFileStat, RemoteReader, RemoteSession, SessionPoolPort,
};
