// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod file_transfer;
pub mod job_tracker;
pub mod log_tail;
pub mod poll_agent;
pub mod submit;
