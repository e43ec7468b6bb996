// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod adapters;
pub mod app;
pub mod bridge;
pub mod config;
pub mod logging;
