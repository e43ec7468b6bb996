// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod output_glob;
pub mod remote_path;
pub mod script;
pub mod shell;
pub mod slurm;
