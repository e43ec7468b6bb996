// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;

use clap::{CommandFactory, FromArgMatches, Parser};

use crate::config::Overrides;

#[derive(Debug, Parser)]
#[command(
    name = "hpcbridged",
    version,
    about = "Runs cloud jobs on a Slurm cluster over SSH and reports their progress back",
    long_about = None,
    after_help = "Configuration precedence: defaults < config file < environment < command-line flags.\n\
Config path precedence: defaults < HPCBRIDGE_CONFIG_PATH < command-line flags.\n\
If --config is omitted, hpcbridged tries HPCBRIDGE_CONFIG_PATH, then the default config file location.\n\
Paths in the config file are resolved relative to the config file directory; paths passed as flags are resolved relative to the current working directory."
)]
pub struct Opts {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to a TOML config file. When omitted, hpcbridged uses HPCBRIDGE_CONFIG_PATH if set, otherwise the default config file location."
    )]
    pub config: Option<PathBuf>,
    #[arg(
        long,
        value_name = "PATH",
        help = "Path to the SQLite job database. Overrides `database_path` from the config file."
    )]
    pub database_path: Option<PathBuf>,
    #[arg(
        long,
        value_name = "SECS",
        help = "Seconds between scheduler polls. Overrides `poll_interval_secs` from the config file."
    )]
    pub poll_interval_secs: Option<u64>,
    #[arg(
        long,
        value_name = "HOST",
        help = "Cluster login host. Overrides `ssh.host` from the config file."
    )]
    pub ssh_host: Option<String>,
    #[arg(
        long,
        value_name = "PATH",
        help = "Absolute remote directory holding job working directories. Overrides `slurm.working_root`."
    )]
    pub working_root: Option<String>,
    #[arg(
        long,
        value_name = "URL",
        help = "Control plane base URL. Overrides `control_plane.base_url` from the config file."
    )]
    pub control_plane_url: Option<String>,
    #[arg(
        long,
        value_name = "TOKEN",
        env = "HPCBRIDGE_CONTROL_PLANE_TOKEN",
        hide_env_values = true,
        help = "Bearer token for the control plane. Overrides `control_plane.token` from the config file."
    )]
    pub control_plane_token: Option<String>,
    #[arg(
        short,
        long,
        action = clap::ArgAction::SetTrue,
        help = "Enable debug logging and include logs from dependencies. Overrides `verbose` from the config file."
    )]
    pub verbose: bool,
}

pub struct ParsedOpts {
    pub opts: Opts,
    pub verbose_override: Option<bool>,
}

impl ParsedOpts {
    /// Moves the flag values into per-field config overrides, leaving the config path.
    pub fn into_overrides(self) -> (Option<PathBuf>, Overrides) {
        let ParsedOpts {
            opts,
            verbose_override,
        } = self;
        let overrides = Overrides {
            database_path: opts.database_path,
            poll_interval_secs: opts.poll_interval_secs,
            verbose: verbose_override,
            ssh_host: opts.ssh_host,
            working_root: opts.working_root,
            control_plane_url: opts.control_plane_url,
            control_plane_token: opts.control_plane_token,
        };
        (opts.config, overrides)
    }
}

const HELP_TEMPLATE: &str = "\
hpcbridged {version}

{before-help}{about-with-newline}{usage-heading} {usage}
{after-help}

{all-args}
";

pub fn cli_command() -> clap::Command {
    Opts::command().help_template(HELP_TEMPLATE)
}

fn parsed_from(matches: &clap::ArgMatches) -> Result<ParsedOpts, clap::Error> {
    let verbose_override = if matches.get_flag("verbose") {
        Some(true)
    } else {
        None
    };
    let opts = Opts::from_arg_matches(matches)?;
    Ok(ParsedOpts {
        opts,
        verbose_override,
    })
}

pub fn parse_opts() -> ParsedOpts {
    let matches = cli_command().get_matches();
    parsed_from(&matches).unwrap_or_else(|err| err.exit())
}
