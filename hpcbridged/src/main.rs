// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use hpcbridged::adapters::cli;
use hpcbridged::bridge::Bridge;
use hpcbridged::{config, logging};

fn log_config_report(report: &config::ConfigReport) {
    match (&report.config_path, report.config_path_source) {
        (Some(path), Some(source)) => {
            tracing::info!(
                "config path: {} (source={}, present={})",
                path.display(),
                source.as_str(),
                report.config_file_present
            );
        }
        (Some(path), None) => {
            tracing::info!(
                "config path: {} (present={})",
                path.display(),
                report.config_file_present
            );
        }
        (None, _) => {
            tracing::info!("config path: (none)");
        }
    }
    tracing::info!(
        "config database_path: {} (source={})",
        report.database_path.value.display(),
        report.database_path.source.as_str()
    );
    tracing::info!(
        "config poll_interval_secs: {} (source={})",
        report.poll_interval_secs.value,
        report.poll_interval_secs.source.as_str()
    );
    tracing::info!(
        "config ssh.host: {} (source={})",
        report.ssh_host.value,
        report.ssh_host.source.as_str()
    );
    tracing::info!(
        "config slurm.working_root: {} (source={})",
        report.working_root.value,
        report.working_root.source.as_str()
    );
    tracing::info!(
        "config control_plane.base_url: {} (source={})",
        report.control_plane_url.value,
        report.control_plane_url.source.as_str()
    );
    tracing::info!(
        "config control_plane.token: <set> (source={})",
        report.control_plane_token_source.as_str()
    );
    tracing::info!(
        "config verbose: {} (source={})",
        report.verbose.value,
        report.verbose.source.as_str()
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config_path, overrides) = cli::parse_opts().into_overrides();
    let config::LoadResult { config, report } =
        config::load_with_report(config_path, overrides)?;
    logging::init(config.verbose);
    log_config_report(&report);

    let bridge = Bridge::from_config(&config).await?;
    let restored = bridge.restore_tracking().await?;
    tracing::info!(restored, "resumed tracking of live jobs");

    let running = bridge.start();
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    bridge.stop(running).await;
    Ok(())
}
