// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

const APP_DIR_NAME: &str = "hpcbridge";
const CONFIG_FILE_NAME: &str = "hpcbridge.toml";
const CONFIG_ENV_VAR: &str = "HPCBRIDGE_CONFIG_PATH";
const DATABASE_FILE_NAME: &str = "hpcbridge.sqlite";
const DEFAULT_POLL_INITIAL_DELAY_SECS: u64 = 5;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_FAILURE_REDELIVERY_SECS: u64 = 60;
const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_POOL_SIZE: usize = 4;
const DEFAULT_KEEPALIVE_SECS: u64 = 30;
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 120;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    database_path: Option<String>,
    poll_initial_delay_secs: Option<u64>,
    poll_interval_secs: Option<u64>,
    failure_redelivery_secs: Option<u64>,
    verbose: Option<bool>,
    #[serde(default)]
    ssh: FileSshConfig,
    #[serde(default)]
    slurm: FileSlurmConfig,
    #[serde(default)]
    control_plane: FileControlPlaneConfig,
}

#[derive(Debug, Default, Deserialize)]
struct FileSshConfig {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    identity_path: Option<String>,
    known_hosts_path: Option<String>,
    pool_size: Option<usize>,
    keepalive_secs: Option<u64>,
    command_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct FileSlurmConfig {
    account: Option<String>,
    working_root: Option<String>,
    sentinel_handle: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct FileControlPlaneConfig {
    base_url: Option<String>,
    token: Option<String>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SshSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub identity_path: PathBuf,
    pub known_hosts_path: Option<PathBuf>,
    pub pool_size: usize,
    pub keepalive_secs: u64,
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct SlurmSettings {
    pub account: String,
    /// Absolute path on the cluster under which job directories are created.
    pub working_root: String,
    pub sentinel_handle: Option<i64>,
}

#[derive(Clone)]
pub struct ControlPlaneSettings {
    pub base_url: String,
    pub token: String,
    pub request_timeout_secs: u64,
}

// the token never reaches logs
impl std::fmt::Debug for ControlPlaneSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlaneSettings")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

#[derive(Debug)]
pub struct Config {
    pub database_path: PathBuf,
    pub poll_initial_delay_secs: u64,
    pub poll_interval_secs: u64,
    pub failure_redelivery_secs: u64,
    pub verbose: bool,
    pub ssh: SshSettings,
    pub slurm: SlurmSettings,
    pub control_plane: ControlPlaneSettings,
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Override,
    Env,
    ConfigFile,
    Default,
}

impl ConfigSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigSource::Override => "override",
            ConfigSource::Env => "env",
            ConfigSource::ConfigFile => "config",
            ConfigSource::Default => "default",
        }
    }
}

#[derive(Debug)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

#[derive(Debug)]
pub struct ConfigReport {
    pub config_path: Option<PathBuf>,
    pub config_path_source: Option<ConfigSource>,
    pub config_file_present: bool,
    pub database_path: ConfigValue<PathBuf>,
    pub poll_interval_secs: ConfigValue<u64>,
    pub verbose: ConfigValue<bool>,
    pub ssh_host: ConfigValue<String>,
    pub working_root: ConfigValue<String>,
    pub control_plane_url: ConfigValue<String>,
    pub control_plane_token_source: ConfigSource,
}

#[derive(Debug)]
pub struct LoadResult {
    pub config: Config,
    pub report: ConfigReport,
}

#[derive(Debug, Default)]
pub struct Overrides {
    pub database_path: Option<PathBuf>,
    pub poll_interval_secs: Option<u64>,
    pub verbose: Option<bool>,
    pub ssh_host: Option<String>,
    pub working_root: Option<String>,
    pub control_plane_url: Option<String>,
    pub control_plane_token: Option<String>,
}

pub fn load(config_path_override: Option<PathBuf>, overrides: Overrides) -> Result<Config> {
    Ok(load_with_report(config_path_override, overrides)?.config)
}

fn pick<T>(over: Option<T>, file: Option<T>) -> Option<(T, ConfigSource)> {
    match (over, file) {
        (Some(value), _) => Some((value, ConfigSource::Override)),
        (None, Some(value)) => Some((value, ConfigSource::ConfigFile)),
        (None, None) => None,
    }
}

fn pick_or<T>(over: Option<T>, file: Option<T>, default: T) -> (T, ConfigSource) {
    pick(over, file).unwrap_or((default, ConfigSource::Default))
}

fn required<T>(value: Option<(T, ConfigSource)>, key: &str) -> Result<(T, ConfigSource)> {
    value.with_context(|| format!("missing required setting `{key}`"))
}

pub fn load_with_report(
    config_path_override: Option<PathBuf>,
    overrides: Overrides,
) -> Result<LoadResult> {
    let (config_path, config_path_source, required_file) = match config_path_override {
        Some(path) => (Some(expand_path(path)), Some(ConfigSource::Override), true),
        None => match config_path_from_env()? {
            Some(path) => (Some(expand_path(path)), Some(ConfigSource::Env), true),
            None => match default_config_path().ok() {
                Some(path) => (Some(path), Some(ConfigSource::Default), false),
                None => (None, None, false),
            },
        },
    };
    let config_file_present = config_path
        .as_deref()
        .map(|path| path.exists())
        .unwrap_or(false);

    let file_config = match config_path.as_deref() {
        Some(path) => read_config_file(path, required_file)?,
        None => FileConfig::default(),
    };
    let base_dir = config_path.as_deref().and_then(|path| path.parent());

    let (database_path, database_source) = match overrides.database_path {
        Some(path) => (expand_path(path), ConfigSource::Override),
        None => match file_config.database_path {
            Some(raw) => (resolve_path(&raw, base_dir), ConfigSource::ConfigFile),
            None => (
                default_database_path().with_context(|| {
                    "failed to resolve default database path; specify --database-path or set database_path in the config file"
                })?,
                ConfigSource::Default,
            ),
        },
    };

    let (verbose, verbose_source) = pick_or(overrides.verbose, file_config.verbose, false);
    let (poll_interval_secs, poll_interval_source) = pick_or(
        overrides.poll_interval_secs,
        file_config.poll_interval_secs,
        DEFAULT_POLL_INTERVAL_SECS,
    );
    if poll_interval_secs == 0 {
        anyhow::bail!("poll_interval_secs must be positive");
    }
    let poll_initial_delay_secs = file_config
        .poll_initial_delay_secs
        .unwrap_or(DEFAULT_POLL_INITIAL_DELAY_SECS);
    let failure_redelivery_secs = file_config
        .failure_redelivery_secs
        .unwrap_or(DEFAULT_FAILURE_REDELIVERY_SECS);
    if failure_redelivery_secs == 0 {
        anyhow::bail!("failure_redelivery_secs must be positive");
    }

    let ssh_file = file_config.ssh;
    let (ssh_host, ssh_host_source) =
        required(pick(overrides.ssh_host, ssh_file.host), "ssh.host")?;
    let (username, _) = required(pick(None, ssh_file.username), "ssh.username")?;
    let identity_path = ssh_file
        .identity_path
        .map(|raw| resolve_path(&raw, base_dir))
        .context("missing required setting `ssh.identity_path`")?;
    let pool_size = ssh_file.pool_size.unwrap_or(DEFAULT_POOL_SIZE);
    if pool_size == 0 {
        anyhow::bail!("ssh.pool_size must be at least 1");
    }
    let command_timeout_secs = ssh_file
        .command_timeout_secs
        .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS);
    if command_timeout_secs == 0 {
        anyhow::bail!("ssh.command_timeout_secs must be positive");
    }
    let ssh = SshSettings {
        host: ssh_host,
        port: ssh_file.port.unwrap_or(DEFAULT_SSH_PORT),
        username,
        identity_path,
        known_hosts_path: ssh_file
            .known_hosts_path
            .map(|raw| resolve_path(&raw, base_dir)),
        pool_size,
        keepalive_secs: ssh_file.keepalive_secs.unwrap_or(DEFAULT_KEEPALIVE_SECS),
        command_timeout_secs,
    };

    let slurm_file = file_config.slurm;
    let (account, _) = required(pick(None, slurm_file.account), "slurm.account")?;
    let (working_root, working_root_source) = required(
        pick(overrides.working_root, slurm_file.working_root),
        "slurm.working_root",
    )?;
    if !working_root.starts_with('/') {
        anyhow::bail!("slurm.working_root must be an absolute remote path, got {working_root}");
    }
    let slurm = SlurmSettings {
        account,
        working_root,
        sentinel_handle: slurm_file.sentinel_handle,
    };

    let cp_file = file_config.control_plane;
    let (base_url, base_url_source) = required(
        pick(overrides.control_plane_url, cp_file.base_url),
        "control_plane.base_url",
    )?;
    if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        anyhow::bail!("control_plane.base_url must be an http(s) URL, got {base_url}");
    }
    let (token, token_source) = required(
        pick(overrides.control_plane_token, cp_file.token),
        "control_plane.token",
    )?;
    let control_plane = ControlPlaneSettings {
        base_url,
        token,
        request_timeout_secs: cp_file
            .request_timeout_secs
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
    };

    let config = Config {
        database_path,
        poll_initial_delay_secs,
        poll_interval_secs,
        failure_redelivery_secs,
        verbose,
        ssh,
        slurm,
        control_plane,
        config_path: config_path.clone(),
    };

    let report = ConfigReport {
        config_path,
        config_path_source,
        config_file_present,
        database_path: ConfigValue {
            value: config.database_path.clone(),
            source: database_source,
        },
        poll_interval_secs: ConfigValue {
            value: config.poll_interval_secs,
            source: poll_interval_source,
        },
        verbose: ConfigValue {
            value: config.verbose,
            source: verbose_source,
        },
        ssh_host: ConfigValue {
            value: config.ssh.host.clone(),
            source: ssh_host_source,
        },
        working_root: ConfigValue {
            value: config.slurm.working_root.clone(),
            source: working_root_source,
        },
        control_plane_url: ConfigValue {
            value: config.control_plane.base_url.clone(),
            source: base_url_source,
        },
        control_plane_token_source: token_source,
    };

    Ok(LoadResult { config, report })
}

pub fn ensure_database_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory {}", parent.display()))?;
    }
    Ok(())
}

fn read_config_file(path: &Path, required: bool) -> Result<FileConfig> {
    if !path.exists() {
        if required {
            anyhow::bail!("config file not found at {}", path.display());
        }
        return Ok(FileConfig::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn resolve_path(raw: &str, base_dir: Option<&Path>) -> PathBuf {
    let expanded = shellexpand::tilde(raw);
    let path = PathBuf::from(expanded.as_ref());
    if path.is_absolute() {
        return path;
    }
    match base_dir {
        Some(dir) => dir.join(path),
        None => path,
    }
}

fn expand_path(path: PathBuf) -> PathBuf {
    let path_string = path.to_string_lossy().to_string();
    let expanded = shellexpand::tilde(&path_string);
    PathBuf::from(expanded.as_ref())
}

fn config_path_from_env() -> Result<Option<PathBuf>> {
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(value) => {
            if value.is_empty() {
                anyhow::bail!("{CONFIG_ENV_VAR} is set but empty");
            }
            Ok(Some(PathBuf::from(value)))
        }
        None => Ok(None),
    }
}

fn default_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("failed to resolve config directory")?;
    Ok(base.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}

fn default_database_path() -> Result<PathBuf> {
    let base = dirs::data_dir().context("failed to resolve data directory")?;
    Ok(base.join(APP_DIR_NAME).join(DATABASE_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use std::sync::Mutex;
    use tempfile::TempDir;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct EnvVarGuard {
        key: &'static str,
        prev: Option<OsString>,
    }

    impl EnvVarGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var_os(key);
            // SAFETY: tests serialize env mutations with ENV_LOCK.
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn clear(key: &'static str) -> Self {
            let prev = std::env::var_os(key);
            // SAFETY: tests serialize env mutations with ENV_LOCK.
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            // SAFETY: tests serialize env mutations with ENV_LOCK.
            unsafe {
                match &self.prev {
                    Some(value) => std::env::set_var(self.key, value),
                    None => std::env::remove_var(self.key),
                }
            }
        }
    }

    const MINIMAL: &str = r#"
database_path = "db/hpcbridge.sqlite"

[ssh]
host = "login.cluster.org"
username = "svc-hpc"
identity_path = "keys/id_ed25519"

[slurm]
account = "proj42"
working_root = "/scratch/hpc"

[control_plane]
base_url = "https://cloud.example.org"
token = "s3cret"
"#;

    fn write_config(dir: &TempDir, contents: &str) -> PathBuf {
        let config_dir = dir.path().join("config");
        fs::create_dir_all(&config_dir).unwrap();
        let path = config_dir.join("hpcbridge.toml");
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn missing_optional_config_file_is_ok() {
        let dir = TempDir::new().unwrap();
        let cfg = read_config_file(&dir.path().join("missing.toml"), false).unwrap();
        assert!(cfg.database_path.is_none());
        assert!(cfg.ssh.host.is_none());
    }

    #[test]
    fn missing_required_config_file_errors() {
        let dir = TempDir::new().unwrap();
        let err = read_config_file(&dir.path().join("missing.toml"), true).unwrap_err();
        assert!(err.to_string().contains("config file not found"));
    }

    #[test]
    fn minimal_config_fills_defaults_and_resolves_paths() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, MINIMAL);
        let config_dir = path.parent().unwrap().to_path_buf();

        let LoadResult { config, report } =
            load_with_report(Some(path.clone()), Overrides::default()).unwrap();

        assert_eq!(config.database_path, config_dir.join("db/hpcbridge.sqlite"));
        assert_eq!(config.ssh.identity_path, config_dir.join("keys/id_ed25519"));
        assert_eq!(config.ssh.port, DEFAULT_SSH_PORT);
        assert_eq!(config.ssh.pool_size, DEFAULT_POOL_SIZE);
        assert_eq!(config.poll_interval_secs, DEFAULT_POLL_INTERVAL_SECS);
        assert_eq!(config.poll_initial_delay_secs, DEFAULT_POLL_INITIAL_DELAY_SECS);
        assert_eq!(config.slurm.sentinel_handle, None);
        assert_eq!(config.control_plane.token, "s3cret");
        assert_eq!(config.config_path, Some(path));
        assert_eq!(report.poll_interval_secs.source, ConfigSource::Default);
        assert_eq!(report.control_plane_token_source, ConfigSource::ConfigFile);
    }

    #[test]
    fn overrides_take_precedence_per_field() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, &format!("{MINIMAL}\n"));

        let LoadResult { config, report } = load_with_report(
            Some(path),
            Overrides {
                poll_interval_secs: Some(7),
                control_plane_token: Some("from-env".into()),
                verbose: Some(true),
                ..Overrides::default()
            },
        )
        .unwrap();

        assert_eq!(config.poll_interval_secs, 7);
        assert_eq!(config.control_plane.token, "from-env");
        assert!(config.verbose);
        assert_eq!(config.ssh.host, "login.cluster.org");
        assert_eq!(report.poll_interval_secs.source, ConfigSource::Override);
        assert_eq!(report.ssh_host.source, ConfigSource::ConfigFile);
        assert_eq!(report.control_plane_token_source, ConfigSource::Override);
    }

    #[test]
    fn missing_required_settings_are_named() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, &MINIMAL.replace("account = \"proj42\"", ""));
        let err = load(Some(path), Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("slurm.account"));
    }

    #[test]
    fn relative_working_root_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, &MINIMAL.replace("/scratch/hpc", "scratch/hpc"));
        let err = load(Some(path), Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("working_root"));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, &format!("poll_interval_secs = 0\n{MINIMAL}"));
        let err = load(Some(path), Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("poll_interval_secs"));
    }

    #[test]
    fn sentinel_handle_is_read_from_slurm_section() {
        let dir = TempDir::new().unwrap();
        let contents = MINIMAL.replace(
            "working_root = \"/scratch/hpc\"",
            "working_root = \"/scratch/hpc\"\nsentinel_handle = 999",
        );
        let path = write_config(&dir, &contents);
        let config = load(Some(path), Overrides::default()).unwrap();
        assert_eq!(config.slurm.sentinel_handle, Some(999));
    }

    #[test]
    fn debug_output_redacts_the_token() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, MINIMAL);
        let config = load(Some(path), Overrides::default()).unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn ensure_database_dir_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("nested").join("hpcbridge.sqlite");
        ensure_database_dir(&db_path).unwrap();
        assert!(dir.path().join("nested").is_dir());
    }

    #[test]
    fn env_config_path_used_when_no_override() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _env = EnvVarGuard::clear(CONFIG_ENV_VAR);
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, MINIMAL);
        let _env = EnvVarGuard::set(CONFIG_ENV_VAR, path.to_str().unwrap());

        let LoadResult { config, report } = load_with_report(None, Overrides::default()).unwrap();
        assert_eq!(config.config_path, Some(path));
        assert_eq!(report.config_path_source, Some(ConfigSource::Env));
    }

    #[test]
    fn cli_config_path_takes_precedence_over_env() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _env = EnvVarGuard::clear(CONFIG_ENV_VAR);
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join("env.toml");
        fs::write(&env_path, MINIMAL.replace("proj42", "from-env")).unwrap();
        let cli_path = write_config(&dir, MINIMAL);
        let _env = EnvVarGuard::set(CONFIG_ENV_VAR, env_path.to_str().unwrap());

        let LoadResult { config, report } =
            load_with_report(Some(cli_path.clone()), Overrides::default()).unwrap();
        assert_eq!(config.slurm.account, "proj42");
        assert_eq!(config.config_path, Some(cli_path));
        assert_eq!(report.config_path_source, Some(ConfigSource::Override));
    }
}
