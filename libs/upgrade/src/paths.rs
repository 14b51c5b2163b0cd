//! Per-user directories holding the upgrade's state and logs.

use anyhow::Context;
use camino::Utf8PathBuf;

pub const STATE_DIR_ENV: &str = "GPUPGRADE_HOME";
pub const LOG_DIR_ENV: &str = "GPUPGRADE_LOG_DIR";

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const INIT_CONFIG_FILE_NAME: &str = "gpinitsystem_config";
pub const OLD_TABLESPACES_FILE_NAME: &str = "old_tablespaces.txt";

fn home_dir() -> anyhow::Result<Utf8PathBuf> {
    let home = home::home_dir().context("could not determine the home directory")?;
    Utf8PathBuf::from_path_buf(home)
        .map_err(|p| anyhow::anyhow!("home directory {} is not valid UTF-8", p.display()))
}

fn from_env_or(var: &str, default: impl FnOnce() -> anyhow::Result<Utf8PathBuf>) -> anyhow::Result<Utf8PathBuf> {
    match std::env::var(var) {
        Ok(dir) if !dir.is_empty() => Ok(Utf8PathBuf::from(dir)),
        _ => default(),
    }
}

/// `$GPUPGRADE_HOME`, or `~/.gpupgrade`.
pub fn state_dir() -> anyhow::Result<Utf8PathBuf> {
    from_env_or(STATE_DIR_ENV, || Ok(home_dir()?.join(".gpupgrade")))
}

/// `$GPUPGRADE_LOG_DIR`, or `~/gpAdminLogs/gpupgrade`.
pub fn log_dir() -> anyhow::Result<Utf8PathBuf> {
    from_env_or(LOG_DIR_ENV, || {
        Ok(home_dir()?.join("gpAdminLogs").join("gpupgrade"))
    })
}

/// Where the data migration scripts are generated by default. Outside the state
/// directory so that the post-finalize scripts outlive finalize.
pub fn data_migration_dir() -> anyhow::Result<Utf8PathBuf> {
    Ok(home_dir()?.join("gpupgrade").join("data-migration-scripts"))
}

/// Log file for `process` (`cli`, `hub`, or `agent`) for today.
pub fn log_file(process: &str) -> anyhow::Result<Utf8PathBuf> {
    let today = chrono::Local::now().format("%Y%m%d");
    Ok(log_dir()?.join(format!("{process}_{today}.log")))
}
