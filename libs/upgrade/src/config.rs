//! `config.json`: everything the hub needs to know about an upgrade in progress.

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use greenplum::{Cluster, Mode, Version};
use utils::crashsafe;

use crate::backup_dirs::BackupDirs;
use crate::paths::CONFIG_FILE_NAME;
use crate::UpgradeId;

pub const DEFAULT_HUB_PORT: u16 = 7527;
pub const DEFAULT_AGENT_PORT: u16 = 6416;
pub const DEFAULT_DYNAMIC_LIBRARY_PATH: &str = "$libdir";

/// Default share of each filesystem that has to be free before initialize proceeds.
pub fn default_disk_free_ratio(mode: Mode) -> f64 {
    match mode {
        Mode::Copy => 0.60,
        Mode::Link => 0.20,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub upgrade_id: UpgradeId,
    pub mode: Mode,

    pub source: Cluster,
    /// Created by initialize's generate_target_config.
    #[serde(default)]
    pub intermediate: Option<Cluster>,
    /// The intermediate cluster as it looks after finalize.
    #[serde(default)]
    pub target: Option<Cluster>,

    pub hub_port: u16,
    pub agent_port: u16,
    /// Sorted and de-duplicated ports available to the intermediate cluster.
    pub intermediate_ports: Vec<u16>,
    pub backup_dirs: BackupDirs,
    pub use_hba_hostnames: bool,
    pub disk_free_ratio: f64,
    pub dynamic_library_path: String,

    pub source_gphome: Utf8PathBuf,
    pub target_gphome: Utf8PathBuf,
    pub target_version: Version,
    #[serde(default)]
    pub target_catalog_version: String,
    #[serde(default)]
    pub pg_upgrade_verbose: bool,
    /// Where finalize or revert moves the log directories. Chosen once, so that a rerun
    /// reports the same place.
    #[serde(default)]
    pub log_archive_dir: Option<Utf8PathBuf>,
}

impl Config {
    pub fn path(state_dir: &Utf8Path) -> Utf8PathBuf {
        state_dir.join(CONFIG_FILE_NAME)
    }

    pub fn load(state_dir: &Utf8Path) -> anyhow::Result<Config> {
        let path = Config::path(state_dir);
        let contents =
            std::fs::read(&path).with_context(|| format!("read configuration {path}"))?;
        serde_json::from_slice(&contents).with_context(|| format!("parse configuration {path}"))
    }

    /// Writes the whole configuration, replacing the previous file atomically.
    pub fn save(&self, state_dir: &Utf8Path) -> anyhow::Result<()> {
        crashsafe::create_dir_all(state_dir)?;
        let contents = serde_json::to_vec_pretty(self)?;
        crashsafe::overwrite(&Config::path(state_dir), &contents)
            .context("write configuration")
    }

    /// The intermediate cluster, which exists from generate_target_config onwards.
    pub fn intermediate(&self) -> anyhow::Result<&Cluster> {
        self.intermediate
            .as_ref()
            .context("the intermediate cluster has not been created yet")
    }

    pub fn link_mode(&self) -> bool {
        self.mode == Mode::Link
    }

    /// Where the intermediate cluster's own state lives, e.g. the `gpinitsystem` input file.
    pub fn init_config_path(state_dir: &Utf8Path) -> Utf8PathBuf {
        state_dir.join(crate::paths::INIT_CONFIG_FILE_NAME)
    }
}
