//! Per-host directories owned by the upgrade, holding what revert and the segment upgrades
//! need: the intermediate coordinator before and after its upgrade, and tablespaces.

use std::collections::{BTreeMap, BTreeSet};
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use greenplum::Cluster;

pub const BACKUP_DIR_NAME: &str = ".gpupgrade";

/// Pristine intermediate coordinator taken right after it was initialized.
pub fn pre_upgrade_coordinator(backup_dir: &Utf8Path) -> Utf8PathBuf {
    backup_dir.join("coordinator-pre-upgrade")
}

/// Upgraded intermediate coordinator, copied to every primary host.
pub fn post_upgrade_coordinator(backup_dir: &Utf8Path) -> Utf8PathBuf {
    backup_dir.join("coordinator-post-upgrade")
}

pub fn tablespaces(backup_dir: &Utf8Path) -> Utf8PathBuf {
    backup_dir.join("tablespaces")
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("parent_backup_dirs is missing hosts {}", .hosts.join(", "))]
pub struct MissingHostInParentBackupDirsError {
    /// Sorted.
    pub hosts: Vec<String>,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ParseBackupDirsError {
    #[error(transparent)]
    MissingHost(#[from] MissingHostInParentBackupDirsError),
    #[error("parent backup directory {0:?} is not an absolute path")]
    NotAbsolute(String),
    #[error("expected <host>:<path> in parent_backup_dirs, but got {0:?}")]
    Malformed(String),
}

/// Backup directory of the coordinator, and of every host running primaries.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BackupDirs {
    pub coordinator_backup_dir: Utf8PathBuf,
    pub agent_hosts_to_backup_dir: BTreeMap<String, Utf8PathBuf>,
}

impl BackupDirs {
    /// Parses `parent_backup_dirs`, either a single `/path` shared by every host or a
    /// `host:/path,host:/path` list that has to name the coordinator's host and every
    /// primary host. An empty string selects the defaults.
    pub fn parse(input: &str, source: &Cluster) -> Result<BackupDirs, ParseBackupDirsError> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(BackupDirs::default_for(source));
        }

        let coordinator_host = source.coordinator_hostname().to_string();
        let mut required: BTreeSet<String> = source.primary_hosts().into_iter().collect();
        required.insert(coordinator_host.clone());

        if !input.contains(':') {
            let parent = absolute(input)?;
            let dir = parent.join(BACKUP_DIR_NAME);
            return Ok(BackupDirs {
                coordinator_backup_dir: dir.clone(),
                agent_hosts_to_backup_dir: source
                    .primary_hosts()
                    .into_iter()
                    .map(|h| (h, dir.clone()))
                    .collect(),
            });
        }

        let mut parents = BTreeMap::new();
        for entry in input.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (host, path) = entry
                .split_once(':')
                .filter(|(host, _)| !host.is_empty())
                .ok_or_else(|| ParseBackupDirsError::Malformed(entry.to_string()))?;
            parents.insert(host.to_string(), absolute(path)?);
        }

        let missing: Vec<String> = required
            .iter()
            .filter(|h| !parents.contains_key(*h))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(MissingHostInParentBackupDirsError { hosts: missing }.into());
        }

        Ok(BackupDirs {
            coordinator_backup_dir: parents[&coordinator_host].join(BACKUP_DIR_NAME),
            agent_hosts_to_backup_dir: source
                .primary_hosts()
                .into_iter()
                .map(|h| {
                    let dir = parents[&h].join(BACKUP_DIR_NAME);
                    (h, dir)
                })
                .collect(),
        })
    }

    /// Next to the coordinator's data directory on the coordinator, and next to the first
    /// primary's data directory on every other host.
    pub fn default_for(source: &Cluster) -> BackupDirs {
        let beside = |data_dir: &Utf8Path| {
            data_dir
                .parent()
                .unwrap_or(data_dir)
                .join(BACKUP_DIR_NAME)
        };

        let mut agent_hosts_to_backup_dir = BTreeMap::new();
        for seg in source.primaries_excluding_coordinator() {
            agent_hosts_to_backup_dir
                .entry(seg.hostname.clone())
                .or_insert_with(|| beside(&seg.data_dir));
        }

        BackupDirs {
            coordinator_backup_dir: beside(source.coordinator_data_dir()),
            agent_hosts_to_backup_dir,
        }
    }

    pub fn for_host(&self, host: &str) -> Option<&Utf8Path> {
        self.agent_hosts_to_backup_dir.get(host).map(|p| p.as_path())
    }
}

fn absolute(path: &str) -> Result<Utf8PathBuf, ParseBackupDirsError> {
    let path = Utf8PathBuf::from(path.trim());
    if !path.is_absolute() {
        return Err(ParseBackupDirsError::NotAbsolute(path.into_string()));
    }
    Ok(path)
}

/// Creates `path`, any missing parents, and its tablespaces directory. Succeeds if they
/// already exist.
pub fn create_backup_directory(path: &Utf8Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(tablespaces(path))
}

pub fn delete_backup_directory(path: &Utf8Path) -> io::Result<()> {
    utils::fs_ext::remove_dir_all(path)
}
