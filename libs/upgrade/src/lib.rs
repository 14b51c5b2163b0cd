//! State and host-local mechanics of one upgrade, shared by the CLI, the hub and the
//! agents.

pub mod archive;
pub mod backup_dirs;
mod config;
pub mod data_dirs;
pub mod disk;
pub mod environment;
mod id;
pub mod paths;
pub mod pg_upgrade;
pub mod rename;
pub mod wire;

pub use backup_dirs::{BackupDirs, MissingHostInParentBackupDirsError, ParseBackupDirsError};
pub use config::{
    default_disk_free_ratio, Config, DEFAULT_AGENT_PORT, DEFAULT_DYNAMIC_LIBRARY_PATH,
    DEFAULT_HUB_PORT,
};
pub use id::UpgradeId;
pub use rename::RenamePair;
