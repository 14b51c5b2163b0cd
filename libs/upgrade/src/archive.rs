//! Moving the log directory aside once an upgrade is over, so the next upgrade starts
//! with a fresh one.

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDateTime;
use tracing::info;

use crate::UpgradeId;

/// `<parent of log_dir>/gpupgrade-<id>-<YYYYMMDDThhmmss>`
pub fn archive_dir_name(log_dir: &Utf8Path, id: &UpgradeId, at: NaiveDateTime) -> Utf8PathBuf {
    let parent = log_dir.parent().unwrap_or(log_dir);
    parent.join(format!("gpupgrade-{id}-{}", at.format("%Y%m%dT%H%M%S")))
}

/// Renames `log_dir` to `archive_dir`. Succeeds without doing anything if there is no log
/// directory, which is the case on a rerun after it was archived.
pub fn archive_log_directory(log_dir: &Utf8Path, archive_dir: &Utf8Path) -> anyhow::Result<()> {
    if !log_dir.exists() {
        info!("no log directory {log_dir} to archive");
        return Ok(());
    }
    info!("archiving {log_dir} to {archive_dir}");
    utils::fs_ext::rename_no_replace(log_dir, archive_dir)
        .with_context(|| format!("archive log directory {log_dir} to {archive_dir}"))
}
