//! Swapping the intermediate cluster's data directories into the source's places.
//!
//! For each pair the source directory moves aside to `<source>.old`, then the
//! intermediate directory takes its place. Both renames are repeatable: a rerun after a
//! crash finishes whatever the previous attempt left half done.

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{info, warn};

use utils::crashsafe::path_with_suffix;
use utils::fs_ext::rename_no_replace;

pub const OLD_SUFFIX: &str = ".old";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenamePair {
    pub source: Utf8PathBuf,
    pub target: Utf8PathBuf,
}

impl RenamePair {
    pub fn new(source: impl Into<Utf8PathBuf>, target: impl Into<Utf8PathBuf>) -> RenamePair {
        RenamePair {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// `<dir>.old`
pub fn archive_path(dir: &Utf8Path) -> Utf8PathBuf {
    path_with_suffix(dir, OLD_SUFFIX)
}

fn rename(from: &Utf8Path, to: &Utf8Path) -> anyhow::Result<()> {
    info!("renaming {from} to {to}");
    rename_no_replace(from, to).with_context(|| format!("rename {from} to {to}"))
}

fn rename_pair(pair: &RenamePair) -> anyhow::Result<()> {
    let archive = archive_path(&pair.source);

    if archive.exists() && pair.source.exists() && !pair.target.exists() {
        info!("{} was already renamed", pair.target);
        return Ok(());
    }

    if !archive.exists() {
        rename(&pair.source, &archive)?;
    }

    if let Err(e) = rename(&pair.target, &pair.source) {
        if let Err(undo) = rename(&archive, &pair.source) {
            warn!("could not undo rename of {}: {undo:#}", pair.source);
        }
        return Err(e);
    }
    Ok(())
}

fn revert_pair(pair: &RenamePair) -> anyhow::Result<()> {
    let archive = archive_path(&pair.source);
    if !archive.exists() {
        // never renamed, or already reverted
        return Ok(());
    }

    if pair.source.exists() && !pair.target.exists() {
        rename(&pair.source, &pair.target)?;
    }
    rename(&archive, &pair.source)
}

/// Renames every pair in order. If one fails, the pairs renamed so far are put back in
/// reverse order before the error is returned.
pub fn rename_data_directories(pairs: &[RenamePair]) -> anyhow::Result<()> {
    for (i, pair) in pairs.iter().enumerate() {
        if let Err(e) = rename_pair(pair) {
            for done in pairs[..i].iter().rev() {
                if let Err(undo) = revert_pair(done) {
                    warn!("could not undo rename of {}: {undo:#}", done.source);
                }
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Undoes [`rename_data_directories`]. Pairs that were never renamed are left alone.
pub fn revert_renamed_data_directories(pairs: &[RenamePair]) -> anyhow::Result<()> {
    for pair in pairs.iter().rev() {
        revert_pair(pair)?;
    }
    Ok(())
}
