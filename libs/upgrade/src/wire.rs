//! Conversions between the agent protocol's messages and the types the hub and agents
//! work with.

use anyhow::Context;
use camino::Utf8PathBuf;

use upgrade_proto::idl;
use utils::rsync::{self, RsyncOption};

use crate::disk::FilesystemUsage;
use crate::RenamePair;

pub fn rsync_to_proto(opts: &rsync::Options) -> idl::RsyncOptions {
    idl::RsyncOptions {
        sources: opts.sources.clone(),
        destination_host: opts.destination_host.clone().unwrap_or_default(),
        destination: opts.destination.clone(),
        options: opts.options.iter().map(|o| o.to_string()).collect(),
        excludes: opts.excludes.clone(),
    }
}

pub fn rsync_from_proto(opts: &idl::RsyncOptions) -> anyhow::Result<rsync::Options> {
    let options = opts
        .options
        .iter()
        .map(|o| {
            o.parse::<RsyncOption>()
                .with_context(|| format!("unknown rsync option {o:?}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut parsed = rsync::Options::new(opts.sources.clone(), opts.destination.clone())
        .with_options(&options)
        .with_excludes(opts.excludes.iter().cloned());
    if !opts.destination_host.is_empty() {
        parsed = parsed.to_host(opts.destination_host.clone());
    }
    Ok(parsed)
}

pub fn rename_pair_to_proto(pair: &RenamePair) -> idl::RenamePair {
    idl::RenamePair {
        source: pair.source.to_string(),
        target: pair.target.to_string(),
    }
}

pub fn rename_pair_from_proto(pair: &idl::RenamePair) -> RenamePair {
    RenamePair::new(&pair.source, &pair.target)
}

pub fn usage_to_proto(usage: &FilesystemUsage) -> idl::DiskUsage {
    idl::DiskUsage {
        filesystem: usage.filesystem.clone(),
        path: usage.path.clone(),
        available_kib: usage.available_kib,
        total_kib: usage.total_kib,
    }
}

pub fn usage_from_proto(usage: idl::DiskUsage) -> FilesystemUsage {
    FilesystemUsage {
        filesystem: usage.filesystem,
        path: usage.path,
        available_kib: usage.available_kib,
        total_kib: usage.total_kib,
    }
}

pub fn paths(paths: &[String]) -> Vec<Utf8PathBuf> {
    paths.iter().map(Utf8PathBuf::from).collect()
}
