//! Free space checks run before the intermediate cluster is created.

use std::collections::BTreeSet;
use std::fmt;

use anyhow::Context;
use camino::Utf8Path;
use nix::sys::{stat, statvfs};

/// Space on the filesystem holding some directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemUsage {
    /// Device id, so that directories sharing a filesystem are only counted once.
    pub filesystem: String,
    pub path: String,
    pub available_kib: u64,
    pub total_kib: u64,
}

/// Measures the filesystem holding `dir`. A directory that does not exist yet is measured
/// through its closest existing ancestor.
pub fn usage(dir: &Utf8Path) -> anyhow::Result<FilesystemUsage> {
    let existing = dir
        .ancestors()
        .find(|p| p.exists())
        .with_context(|| format!("no ancestor of {dir} exists"))?;

    let vfs = statvfs::statvfs(existing.as_std_path())
        .with_context(|| format!("statvfs {existing}"))?;
    let st = stat::stat(existing.as_std_path()).with_context(|| format!("stat {existing}"))?;

    let fragment = vfs.fragment_size() as u64;
    Ok(FilesystemUsage {
        filesystem: st.st_dev.to_string(),
        path: dir.to_string(),
        available_kib: vfs.blocks_available() as u64 * fragment / 1024,
        total_kib: vfs.blocks() as u64 * fragment / 1024,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shortfall {
    pub host: String,
    pub path: String,
    pub available_kib: u64,
    pub required_kib: u64,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub struct DiskSpaceError {
    pub shortfalls: Vec<Shortfall>,
}

impl fmt::Display for DiskSpaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut table = comfy_table::Table::new();
        table.load_preset(comfy_table::presets::NOTHING);
        table.set_header(["Hostname", "Filesystem", "Shortfall", "Available", "Required"]);
        for s in &self.shortfalls {
            table.add_row([
                s.host.clone(),
                s.path.clone(),
                format_kib(s.required_kib - s.available_kib),
                format_kib(s.available_kib),
                format_kib(s.required_kib),
            ]);
        }
        write!(f, "You currently do not have enough disk space to run an upgrade.\n\n{table}")
    }
}

/// Checks that at least `ratio` of every filesystem is free. Each `(host, filesystem)` is
/// judged once, by the first usage reported for it.
pub fn check(usages: &[(String, FilesystemUsage)], ratio: f64) -> Result<(), DiskSpaceError> {
    let mut seen = BTreeSet::new();
    let mut shortfalls = Vec::new();

    for (host, usage) in usages {
        if !seen.insert((host.as_str(), usage.filesystem.as_str())) {
            continue;
        }
        let required_kib = (usage.total_kib as f64 * ratio).ceil() as u64;
        if usage.available_kib < required_kib {
            shortfalls.push(Shortfall {
                host: host.clone(),
                path: usage.path.clone(),
                available_kib: usage.available_kib,
                required_kib,
            });
        }
    }

    if shortfalls.is_empty() {
        Ok(())
    } else {
        Err(DiskSpaceError { shortfalls })
    }
}

fn format_kib(kib: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    let mut value = kib as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{kib} KiB")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage_of(fs: &str, path: &str, available_kib: u64, total_kib: u64) -> FilesystemUsage {
        FilesystemUsage {
            filesystem: fs.to_string(),
            path: path.to_string(),
            available_kib,
            total_kib,
        }
    }

    #[test]
    fn reports_every_short_filesystem_once() {
        let usages = vec![
            ("cdw".to_string(), usage_of("64768", "/data/qddir", 500, 1000)),
            ("sdw1".to_string(), usage_of("64769", "/data/dbfast1", 100, 1000)),
            ("sdw1".to_string(), usage_of("64769", "/data/dbfast_mirror1", 100, 1000)),
            ("sdw2".to_string(), usage_of("64769", "/data/dbfast2", 700, 1000)),
        ];

        let err = check(&usages, 0.6).unwrap_err();
        assert_eq!(
            err.shortfalls,
            vec![
                Shortfall {
                    host: "cdw".to_string(),
                    path: "/data/qddir".to_string(),
                    available_kib: 500,
                    required_kib: 600,
                },
                Shortfall {
                    host: "sdw1".to_string(),
                    path: "/data/dbfast1".to_string(),
                    available_kib: 100,
                    required_kib: 600,
                },
            ]
        );

        let text = err.to_string();
        assert!(text.contains("Hostname"), "{text}");
        assert!(text.contains("500 KiB"), "{text}");
        assert!(!text.contains("sdw2"), "{text}");

        assert!(check(&usages, 0.05).is_ok());
    }

    #[test]
    fn measures_missing_directories_through_their_ancestor() {
        let tmp = camino_tempfile::tempdir().unwrap();
        let usage = usage(&tmp.path().join("not/yet/created")).unwrap();
        assert!(usage.total_kib > 0);
        assert!(usage.available_kib <= usage.total_kib);
        assert!(usage.path.ends_with("not/yet/created"));
    }

    #[test]
    fn human_sizes() {
        assert_eq!(format_kib(12), "12 KiB");
        assert_eq!(format_kib(1536), "1.5 MiB");
        assert_eq!(format_kib(3 * 1024 * 1024), "3.0 GiB");
    }
}
