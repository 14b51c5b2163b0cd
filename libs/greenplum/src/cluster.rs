use std::collections::{BTreeMap, BTreeSet, HashSet};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::segment::{Role, SegConfig, COORDINATOR_CONTENT_ID};
use crate::tablespaces::Tablespaces;
use crate::Version;

/// Which of the three clusters of an upgrade a [`Cluster`] value describes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display, strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Destination {
    Source,
    Intermediate,
    Target,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ClusterError {
    #[error("cluster has no coordinator (content -1, role primary)")]
    MissingCoordinator,
    #[error("cluster has more than one {role:?} for content {content_id}")]
    DuplicateSegment { content_id: i32, role: Role },
    #[error("primaries on host {host} share port {port}")]
    DuplicatePort { host: String, port: u16 },
    #[error("primaries on host {host} share data directory {data_dir}")]
    DuplicateDataDir { host: String, data_dir: Utf8PathBuf },
}

/// A Greenplum cluster: the coordinator, the standby, and all primary/mirror segments.
///
/// The coordinator is stored in `primaries` under content -1 and the standby, if any, in
/// `mirrors` under content -1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub destination: Destination,
    pub gphome: Utf8PathBuf,
    pub version: Version,
    #[serde(default)]
    pub catalog_version: String,
    pub primaries: BTreeMap<i32, SegConfig>,
    #[serde(default)]
    pub mirrors: BTreeMap<i32, SegConfig>,
    #[serde(default)]
    pub tablespaces: Tablespaces,
}

impl Cluster {
    pub fn new(
        destination: Destination,
        gphome: Utf8PathBuf,
        version: Version,
        segments: Vec<SegConfig>,
    ) -> Result<Cluster, ClusterError> {
        let mut primaries = BTreeMap::new();
        let mut mirrors = BTreeMap::new();

        for seg in segments {
            let map = match seg.role {
                Role::Primary => &mut primaries,
                Role::Mirror => &mut mirrors,
            };
            if map.contains_key(&seg.content_id) {
                return Err(ClusterError::DuplicateSegment {
                    content_id: seg.content_id,
                    role: seg.role,
                });
            }
            map.insert(seg.content_id, seg);
        }

        if !primaries.contains_key(&COORDINATOR_CONTENT_ID) {
            return Err(ClusterError::MissingCoordinator);
        }

        let mut ports = HashSet::new();
        let mut data_dirs = HashSet::new();
        for seg in primaries.values() {
            if !ports.insert((seg.hostname.as_str(), seg.port)) {
                return Err(ClusterError::DuplicatePort {
                    host: seg.hostname.clone(),
                    port: seg.port,
                });
            }
            if !data_dirs.insert((seg.hostname.as_str(), seg.data_dir.as_path())) {
                return Err(ClusterError::DuplicateDataDir {
                    host: seg.hostname.clone(),
                    data_dir: seg.data_dir.clone(),
                });
            }
        }

        Ok(Cluster {
            destination,
            gphome,
            version,
            catalog_version: String::new(),
            primaries,
            mirrors,
            tablespaces: Tablespaces::default(),
        })
    }

    pub fn coordinator(&self) -> &SegConfig {
        // Cluster::new refuses to build a cluster without one.
        &self.primaries[&COORDINATOR_CONTENT_ID]
    }

    pub fn coordinator_hostname(&self) -> &str {
        &self.coordinator().hostname
    }

    pub fn coordinator_port(&self) -> u16 {
        self.coordinator().port
    }

    pub fn coordinator_data_dir(&self) -> &Utf8PathBuf {
        &self.coordinator().data_dir
    }

    pub fn standby(&self) -> Option<&SegConfig> {
        self.mirrors.get(&COORDINATOR_CONTENT_ID)
    }

    pub fn has_standby(&self) -> bool {
        self.standby().is_some()
    }

    pub fn has_mirrors(&self) -> bool {
        self.mirrors_excluding_standby().next().is_some()
    }

    /// True when every primary segment has a mirror and the coordinator has a standby.
    pub fn has_all_mirrors_and_standby(&self) -> bool {
        self.has_standby()
            && self
                .primaries_excluding_coordinator()
                .all(|p| self.mirrors.contains_key(&p.content_id))
    }

    pub fn primaries_excluding_coordinator(&self) -> impl Iterator<Item = &SegConfig> {
        self.primaries.values().filter(|s| s.is_primary())
    }

    pub fn mirrors_excluding_standby(&self) -> impl Iterator<Item = &SegConfig> {
        self.mirrors.values().filter(|s| s.is_mirror())
    }

    /// Every segment, coordinator first, then in content order with each primary before its mirror.
    pub fn segments(&self) -> impl Iterator<Item = &SegConfig> {
        self.primaries
            .iter()
            .flat_map(move |(content, p)| std::iter::once(p).chain(self.mirrors.get(content)))
    }

    /// Content ids of the data segments, ascending.
    pub fn content_ids(&self) -> Vec<i32> {
        self.primaries_excluding_coordinator()
            .map(|s| s.content_id)
            .collect()
    }

    /// Hosts of every segment other than the coordinator, sorted. These are the hosts that
    /// run an agent, which includes the coordinator's host when it also runs segments.
    pub fn hosts(&self) -> Vec<String> {
        let hosts: BTreeSet<&str> = self
            .segments()
            .filter(|s| !s.is_coordinator())
            .map(|s| s.hostname.as_str())
            .collect();
        hosts.into_iter().map(str::to_string).collect()
    }

    /// Hosts running at least one primary segment, excluding the coordinator.
    pub fn primary_hosts(&self) -> Vec<String> {
        let hosts: BTreeSet<&str> = self
            .primaries_excluding_coordinator()
            .map(|s| s.hostname.as_str())
            .collect();
        hosts.into_iter().map(str::to_string).collect()
    }

    /// Primaries (excluding the coordinator) grouped by host.
    pub fn primaries_by_host(&self) -> BTreeMap<String, Vec<&SegConfig>> {
        let mut by_host: BTreeMap<String, Vec<&SegConfig>> = BTreeMap::new();
        for seg in self.primaries_excluding_coordinator() {
            by_host.entry(seg.hostname.clone()).or_default().push(seg);
        }
        by_host
    }

    /// All segments, coordinator included, grouped by host.
    pub fn segments_by_host(&self) -> BTreeMap<String, Vec<&SegConfig>> {
        let mut by_host: BTreeMap<String, Vec<&SegConfig>> = BTreeMap::new();
        for seg in self.segments() {
            by_host.entry(seg.hostname.clone()).or_default().push(seg);
        }
        by_host
    }

    /// Looks up the segment filling the same slot (content id and role) in this cluster.
    pub fn counterpart(&self, seg: &SegConfig) -> Option<&SegConfig> {
        match seg.role {
            Role::Primary => self.primaries.get(&seg.content_id),
            Role::Mirror => self.mirrors.get(&seg.content_id),
        }
    }

    pub fn bin_dir(&self) -> Utf8PathBuf {
        self.gphome.join("bin")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn seg(content_id: i32, db_id: i32, role: Role, host: &str, port: u16, dir: &str) -> SegConfig {
        SegConfig {
            db_id,
            content_id,
            role,
            hostname: host.to_string(),
            port,
            data_dir: dir.into(),
        }
    }

    fn example_cluster() -> Cluster {
        Cluster::new(
            Destination::Source,
            "/usr/local/gpdb5".into(),
            Version::new(5, 28, 0),
            vec![
                seg(-1, 1, Role::Primary, "cdw", 15432, "/data/qddir/seg-1"),
                seg(-1, 8, Role::Mirror, "smdw", 16432, "/data/standby/seg-1"),
                seg(0, 2, Role::Primary, "sdw1", 25432, "/data/dbfast1/seg0"),
                seg(1, 3, Role::Primary, "sdw2", 25433, "/data/dbfast2/seg1"),
                seg(0, 4, Role::Mirror, "sdw2", 25434, "/data/dbfast_mirror1/seg0"),
                seg(1, 5, Role::Mirror, "sdw1", 25435, "/data/dbfast_mirror2/seg1"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn derived_views() {
        let cluster = example_cluster();
        assert_eq!(cluster.coordinator().db_id, 1);
        assert_eq!(cluster.standby().unwrap().hostname, "smdw");
        assert!(cluster.has_mirrors());
        assert!(cluster.has_all_mirrors_and_standby());
        assert_eq!(cluster.hosts(), vec!["sdw1", "sdw2", "smdw"]);
        assert_eq!(cluster.primary_hosts(), vec!["sdw1", "sdw2"]);
        assert_eq!(cluster.content_ids(), vec![0, 1]);

        let order: Vec<i32> = cluster.segments().map(|s| s.db_id).collect();
        assert_eq!(order, vec![1, 8, 2, 4, 3, 5]);
    }

    #[test]
    fn rejects_invalid_topologies() {
        let err = Cluster::new(
            Destination::Source,
            "/usr/local/gpdb6".into(),
            Version::new(6, 0, 0),
            vec![seg(0, 2, Role::Primary, "sdw1", 25432, "/data/seg0")],
        )
        .unwrap_err();
        assert_eq!(err, ClusterError::MissingCoordinator);

        let err = Cluster::new(
            Destination::Source,
            "/usr/local/gpdb6".into(),
            Version::new(6, 0, 0),
            vec![
                seg(-1, 1, Role::Primary, "cdw", 15432, "/data/qddir/seg-1"),
                seg(0, 2, Role::Primary, "sdw1", 25432, "/data/seg0"),
                seg(1, 3, Role::Primary, "sdw1", 25432, "/data/seg1"),
            ],
        )
        .unwrap_err();
        assert_eq!(
            err,
            ClusterError::DuplicatePort {
                host: "sdw1".to_string(),
                port: 25432
            }
        );

        let err = Cluster::new(
            Destination::Source,
            "/usr/local/gpdb6".into(),
            Version::new(6, 0, 0),
            vec![
                seg(-1, 1, Role::Primary, "cdw", 15432, "/data/qddir/seg-1"),
                seg(0, 2, Role::Primary, "sdw1", 25432, "/data/seg0"),
                seg(0, 3, Role::Primary, "sdw2", 25433, "/data/seg0"),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, ClusterError::DuplicateSegment { content_id: 0, .. }));
    }

    #[test]
    fn partial_mirroring() {
        let mut cluster = example_cluster();
        cluster.mirrors.remove(&1);
        assert!(cluster.has_mirrors());
        assert!(!cluster.has_all_mirrors_and_standby());
    }

    #[test]
    fn json_round_trip() {
        let cluster = example_cluster();
        let json = serde_json::to_string_pretty(&cluster).unwrap();
        let back: Cluster = serde_json::from_str(&json).unwrap();
        assert_eq!(cluster, back);
    }
}
