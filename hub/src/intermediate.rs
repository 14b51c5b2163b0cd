//! Synthesis of the intermediate cluster: the target version cluster created next to the
//! source, with the same topology, on temporary ports and data directories.

use std::collections::{BTreeSet, HashMap, HashSet};

use camino::{Utf8Path, Utf8PathBuf};

use greenplum::{Cluster, ClusterError, Destination, SegConfig, Version};
use upgrade::UpgradeId;

pub const DEFAULT_TEMP_PORT_RANGE: &str = "50432-65535";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("invalid port range {0:?}")]
pub struct InvalidPortRangeError(pub String);

/// Parses a comma separated list of ports and `low-high` ranges into a sorted list
/// without duplicates. Port 0 is never valid.
pub fn sanitize_ports(input: &str) -> Result<Vec<u16>, InvalidPortRangeError> {
    let invalid = || InvalidPortRangeError(input.to_string());
    let mut ports = BTreeSet::new();

    for part in input.split(',').map(str::trim) {
        if part.is_empty() {
            return Err(invalid());
        }
        match part.split_once('-') {
            Some((low, high)) => {
                let low: u16 = low.trim().parse().map_err(|_| invalid())?;
                let high: u16 = high.trim().parse().map_err(|_| invalid())?;
                if low > high {
                    return Err(invalid());
                }
                ports.extend(low..=high);
            }
            None => {
                ports.insert(part.parse::<u16>().map_err(|_| invalid())?);
            }
        }
    }
    if ports.contains(&0) {
        return Err(invalid());
    }
    Ok(ports.into_iter().collect())
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error(
    "temp_port_range contains port {port} which overlaps with the source cluster ports on host {host}. Specify a non-overlapping temp_port_range."
)]
pub struct InvalidTempPortRangeError {
    pub host: String,
    pub port: u16,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum IntermediateError {
    #[error("not enough ports in temp_port_range: {available} given")]
    NotEnoughPorts { available: usize },
    #[error(transparent)]
    Overlap(#[from] InvalidTempPortRangeError),
    #[error("coordinator data directory {0} does not end in -1")]
    CoordinatorDataDir(Utf8PathBuf),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// The name shared by all data directories of the source, e.g. `demoDataDir` for a
/// coordinator at `/data/qddir/demoDataDir-1`.
pub fn segment_prefix(source: &Cluster) -> Result<String, IntermediateError> {
    let dir = source.coordinator_data_dir();
    dir.file_name()
        .and_then(|name| name.strip_suffix("-1"))
        .filter(|prefix| !prefix.is_empty())
        .map(str::to_string)
        .ok_or_else(|| IntermediateError::CoordinatorDataDir(dir.clone()))
}

/// Data directory of an intermediate segment, next to the source's: `demoDataDir0`
/// becomes `demoDataDir.<id>.0`. Directories not named after the prefix get `.<id>`
/// appended.
pub fn temp_data_dir(source_dir: &Utf8Path, prefix: &str, id: &UpgradeId) -> Utf8PathBuf {
    let parent = source_dir.parent().unwrap_or(Utf8Path::new("/"));
    let name = source_dir.file_name().unwrap_or_default();
    match name.strip_prefix(prefix) {
        Some(suffix) => parent.join(format!("{prefix}.{id}.{suffix}")),
        None => parent.join(format!("{name}.{id}")),
    }
}

/// Hands out ports from the temp port list. The coordinator and standby take the first
/// ports, and every host then gets its own run of ports starting right after them.
struct PortAssigner<'a> {
    ports: &'a [u16],
    next: usize,
    per_host: HashMap<String, usize>,
}

impl<'a> PortAssigner<'a> {
    fn new(ports: &'a [u16]) -> Self {
        PortAssigner {
            ports,
            next: 0,
            per_host: HashMap::new(),
        }
    }

    fn take(&mut self) -> Result<u16, IntermediateError> {
        let port = self.port_at(self.next)?;
        self.next += 1;
        Ok(port)
    }

    fn take_on(&mut self, host: &str) -> Result<u16, IntermediateError> {
        let next = self.next;
        let index = *self.per_host.entry(host.to_string()).or_insert(next);
        let port = self.port_at(index)?;
        self.per_host.insert(host.to_string(), index + 1);
        Ok(port)
    }

    fn port_at(&self, index: usize) -> Result<u16, IntermediateError> {
        self.ports
            .get(index)
            .copied()
            .ok_or(IntermediateError::NotEnoughPorts {
                available: self.ports.len(),
            })
    }
}

/// Builds the intermediate cluster for `source`, on `ports` (sorted, no duplicates).
pub fn create(
    source: &Cluster,
    ports: &[u16],
    id: &UpgradeId,
    target_gphome: &Utf8Path,
    target_version: Version,
) -> Result<Cluster, IntermediateError> {
    let prefix = segment_prefix(source)?;
    let mut assigner = PortAssigner::new(ports);
    let mut segments = Vec::new();

    let intermediate = |seg: &SegConfig, port: u16| SegConfig {
        port,
        data_dir: temp_data_dir(&seg.data_dir, &prefix, id),
        ..seg.clone()
    };

    segments.push(intermediate(source.coordinator(), assigner.take()?));
    if let Some(standby) = source.standby() {
        segments.push(intermediate(standby, assigner.take()?));
    }
    for seg in source.primaries_excluding_coordinator() {
        let port = assigner.take_on(&seg.hostname)?;
        segments.push(intermediate(seg, port));
    }
    for seg in source.mirrors_excluding_standby() {
        let port = assigner.take_on(&seg.hostname)?;
        segments.push(intermediate(seg, port));
    }

    ensure_temp_port_range_does_not_overlap(source, &segments)?;

    Ok(Cluster::new(
        Destination::Intermediate,
        target_gphome.to_owned(),
        target_version,
        segments,
    )?)
}

/// Fails if an intermediate segment would listen on a port a source segment uses on the
/// same host.
pub fn ensure_temp_port_range_does_not_overlap(
    source: &Cluster,
    intermediate: &[SegConfig],
) -> Result<(), InvalidTempPortRangeError> {
    let used: HashSet<(&str, u16)> = source
        .segments()
        .map(|s| (s.hostname.as_str(), s.port))
        .collect();

    match intermediate
        .iter()
        .find(|s| used.contains(&(s.hostname.as_str(), s.port)))
    {
        Some(seg) => Err(InvalidTempPortRangeError {
            host: seg.hostname.clone(),
            port: seg.port,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use greenplum::Role;
    use proptest::prelude::*;

    use super::*;

    fn seg(content_id: i32, db_id: i32, role: Role, host: &str, port: u16, dir: &str) -> SegConfig {
        SegConfig {
            db_id,
            content_id,
            role,
            hostname: host.to_string(),
            port,
            data_dir: dir.into(),
        }
    }

    fn source() -> Cluster {
        Cluster::new(
            Destination::Source,
            "/usr/local/gpdb5".into(),
            Version::new(5, 29, 10),
            vec![
                seg(-1, 1, Role::Primary, "cdw", 5432, "/data/qddir/demoDataDir-1"),
                seg(-1, 8, Role::Mirror, "scdw", 5432, "/data/standby/demoDataDir-1"),
                seg(0, 2, Role::Primary, "sdw1", 25432, "/data/dbfast1/demoDataDir0"),
                seg(1, 3, Role::Primary, "sdw1", 25433, "/data/dbfast1/demoDataDir1"),
                seg(2, 4, Role::Primary, "sdw2", 25432, "/data/dbfast2/demoDataDir2"),
                seg(3, 5, Role::Primary, "sdw2", 25433, "/data/dbfast2/demoDataDir3"),
                seg(0, 6, Role::Mirror, "sdw2", 25434, "/data/dbfast_mirror1/demoDataDir0"),
                seg(1, 7, Role::Mirror, "sdw2", 25435, "/data/dbfast_mirror1/demoDataDir1"),
                seg(2, 9, Role::Mirror, "sdw1", 25434, "/data/dbfast_mirror2/demoDataDir2"),
                seg(3, 10, Role::Mirror, "sdw1", 25435, "/data/dbfast_mirror2/demoDataDir3"),
            ],
        )
        .unwrap()
    }

    fn create_on(source: &Cluster, ports: &[u16]) -> Result<Cluster, IntermediateError> {
        create(
            source,
            ports,
            &UpgradeId::from("ABC123xyz_-"),
            Utf8Path::new("/usr/local/gpdb6"),
            Version::new(6, 26, 0),
        )
    }

    #[test]
    fn port_lists_and_ranges() {
        assert_eq!(
            sanitize_ports("50432-50434,50433, 6000").unwrap(),
            vec![6000, 50432, 50433, 50434]
        );
        assert_eq!(sanitize_ports("15432").unwrap(), vec![15432]);
        for bad in ["", "1,,2", "5-3", "abc", "70000", "1-70000", "0", "0-10", "6000,0"] {
            assert_eq!(
                sanitize_ports(bad),
                Err(InvalidPortRangeError(bad.to_string())),
                "{bad}"
            );
        }
    }

    #[test]
    fn assigns_ports_per_host() {
        let ports: Vec<u16> = (50432..50442).collect();
        let cluster = create_on(&source(), &ports).unwrap();

        assert_eq!(cluster.destination, Destination::Intermediate);
        assert_eq!(cluster.coordinator_port(), 50432);
        assert_eq!(cluster.standby().unwrap().port, 50433);

        let port_of = |content: i32, role: Role| {
            let map = match role {
                Role::Primary => &cluster.primaries,
                Role::Mirror => &cluster.mirrors,
            };
            map[&content].port
        };
        // sdw1 runs primaries 0, 1 then mirrors 2, 3
        assert_eq!(port_of(0, Role::Primary), 50434);
        assert_eq!(port_of(1, Role::Primary), 50435);
        assert_eq!(port_of(2, Role::Mirror), 50436);
        assert_eq!(port_of(3, Role::Mirror), 50437);
        // sdw2 runs primaries 2, 3 then mirrors 0, 1
        assert_eq!(port_of(2, Role::Primary), 50434);
        assert_eq!(port_of(3, Role::Primary), 50435);
        assert_eq!(port_of(0, Role::Mirror), 50436);
        assert_eq!(port_of(1, Role::Mirror), 50437);
    }

    #[test]
    fn keeps_topology_and_renames_data_dirs() {
        let source = source();
        let ports: Vec<u16> = (50432..50442).collect();
        let cluster = create_on(&source, &ports).unwrap();

        assert_eq!(cluster.version, Version::new(6, 26, 0));
        assert_eq!(cluster.gphome, "/usr/local/gpdb6");
        assert_eq!(
            cluster.coordinator_data_dir(),
            "/data/qddir/demoDataDir.ABC123xyz_-.-1"
        );
        assert_eq!(
            cluster.mirrors[&0].data_dir,
            "/data/dbfast_mirror1/demoDataDir.ABC123xyz_-.0"
        );
        for seg in source.segments() {
            let counterpart = cluster.counterpart(seg).unwrap();
            assert_eq!(counterpart.db_id, seg.db_id);
            assert_eq!(counterpart.hostname, seg.hostname);
        }
    }

    #[test]
    fn runs_out_of_ports() {
        let err = create_on(&source(), &[30432, 30433]).unwrap_err();
        assert_eq!(err, IntermediateError::NotEnoughPorts { available: 2 });
        assert!(err.to_string().contains("not enough ports"));
    }

    #[test]
    fn refuses_ports_used_by_the_source() {
        let source = Cluster::new(
            Destination::Source,
            "/usr/local/gpdb5".into(),
            Version::new(5, 29, 10),
            vec![
                seg(-1, 1, Role::Primary, "cdw", 5432, "/data/qddir/demoDataDir-1"),
                seg(0, 2, Role::Primary, "sdw1", 25432, "/data/dbfast1/demoDataDir0"),
                seg(1, 3, Role::Primary, "sdw2", 25433, "/data/dbfast2/demoDataDir1"),
            ],
        )
        .unwrap();

        let err = create_on(&source, &[25431, 25432, 25433]).unwrap_err();
        assert_eq!(
            err,
            IntermediateError::Overlap(InvalidTempPortRangeError {
                host: "sdw1".to_string(),
                port: 25432,
            })
        );
    }

    #[test]
    fn requires_a_conventional_coordinator_dir() {
        let source = Cluster::new(
            Destination::Source,
            "/usr/local/gpdb5".into(),
            Version::new(5, 29, 10),
            vec![seg(-1, 1, Role::Primary, "cdw", 5432, "/data/qddir/coordinator")],
        )
        .unwrap();
        assert_eq!(
            segment_prefix(&source),
            Err(IntermediateError::CoordinatorDataDir(
                "/data/qddir/coordinator".into()
            ))
        );
    }

    #[test]
    fn unconventional_segment_dirs_get_the_id_appended() {
        let id = UpgradeId::from("ABC123xyz_-");
        assert_eq!(
            temp_data_dir(Utf8Path::new("/data/primary/gpseg7"), "demoDataDir", &id),
            "/data/primary/gpseg7.ABC123xyz_-"
        );
    }

    proptest! {
        #[test]
        fn never_reuses_source_ports(
            seg_ports in proptest::collection::vec(20000u16..20010, 4),
            temp in proptest::collection::btree_set(20000u16..20020, 0..20),
        ) {
            let hosts = ["sdw1", "sdw2"];
            let mut segs = vec![seg(-1, 1, Role::Primary, "cdw", 20000, "/data/qddir/demoDataDir-1")];
            let mut used = HashSet::new();
            for (content, port) in seg_ports.iter().enumerate() {
                let host = hosts[content % 2];
                prop_assume!(used.insert((host, *port)));
                segs.push(seg(
                    content as i32,
                    content as i32 + 2,
                    Role::Primary,
                    host,
                    *port,
                    &format!("/data/primary/demoDataDir{content}"),
                ));
            }
            let source = Cluster::new(
                Destination::Source,
                "/usr/local/gpdb5".into(),
                Version::new(5, 29, 10),
                segs,
            )
            .unwrap();

            let temp: Vec<u16> = temp.into_iter().collect();
            match create_on(&source, &temp) {
                Ok(cluster) => {
                    for seg in cluster.segments() {
                        prop_assert!(
                            !source.segments().any(|s| s.hostname == seg.hostname && s.port == seg.port)
                        );
                        prop_assert!(temp.contains(&seg.port));
                    }
                }
                Err(IntermediateError::NotEnoughPorts { available }) => {
                    prop_assert_eq!(available, temp.len());
                }
                Err(IntermediateError::Overlap(e)) => {
                    prop_assert!(source.segments().any(|s| s.hostname == e.host && s.port == e.port));
                }
                Err(e) => prop_assert!(false, "unexpected error {e}"),
            }
        }
    }
}
