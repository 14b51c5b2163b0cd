//! The `gpinitsystem` input file describing the intermediate cluster.

use std::fmt::Write;

use greenplum::{Cluster, SegConfig};

pub struct InitConfig<'a> {
    pub intermediate: &'a Cluster,
    pub seg_prefix: &'a str,
    pub encoding: &'a str,
    /// Only set for targets that still have the setting, i.e. before 7.
    pub checkpoint_segments: Option<&'a str>,
    pub use_hba_hostnames: bool,
}

fn array_entry(seg: &SegConfig) -> String {
    format!(
        "{host}~{host}~{port}~{dir}~{db_id}~{content}",
        host = seg.hostname,
        port = seg.port,
        dir = seg.data_dir,
        db_id = seg.db_id,
        content = seg.content_id,
    )
}

impl InitConfig<'_> {
    /// The coordinator and primaries only. Mirrors and the standby are added in finalize.
    pub fn render(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = writeln!(out, "ARRAY_NAME=\"gp_upgrade cluster\"");
        let _ = writeln!(out, "SEG_PREFIX={}", self.seg_prefix);
        let _ = writeln!(out, "TRUSTED_SHELL=ssh");
        let _ = writeln!(out, "ENCODING={}", self.encoding);
        if self.use_hba_hostnames {
            let _ = writeln!(out, "HBA_HOSTNAMES=1");
        }
        if let Some(segments) = self.checkpoint_segments {
            let _ = writeln!(out, "CHECK_POINT_SEGMENTS={segments}");
        }
        let _ = writeln!(
            out,
            "QD_PRIMARY_ARRAY={}",
            array_entry(self.intermediate.coordinator())
        );
        let _ = writeln!(out, "declare -a PRIMARY_ARRAY=(");
        for seg in self.intermediate.primaries_excluding_coordinator() {
            let _ = writeln!(out, "{}", array_entry(seg));
        }
        let _ = writeln!(out, ")");
        out
    }
}

#[cfg(test)]
mod tests {
    use greenplum::{Destination, Role, Version};

    use super::*;

    #[test]
    fn lists_coordinator_and_primaries() {
        let seg = |content_id, db_id, role, host: &str, port, dir: &str| SegConfig {
            db_id,
            content_id,
            role,
            hostname: host.to_string(),
            port,
            data_dir: dir.into(),
        };
        let intermediate = Cluster::new(
            Destination::Intermediate,
            "/usr/local/gpdb6".into(),
            Version::new(6, 26, 0),
            vec![
                seg(-1, 1, Role::Primary, "cdw", 50432, "/data/qddir/demoDataDir.ID.-1"),
                seg(-1, 6, Role::Mirror, "scdw", 50433, "/data/standby/demoDataDir.ID.-1"),
                seg(0, 2, Role::Primary, "sdw1", 50434, "/data/dbfast1/demoDataDir.ID.0"),
                seg(1, 3, Role::Primary, "sdw2", 50434, "/data/dbfast2/demoDataDir.ID.1"),
                seg(0, 4, Role::Mirror, "sdw2", 50435, "/data/dbfast_mirror1/demoDataDir.ID.0"),
            ],
        )
        .unwrap();

        let config = InitConfig {
            intermediate: &intermediate,
            seg_prefix: "demoDataDir",
            encoding: "UTF8",
            checkpoint_segments: Some("8"),
            use_hba_hostnames: true,
        };
        assert_eq!(
            config.render(),
            "ARRAY_NAME=\"gp_upgrade cluster\"
SEG_PREFIX=demoDataDir
TRUSTED_SHELL=ssh
ENCODING=UTF8
HBA_HOSTNAMES=1
CHECK_POINT_SEGMENTS=8
QD_PRIMARY_ARRAY=cdw~cdw~50432~/data/qddir/demoDataDir.ID.-1~1~-1
declare -a PRIMARY_ARRAY=(
sdw1~sdw1~50434~/data/dbfast1/demoDataDir.ID.0~2~0
sdw2~sdw2~50434~/data/dbfast2/demoDataDir.ID.1~3~1
)
"
        );

        let seven = InitConfig {
            checkpoint_segments: None,
            use_hba_hostnames: false,
            ..config
        };
        let rendered = seven.render();
        assert!(!rendered.contains("CHECK_POINT_SEGMENTS"));
        assert!(!rendered.contains("HBA_HOSTNAMES"));
    }
}
