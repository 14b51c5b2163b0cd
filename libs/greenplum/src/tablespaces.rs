use std::collections::BTreeMap;
use std::fmt::Write;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::Version;

/// Tablespaces with an oid at or above this are user-defined.
pub const FIRST_NORMAL_OBJECT_ID: u32 = 16384;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablespaceInfo {
    pub location: Utf8PathBuf,
    pub user_defined: bool,
}

/// Tablespaces of one segment, keyed by tablespace oid.
pub type SegmentTablespaces = BTreeMap<u32, TablespaceInfo>;

/// Tablespaces of a whole cluster, keyed by db id.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tablespaces(pub BTreeMap<i32, SegmentTablespaces>);

impl Tablespaces {
    pub fn for_db_id(&self, db_id: i32) -> Option<&SegmentTablespaces> {
        self.0.get(&db_id)
    }

    pub fn insert(&mut self, db_id: i32, oid: u32, info: TablespaceInfo) {
        self.0.entry(db_id).or_default().insert(oid, info);
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|ts| ts.values().all(|t| !t.user_defined))
    }

    /// Locations of the user-defined tablespaces of `db_id`.
    pub fn user_defined_locations(&self, db_id: i32) -> Vec<Utf8PathBuf> {
        self.for_db_id(db_id)
            .map(|ts| {
                ts.values()
                    .filter(|t| t.user_defined)
                    .map(|t| t.location.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Renders the mapping file the 5X segment upgrader reads with
    /// `--old-tablespaces-file`: one `dbid,oid,location,user_defined` line per tablespace.
    pub fn old_tablespaces_file_contents(&self) -> String {
        let mut out = String::new();
        for (db_id, tablespaces) in &self.0 {
            for (oid, info) in tablespaces {
                let _ = writeln!(
                    out,
                    "{db_id},{oid},{},{}",
                    info.location,
                    u8::from(info.user_defined)
                );
            }
        }
        out
    }
}

/// Directory the target version creates inside each tablespace location:
/// `<location>/<dbid>/GPDB_<major>_<catalog version>` (6X and later).
pub fn target_tablespace_dir(
    location: &Utf8Path,
    db_id: i32,
    target_version: Version,
    catalog_version: &str,
) -> Utf8PathBuf {
    location
        .join(db_id.to_string())
        .join(format!("GPDB_{}_{catalog_version}", target_version.major))
}
