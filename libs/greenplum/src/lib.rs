//! Model of a Greenplum cluster and the ways we talk to one: SQL over `tokio-postgres`
//! and the management utilities shipped with each installation.

pub mod cluster;
pub mod db;
pub mod segment;
pub mod tablespaces;
pub mod utilities;
mod version;

pub use cluster::{Cluster, ClusterError, Destination};
pub use segment::{Role, SegConfig, COORDINATOR_CONTENT_ID};
pub use tablespaces::{TablespaceInfo, Tablespaces};
pub use version::Version;

/// How data files move from the source to the intermediate cluster.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    serde::Serialize,
    serde::Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Mode {
    #[default]
    Copy,
    Link,
}
