use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

pub const COORDINATOR_CONTENT_ID: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "p")]
    Primary,
    #[serde(rename = "m")]
    Mirror,
}

impl Role {
    pub fn from_catalog(role: &str) -> anyhow::Result<Role> {
        match role {
            "p" => Ok(Role::Primary),
            "m" => Ok(Role::Mirror),
            other => anyhow::bail!("unknown segment role {other:?}"),
        }
    }

    pub fn as_catalog(&self) -> &'static str {
        match self {
            Role::Primary => "p",
            Role::Mirror => "m",
        }
    }
}

/// One row of `gp_segment_configuration`, i.e. a single database instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegConfig {
    pub db_id: i32,
    pub content_id: i32,
    pub role: Role,
    pub hostname: String,
    pub port: u16,
    pub data_dir: Utf8PathBuf,
}

impl SegConfig {
    pub fn is_coordinator(&self) -> bool {
        self.content_id == COORDINATOR_CONTENT_ID && self.role == Role::Primary
    }

    pub fn is_standby(&self) -> bool {
        self.content_id == COORDINATOR_CONTENT_ID && self.role == Role::Mirror
    }

    pub fn is_primary(&self) -> bool {
        self.content_id != COORDINATOR_CONTENT_ID && self.role == Role::Primary
    }

    pub fn is_mirror(&self) -> bool {
        self.content_id != COORDINATOR_CONTENT_ID && self.role == Role::Mirror
    }

    /// Short label used in logs and working directory names: `coordinator`, `standby`,
    /// `primary`, or `mirror`.
    pub fn kind(&self) -> &'static str {
        match (self.content_id == COORDINATOR_CONTENT_ID, self.role) {
            (true, Role::Primary) => "coordinator",
            (true, Role::Mirror) => "standby",
            (false, Role::Primary) => "primary",
            (false, Role::Mirror) => "mirror",
        }
    }
}
