//! Refusing to stop a cluster that still has clients connected.

use std::fmt;

use greenplum::db::{self, ActiveConnection};
use greenplum::{utilities, Cluster};
use step::{NextActionError, SubstepError};

const CLOSE_CONNECTIONS: &str = "Please close all active connections and try again.";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub struct ActiveConnectionsError {
    pub port: u16,
    pub connections: Vec<ActiveConnection>,
}

impl fmt::Display for ActiveConnectionsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut table = comfy_table::Table::new();
        table.load_preset(comfy_table::presets::NOTHING);
        table.set_header(["PID", "User", "Database", "Application"]);
        for c in &self.connections {
            table.add_row([
                c.pid.to_string(),
                c.user.clone(),
                c.database.clone(),
                c.application.clone(),
            ]);
        }
        write!(
            f,
            "found {} active connection(s) to the cluster on port {}:\n\n{table}",
            self.connections.len(),
            self.port
        )
    }
}

/// Skips when the cluster is not running, since a stopped cluster has no clients.
pub async fn check(cluster: &Cluster) -> Result<(), SubstepError> {
    if !utilities::is_coordinator_running(cluster).await? {
        return Err(SubstepError::Skip);
    }

    let port = cluster.coordinator_port();
    let client = db::connect(port, "postgres").await?;
    let connections = db::active_connections(&client, cluster.version).await?;
    if connections.is_empty() {
        return Ok(());
    }

    let err = ActiveConnectionsError { port, connections };
    Err(anyhow::Error::new(NextActionError::new(err, CLOSE_CONNECTIONS)).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_every_connection() {
        let err = ActiveConnectionsError {
            port: 5432,
            connections: vec![ActiveConnection {
                pid: 4242,
                user: "gpadmin".to_string(),
                database: "postgres".to_string(),
                application: "psql".to_string(),
            }],
        };
        let shown = err.to_string();
        assert!(
            shown.starts_with("found 1 active connection(s) to the cluster on port 5432:"),
            "{shown}"
        );
        assert!(shown.contains("4242"), "{shown}");
        assert!(shown.contains("psql"), "{shown}");
    }
}
