//! Queries against a running cluster's coordinator.

use std::time::Duration;

use anyhow::Context;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, info};

use crate::segment::{Role, SegConfig};
use crate::tablespaces::{TablespaceInfo, Tablespaces, FIRST_NORMAL_OBJECT_ID};
use crate::Version;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connects to the coordinator listening on `localhost:<port>`.
pub async fn connect(port: u16, dbname: &str) -> anyhow::Result<Client> {
    let user = std::env::var("PGUSER")
        .or_else(|_| std::env::var("USER"))
        .context("neither PGUSER nor USER is set")?;

    let mut config = tokio_postgres::Config::new();
    config
        .host("localhost")
        .port(port)
        .user(&user)
        .dbname(dbname)
        .application_name("gpupgrade")
        .connect_timeout(CONNECT_TIMEOUT);

    let (client, connection) = config
        .connect(NoTls)
        .await
        .with_context(|| format!("connect to database {dbname:?} on port {port}"))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("connection to port {port} closed: {e}");
        }
    });

    Ok(client)
}

/// Reads `gp_segment_configuration`. 5X keeps data directories in the filespace catalog.
pub async fn query_segments(client: &Client, version: Version) -> anyhow::Result<Vec<SegConfig>> {
    let query = if version.major == 5 {
        "SELECT s.dbid::int, s.content::int, s.role::text, s.port::int, s.hostname::text, e.fselocation::text \
         FROM gp_segment_configuration s \
         JOIN pg_filespace_entry e ON s.dbid = e.fsedbid \
         JOIN pg_filespace f ON e.fsefsoid = f.oid \
         WHERE f.fsname = 'pg_system' \
         ORDER BY s.content, s.role"
    } else {
        "SELECT dbid::int, content::int, role::text, port::int, hostname::text, datadir::text \
         FROM gp_segment_configuration \
         ORDER BY content, role"
    };

    let rows = client
        .query(query, &[])
        .await
        .context("query gp_segment_configuration")?;

    rows.iter()
        .map(|row| {
            let port: i32 = row.get(3);
            let role: String = row.get(2);
            let data_dir: String = row.get(5);
            Ok(SegConfig {
                db_id: row.get(0),
                content_id: row.get(1),
                role: Role::from_catalog(&role)?,
                port: u16::try_from(port).with_context(|| format!("invalid port {port}"))?,
                hostname: row.get(4),
                data_dir: data_dir.into(),
            })
        })
        .collect()
}

/// Reads the tablespace locations of every segment, keyed by db id.
pub async fn query_tablespaces(client: &Client, version: Version) -> anyhow::Result<Tablespaces> {
    let query = if version.major == 5 {
        "SELECT e.fsedbid::int, t.oid::bigint, (e.fselocation || '/' || t.oid)::text \
         FROM pg_tablespace t \
         JOIN pg_filespace_entry e ON e.fsefsoid = t.spcfsoid \
         WHERE t.spcname NOT IN ('pg_default', 'pg_global')"
    } else {
        "SELECT s.dbid::int, t.oid::bigint, l.tblspc_loc::text \
         FROM pg_tablespace t, gp_tablespace_segment_location(t.oid) l \
         JOIN gp_segment_configuration s ON s.content = l.gp_segment_id AND s.role = 'p' \
         WHERE t.spcname NOT IN ('pg_default', 'pg_global')"
    };

    let rows = client
        .query(query, &[])
        .await
        .context("query tablespaces")?;

    let mut tablespaces = Tablespaces::default();
    for row in rows {
        let db_id: i32 = row.get(0);
        let oid: i64 = row.get(1);
        let location: String = row.get(2);
        let oid = u32::try_from(oid).with_context(|| format!("invalid tablespace oid {oid}"))?;
        tablespaces.insert(
            db_id,
            oid,
            TablespaceInfo {
                location: location.into(),
                user_defined: oid >= FIRST_NORMAL_OBJECT_ID,
            },
        );
    }
    Ok(tablespaces)
}

/// Returns the value of a configuration parameter, or `None` if the server does not know it.
pub async fn show(client: &Client, guc: &str) -> anyhow::Result<Option<String>> {
    let rows = client
        .query(
            "SELECT setting::text FROM pg_settings WHERE name = $1",
            &[&guc],
        )
        .await
        .with_context(|| format!("query setting {guc}"))?;
    Ok(rows.first().map(|row| row.get(0)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveConnection {
    pub pid: i32,
    pub user: String,
    pub database: String,
    pub application: String,
}

/// Lists client sessions other than our own.
pub async fn active_connections(
    client: &Client,
    version: Version,
) -> anyhow::Result<Vec<ActiveConnection>> {
    // 5X calls the column procpid.
    let pid_column = if version.major == 5 { "procpid" } else { "pid" };
    let query = format!(
        "SELECT {pid_column}::int, coalesce(usename, '')::text, coalesce(datname, '')::text, coalesce(application_name, '')::text \
         FROM pg_stat_activity \
         WHERE {pid_column} <> pg_backend_pid()"
    );
    let rows = client
        .query(query.as_str(), &[])
        .await
        .context("query pg_stat_activity")?;
    Ok(rows
        .iter()
        .map(|row| ActiveConnection {
            pid: row.get(0),
            user: row.get(1),
            database: row.get(2),
            application: row.get(3),
        })
        .collect())
}

pub async fn databases(client: &Client) -> anyhow::Result<Vec<String>> {
    let rows = client
        .query(
            "SELECT datname::text FROM pg_database WHERE datname <> 'template0' ORDER BY datname",
            &[],
        )
        .await
        .context("list databases")?;
    Ok(rows.iter().map(|row| row.get(0)).collect())
}

/// True when every segment is up and every mirrored primary is in sync.
pub async fn segments_ready(client: &Client) -> anyhow::Result<bool> {
    let row = client
        .query_one(
            "SELECT count(*)::bigint FROM gp_segment_configuration s \
             WHERE s.status <> 'u' \
                OR (s.mode <> 's' AND EXISTS ( \
                    SELECT 1 FROM gp_segment_configuration m \
                    WHERE m.content = s.content AND m.role = 'm'))",
            &[],
        )
        .await
        .context("query segment status")?;
    let not_ready: i64 = row.get(0);
    Ok(not_ready == 0)
}

/// Polls the cluster whose coordinator listens on `port` until all segments are up and
/// synchronized.
pub async fn wait_for_cluster_ready(port: u16, timeout: Duration) -> anyhow::Result<()> {
    const POLL_INTERVAL: Duration = Duration::from_secs(1);

    let started = tokio::time::Instant::now();
    let mut last_error = None;
    while started.elapsed() < timeout {
        let attempt = async {
            let client = connect(port, "postgres").await?;
            segments_ready(&client).await
        };
        match attempt.await {
            Ok(true) => {
                info!("cluster on port {port} is ready after {:?}", started.elapsed());
                return Ok(());
            }
            Ok(false) => last_error = None,
            Err(e) => last_error = Some(e),
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    match last_error {
        Some(e) => Err(e.context(format!(
            "cluster on port {port} was not ready within {timeout:?}"
        ))),
        None => anyhow::bail!("segments of the cluster on port {port} were not up and synchronized within {timeout:?}"),
    }
}
