//! The hub's half of finalize: giving the intermediate cluster mirrors and a standby,
//! then moving it into the source cluster's place.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{info, warn};

use greenplum::tablespaces::target_tablespace_dir;
use greenplum::{db, utilities, Cluster, Destination, Role, SegConfig, Version};
use step::{OutStreams, Phase, Step, StepError, Substep};
use upgrade::data_dirs::{self, LineRewrite};
use upgrade::rename::{self, archive_path};
use upgrade::{archive, backup_dirs, wire, Config, RenamePair};
use upgrade_proto::idl::{self, response};
use utils::crashsafe;
use utils::exec::OutputSink;
use utils::rsync::{self, RsyncOption};

use crate::agent_conns::{for_each_agent, rpc_error};
use crate::execute::{delete_agent_backup_dirs, start_if_stopped};
use crate::initialize::CLUSTER_READY_TIMEOUT;
use crate::server::cluster_info;
use crate::{active_connections, Hub};

pub const ADD_MIRRORS_CONFIG_FILE_NAME: &str = "add_mirrors_config";

/// Left behind by the primary and meaningless, or harmful, in a mirror made from it.
const MIRROR_EXCLUDES: &[&str] = &[
    "internal.auto.conf",
    "postmaster.pid",
    "postmaster.opts",
    "gp_dbid",
    "backup_label",
    "recovery.conf",
    "standby.signal",
    "postgresql.auto.conf",
    "pg_log",
    "log",
];

pub async fn finalize(
    hub: &Hub,
    streams: Arc<dyn OutStreams>,
) -> Result<response::Contents, StepError> {
    let mut st = Step::new(Phase::Finalize, hub.store(), streams);
    let config = hub.config();

    st.always_run(Substep::EnsureGpupgradeAgentsAreRunning, |_| async move {
        hub.agents().await.map(|_| ())
    })
    .await;

    st.always_run(Substep::CheckActiveConnectionsOnTargetCluster, |_| async move {
        active_connections::check(hub.config().intermediate()?).await
    })
    .await;

    st.run_conditionally(
        Substep::UpgradeMirrors,
        config.source.has_mirrors(),
        |streams| async move { upgrade_mirrors(hub, streams.sink()).await },
    )
    .await;

    st.run_conditionally(
        Substep::UpgradeStandby,
        config.source.has_standby(),
        |streams| async move { upgrade_standby(hub, streams.sink()).await },
    )
    .await;

    st.run(
        Substep::WaitForClusterToBeReadyAfterAddingMirrorsAndStandby,
        |_| async move {
            let port = hub.config().intermediate()?.coordinator_port();
            db::wait_for_cluster_ready(port, CLUSTER_READY_TIMEOUT).await
        },
    )
    .await;

    st.always_run(Substep::ShutdownTargetCluster, |streams| async move {
        utilities::stop_if_running(hub.config().intermediate()?, streams.sink()).await
    })
    .await;

    st.run(Substep::UpdateTargetCatalog, |streams| async move {
        update_target_catalog(hub, streams.sink()).await
    })
    .await;

    st.run(Substep::UpdateDataDirectories, |_| async move {
        update_data_directories(hub).await
    })
    .await;

    st.run(Substep::UpdateTargetConfFiles, |_| async move {
        update_target_conf_files(hub).await
    })
    .await;

    st.always_run(Substep::StartTargetCluster, |streams| async move {
        start_if_stopped(target(&hub.config())?, streams.sink()).await
    })
    .await;

    st.always_run(
        Substep::WaitForClusterToBeReadyAfterUpdatingCatalog,
        |_| async move {
            let port = target(&hub.config())?.coordinator_port();
            db::wait_for_cluster_ready(port, CLUSTER_READY_TIMEOUT).await
        },
    )
    .await;

    st.run(Substep::ArchiveLogDirectories, |_| async move {
        archive_log_directories(hub, true).await.map(|_| ())
    })
    .await;

    st.run(Substep::DeleteBackupdir, |_| async move {
        delete_backup_dirs(hub).await
    })
    .await;

    st.always_run(Substep::DeleteSegmentStatedirs, |_| async move {
        delete_segment_state_dirs(hub).await
    })
    .await;

    st.finish()?;

    let config = hub.config();
    let target = target(&config).map_err(StepError::Hub)?;
    Ok(response::Contents::FinalizeResponse(idl::FinalizeResponse {
        target: Some(cluster_info(target)),
        log_archive_directory: config
            .log_archive_dir
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_default(),
        archived_source_coordinator_data_directory: archive_path(
            config.source.coordinator_data_dir(),
        )
        .to_string(),
        upgrade_id: config.upgrade_id.to_string(),
    }))
}

fn target(config: &Config) -> anyhow::Result<&Cluster> {
    config
        .target
        .as_ref()
        .context("the target cluster has not been recorded yet")
}

async fn ensure_running(cluster: &Cluster, sink: &dyn OutputSink) -> anyhow::Result<()> {
    if !utilities::is_coordinator_running(cluster).await? {
        utilities::start(cluster, sink).await?;
    }
    Ok(())
}

async fn upgrade_mirrors(hub: &Hub, sink: &dyn OutputSink) -> anyhow::Result<()> {
    let config = hub.config();
    let intermediate = config.intermediate()?;

    if !config.link_mode() {
        let path = hub.state_dir().join(ADD_MIRRORS_CONFIG_FILE_NAME);
        crashsafe::overwrite(&path, add_mirrors_config(intermediate).as_bytes())?;
        ensure_running(intermediate, sink).await?;
        utilities::add_mirrors(intermediate, &path, config.use_hba_hostnames, sink).await?;
        return Ok(());
    }

    // Link mode: the mirrors are copies of their upgraded primaries.
    utilities::stop_if_running(intermediate, sink).await?;
    copy_primaries_to_mirrors(hub, &config).await?;
    configure_mirrors(hub, &config).await?;

    let sql = register_mirrors_sql(intermediate);
    info!("registering mirrors in the intermediate catalog");
    utilities::run_single_user(
        &config.target_gphome,
        config.target_version,
        intermediate.coordinator_data_dir(),
        &sql,
        sink,
    )
    .await?;

    utilities::start(intermediate, sink).await?;
    Ok(())
}

/// The `gpaddmirrors -i` file: `<content>|<address>|<port>|<data dir>` per mirror.
pub fn add_mirrors_config(intermediate: &Cluster) -> String {
    let mut out = String::new();
    for mirror in intermediate.mirrors_excluding_standby() {
        let _ = writeln!(
            out,
            "{}|{}|{}|{}",
            mirror.content_id, mirror.hostname, mirror.port, mirror.data_dir
        );
    }
    out
}

/// Per primary host, the copies turning its upgraded primaries into their mirrors.
pub fn mirror_copies(config: &Config) -> anyhow::Result<BTreeMap<String, Vec<rsync::Options>>> {
    let intermediate = config.intermediate()?;
    let mut by_host: BTreeMap<String, Vec<rsync::Options>> = BTreeMap::new();

    for mirror in intermediate.mirrors_excluding_standby() {
        let primary = intermediate.primaries.get(&mirror.content_id).with_context(|| {
            format!("no intermediate primary for content {}", mirror.content_id)
        })?;
        let copies = by_host.entry(primary.hostname.clone()).or_default();

        copies.push(
            rsync::Options::new(
                vec![rsync::contents_of(&primary.data_dir)],
                rsync::contents_of(&mirror.data_dir),
            )
            .to_host(&mirror.hostname)
            .with_options(&[RsyncOption::Archive, RsyncOption::Delete])
            .with_excludes(MIRROR_EXCLUDES.iter().copied()),
        );

        for (_, from, to) in mirror_tablespaces(config, primary, mirror)? {
            copies.push(
                rsync::Options::new(vec![rsync::contents_of(&from)], rsync::contents_of(&to))
                    .to_host(&mirror.hostname)
                    .with_options(&[RsyncOption::Archive, RsyncOption::Delete]),
            );
        }
    }
    Ok(by_host)
}

/// `(oid, primary's upgraded tablespace directory, mirror's)` for every user tablespace.
fn mirror_tablespaces(
    config: &Config,
    primary: &SegConfig,
    mirror: &SegConfig,
) -> anyhow::Result<Vec<(u32, Utf8PathBuf, Utf8PathBuf)>> {
    let tablespaces = &config.source.tablespaces;
    let mut out = Vec::new();
    for (oid, info) in tablespaces
        .for_db_id(primary.db_id)
        .into_iter()
        .flatten()
        .filter(|(_, info)| info.user_defined)
    {
        let mirror_location = tablespaces
            .for_db_id(mirror.db_id)
            .and_then(|ts| ts.get(oid))
            .map(|ts| &ts.location)
            .with_context(|| {
                format!("mirror dbid {} has no location for tablespace {oid}", mirror.db_id)
            })?;
        out.push((
            *oid,
            target_tablespace_dir(
                &info.location,
                primary.db_id,
                config.target_version,
                &config.target_catalog_version,
            ),
            target_tablespace_dir(
                mirror_location,
                mirror.db_id,
                config.target_version,
                &config.target_catalog_version,
            ),
        ));
    }
    Ok(out)
}

async fn copy_primaries_to_mirrors(hub: &Hub, config: &Config) -> anyhow::Result<()> {
    let copies = mirror_copies(config)?;
    let agents = hub
        .agents_on(&copies.keys().cloned().collect::<Vec<_>>())
        .await?;
    for_each_agent(&agents, |conn| {
        let options = copies
            .get(&conn.hostname)
            .into_iter()
            .flatten()
            .map(wire::rsync_to_proto)
            .collect();
        async move {
            conn.client()
                .rsync(idl::RsyncRequest { options })
                .await
                .map_err(rpc_error)?;
            Ok(())
        }
    })
    .await?;
    Ok(())
}

/// What turns a copy of its primary into the mirror `mirror`: its db id, replication
/// from the primary, its own port and its own tablespace links.
pub fn mirror_configuration(
    config: &Config,
    mirror: &SegConfig,
    user: &str,
) -> anyhow::Result<idl::UpdateConfigurationRequest> {
    let intermediate = config.intermediate()?;
    let primary = intermediate
        .primaries
        .get(&mirror.content_id)
        .with_context(|| format!("no intermediate primary for content {}", mirror.content_id))?;
    let dir = &mirror.data_dir;

    let conninfo = format!(
        "primary_conninfo = 'user={user} host={} port={} sslmode=disable sslcompression=1 application_name=gp_walreceiver'\n",
        primary.hostname, primary.port
    );
    let mut files = vec![idl::ConfFile {
        path: dir.join("internal.auto.conf").to_string(),
        contents: format!("gp_dbid={}\n", mirror.db_id),
    }];
    if config.target_version.major < 7 {
        files.push(idl::ConfFile {
            path: dir.join("recovery.conf").to_string(),
            contents: format!("standby_mode = 'on'\n{conninfo}"),
        });
    } else {
        files.push(idl::ConfFile {
            path: dir.join("standby.signal").to_string(),
            contents: String::new(),
        });
        files.push(idl::ConfFile {
            path: dir.join("postgresql.auto.conf").to_string(),
            contents: conninfo,
        });
    }

    let port = LineRewrite::port(primary.port, mirror.port);
    let rewrites = vec![idl::ConfFileRewrite {
        path: dir.join("postgresql.conf").to_string(),
        pattern: port.pattern.as_str().to_string(),
        replacement: port.replacement,
    }];

    let symlinks = mirror_tablespaces(config, primary, mirror)?
        .into_iter()
        .map(|(oid, _, to)| idl::Symlink {
            path: dir.join("pg_tblspc").join(oid.to_string()).to_string(),
            // pg_tblspc links point at the db id directory, not the version directory
            target: to
                .parent()
                .map(Utf8Path::to_string)
                .unwrap_or_else(|| to.to_string()),
        })
        .collect();

    Ok(idl::UpdateConfigurationRequest {
        rewrites,
        files,
        symlinks,
    })
}

async fn configure_mirrors(hub: &Hub, config: &Config) -> anyhow::Result<()> {
    let intermediate = config.intermediate()?;
    let user = std::env::var("USER").context("USER is not set")?;

    let mut by_host: BTreeMap<String, Vec<idl::UpdateConfigurationRequest>> = BTreeMap::new();
    for mirror in intermediate.mirrors_excluding_standby() {
        by_host
            .entry(mirror.hostname.clone())
            .or_default()
            .push(mirror_configuration(config, mirror, &user)?);
    }

    let agents = hub
        .agents_on(&by_host.keys().cloned().collect::<Vec<_>>())
        .await?;
    for_each_agent(&agents, |conn| {
        let requests = by_host.get(&conn.hostname).cloned().unwrap_or_default();
        async move {
            for request in requests {
                conn.client()
                    .update_configuration(request)
                    .await
                    .map_err(rpc_error)?;
            }
            Ok(())
        }
    })
    .await?;
    Ok(())
}

fn sql_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Adds the mirrors staged by link mode to the intermediate catalog, one statement per
/// line as single-user mode expects. Mirrors already registered are left alone.
pub fn register_mirrors_sql(intermediate: &Cluster) -> String {
    let mut sql = String::new();
    for mirror in intermediate.mirrors_excluding_standby() {
        let host = sql_literal(&mirror.hostname);
        let _ = writeln!(
            sql,
            "INSERT INTO gp_segment_configuration (dbid, content, role, preferred_role, mode, status, port, hostname, address, datadir) \
             SELECT {}, {}, 'm', 'm', 's', 'u', {}, {host}, {host}, {} \
             WHERE NOT EXISTS (SELECT 1 FROM gp_segment_configuration WHERE content = {} AND role = 'm');",
            mirror.db_id,
            mirror.content_id,
            mirror.port,
            sql_literal(mirror.data_dir.as_str()),
            mirror.content_id,
        );
        let _ = writeln!(
            sql,
            "UPDATE gp_segment_configuration SET mode = 's' WHERE content = {};",
            mirror.content_id
        );
    }
    sql
}

/// Points every segment of the intermediate catalog at the port and data directory of
/// its source counterpart.
pub fn catalog_update_sql(source: &Cluster, intermediate: &Cluster) -> String {
    let mut sql = String::new();
    for seg in intermediate.segments() {
        let Some(original) = source.counterpart(seg) else {
            continue;
        };
        let _ = writeln!(
            sql,
            "UPDATE gp_segment_configuration SET port = {}, datadir = {} WHERE content = {} AND role = {};",
            original.port,
            sql_literal(original.data_dir.as_str()),
            seg.content_id,
            sql_literal(seg.role.as_catalog()),
        );
    }
    sql
}

/// The intermediate cluster as it will look once it took the source cluster's place.
pub fn target_cluster(source: &Cluster, intermediate: &Cluster) -> anyhow::Result<Cluster> {
    let segments = source
        .segments()
        .filter(|seg| intermediate.counterpart(seg).is_some())
        .cloned()
        .collect();
    let mut target = Cluster::new(
        Destination::Target,
        intermediate.gphome.clone(),
        intermediate.version,
        segments,
    )?;
    target.catalog_version = intermediate.catalog_version.clone();
    target.tablespaces = source.tablespaces.clone();
    Ok(target)
}

async fn update_target_catalog(hub: &Hub, sink: &dyn OutputSink) -> anyhow::Result<()> {
    let config = hub.config();
    let intermediate = config.intermediate()?;
    let sql = catalog_update_sql(&config.source, intermediate);

    utilities::run_single_user(
        &config.target_gphome,
        config.target_version,
        intermediate.coordinator_data_dir(),
        &sql,
        sink,
    )
    .await?;

    let target = target_cluster(&config.source, intermediate)?;
    hub.update_config(|c| c.target = Some(target))
}

/// The renames on the coordinator's host, done by the hub, and those every agent does.
pub fn rename_pairs(
    source: &Cluster,
    intermediate: &Cluster,
) -> (RenamePair, BTreeMap<String, Vec<RenamePair>>) {
    let coordinator = RenamePair::new(
        source.coordinator_data_dir(),
        intermediate.coordinator_data_dir(),
    );
    let mut by_host: BTreeMap<String, Vec<RenamePair>> = BTreeMap::new();
    for seg in source.segments().filter(|s| !s.is_coordinator()) {
        if let Some(renamed) = intermediate.counterpart(seg) {
            by_host
                .entry(seg.hostname.clone())
                .or_default()
                .push(RenamePair::new(&seg.data_dir, &renamed.data_dir));
        }
    }
    (coordinator, by_host)
}

async fn rename_on_agents(
    hub: &Hub,
    by_host: &BTreeMap<String, Vec<RenamePair>>,
    revert: bool,
    renamed: Option<&Mutex<Vec<String>>>,
) -> anyhow::Result<()> {
    let agents = hub
        .agents_on(&by_host.keys().cloned().collect::<Vec<_>>())
        .await?;
    for_each_agent(&agents, |conn| {
        let pairs = by_host
            .get(&conn.hostname)
            .into_iter()
            .flatten()
            .map(wire::rename_pair_to_proto)
            .collect();
        async move {
            conn.client()
                .rename_directories(idl::RenameDirectoriesRequest { pairs, revert })
                .await
                .map_err(rpc_error)?;
            if let Some(renamed) = renamed {
                renamed.lock().unwrap().push(conn.hostname.clone());
            }
            Ok(())
        }
    })
    .await?;
    Ok(())
}

/// The renames of the hosts in `renamed`, which must be undone when another host failed.
fn renamed_hosts(
    by_host: BTreeMap<String, Vec<RenamePair>>,
    renamed: &[String],
) -> BTreeMap<String, Vec<RenamePair>> {
    by_host
        .into_iter()
        .filter(|(host, _)| renamed.contains(host))
        .collect()
}

/// Swaps every intermediate data directory into its source counterpart's place. When a
/// host fails, the hosts that succeeded are put back before the error is returned.
async fn update_data_directories(hub: &Hub) -> anyhow::Result<()> {
    let config = hub.config();
    let (coordinator, by_host) = rename_pairs(&config.source, config.intermediate()?);

    rename::rename_data_directories(std::slice::from_ref(&coordinator))?;

    let renamed = Mutex::new(Vec::new());
    if let Err(e) = rename_on_agents(hub, &by_host, false, Some(&renamed)).await {
        let renamed = renamed.into_inner().unwrap();
        warn!("renaming failed, putting back the data directories of {renamed:?}");
        let done = renamed_hosts(by_host, &renamed);
        if let Err(undo) = rename_on_agents(hub, &done, true, None).await {
            warn!("could not put back renamed data directories: {undo:#}");
        }
        if let Err(undo) =
            rename::revert_renamed_data_directories(std::slice::from_ref(&coordinator))
        {
            warn!("could not put back the coordinator data directory: {undo:#}");
        }
        return Err(e);
    }
    Ok(())
}

/// Rewrites pointing `seg`, already at its source path, back at the source ports.
pub fn conf_rewrites(
    seg: &SegConfig,
    source: &Cluster,
    intermediate: &Cluster,
    target_version: Version,
) -> anyhow::Result<Vec<(Utf8PathBuf, LineRewrite)>> {
    let missing = |s: &SegConfig| {
        anyhow::anyhow!(
            "intermediate cluster has no {} for content {}",
            s.kind(),
            s.content_id
        )
    };
    let temp = intermediate.counterpart(seg).ok_or_else(|| missing(seg))?;
    let mut rewrites = vec![(
        seg.data_dir.join("postgresql.conf"),
        LineRewrite::port(temp.port, seg.port),
    )];

    if seg.role == Role::Mirror {
        let primary = source
            .primaries
            .get(&seg.content_id)
            .ok_or_else(|| missing(seg))?;
        let temp_primary = intermediate.counterpart(primary).ok_or_else(|| missing(primary))?;
        let file = if target_version.major < 7 {
            "recovery.conf"
        } else {
            "postgresql.auto.conf"
        };
        rewrites.push((
            seg.data_dir.join(file),
            LineRewrite::primary_conninfo_port(temp_primary.port, primary.port),
        ));
    }
    Ok(rewrites)
}

async fn update_target_conf_files(hub: &Hub) -> anyhow::Result<()> {
    let config = hub.config();
    let intermediate = config.intermediate()?;
    let source = &config.source;

    let coordinator = source.coordinator();
    for (path, rewrite) in conf_rewrites(coordinator, source, intermediate, config.target_version)? {
        data_dirs::rewrite_file(&path, &[rewrite])?;
    }
    if config.use_hba_hostnames {
        let mut hostnames: Vec<String> =
            source.segments().map(|s| s.hostname.clone()).collect();
        hostnames.sort();
        hostnames.dedup();
        data_dirs::append_hba_entries(&coordinator.data_dir.join("pg_hba.conf"), &hostnames)?;
    }

    let mut by_host: BTreeMap<String, Vec<idl::ConfFileRewrite>> = BTreeMap::new();
    for seg in source.segments().filter(|s| !s.is_coordinator()) {
        if intermediate.counterpart(seg).is_none() {
            continue;
        }
        let rewrites = by_host.entry(seg.hostname.clone()).or_default();
        for (path, rewrite) in conf_rewrites(seg, source, intermediate, config.target_version)? {
            rewrites.push(idl::ConfFileRewrite {
                path: path.to_string(),
                pattern: rewrite.pattern.as_str().to_string(),
                replacement: rewrite.replacement,
            });
        }
    }

    let agents = hub
        .agents_on(&by_host.keys().cloned().collect::<Vec<_>>())
        .await?;
    for_each_agent(&agents, |conn| {
        let rewrites = by_host.get(&conn.hostname).cloned().unwrap_or_default();
        async move {
            conn.client()
                .update_configuration(idl::UpdateConfigurationRequest {
                    rewrites,
                    ..Default::default()
                })
                .await
                .map_err(rpc_error)?;
            Ok(())
        }
    })
    .await?;
    Ok(())
}

async fn upgrade_standby(hub: &Hub, sink: &dyn OutputSink) -> anyhow::Result<()> {
    let config = hub.config();
    let intermediate = config.intermediate()?;
    let standby = intermediate
        .standby()
        .context("intermediate cluster has no standby")?;

    ensure_running(intermediate, sink).await?;
    utilities::init_standby(
        intermediate,
        &standby.hostname,
        standby.port,
        &standby.data_dir,
        config.use_hba_hostnames,
        sink,
    )
    .await?;
    Ok(())
}

/// Moves the log directories of the coordinator, and of the agents when they were
/// started, aside. The archive's name is chosen once, so a rerun reports the same one.
pub async fn archive_log_directories(hub: &Hub, agents: bool) -> anyhow::Result<Utf8PathBuf> {
    let log_dir = upgrade::paths::log_dir()?;
    let config = hub.config();
    let archive_dir = match config.log_archive_dir {
        Some(dir) => dir,
        None => {
            let dir = archive::archive_dir_name(
                &log_dir,
                &config.upgrade_id,
                chrono::Local::now().naive_local(),
            );
            hub.update_config(|c| c.log_archive_dir = Some(dir.clone()))?;
            dir
        }
    };

    if agents {
        let conns = hub.agents().await?;
        let new_dir = archive_dir.to_string();
        for_each_agent(&conns, |conn| {
            let new_dir = new_dir.clone();
            async move {
                conn.client()
                    .archive_log_directory(idl::ArchiveLogDirectoryRequest { new_dir })
                    .await
                    .map_err(rpc_error)?;
                Ok(())
            }
        })
        .await?;
    }

    archive::archive_log_directory(&log_dir, &archive_dir)?;
    Ok(archive_dir)
}

pub async fn delete_backup_dirs(hub: &Hub) -> anyhow::Result<()> {
    let dirs = hub.config().backup_dirs;
    delete_agent_backup_dirs(hub, &dirs, None).await?;
    backup_dirs::delete_backup_directory(&dirs.coordinator_backup_dir)
        .with_context(|| format!("delete {}", dirs.coordinator_backup_dir))
}

pub async fn delete_segment_state_dirs(hub: &Hub) -> anyhow::Result<()> {
    let agents = hub.agents().await?;
    for_each_agent(&agents, |conn| async move {
        conn.client()
            .delete_state_directory(idl::DeleteStateDirectoryRequest {})
            .await
            .map_err(rpc_error)?;
        Ok(())
    })
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use greenplum::TablespaceInfo;

    use super::*;
    use crate::tests::example_config_with_intermediate;

    #[test]
    fn add_mirrors_config_lists_the_intermediate_mirrors() {
        let config = example_config_with_intermediate();
        let contents = add_mirrors_config(config.intermediate().unwrap());
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0|sdw2|"), "{contents}");
        assert!(
            lines[0].ends_with("|/data/dbfast_mirror1/demoDataDir.ABC123xyz_-.0"),
            "{contents}"
        );
        assert!(lines[1].starts_with("1|sdw1|"), "{contents}");
    }

    #[test]
    fn catalog_points_at_source_ports_and_directories() {
        let config = example_config_with_intermediate();
        let sql = catalog_update_sql(&config.source, config.intermediate().unwrap());
        let lines: Vec<&str> = sql.lines().collect();

        assert_eq!(lines.len(), 6);
        assert_eq!(
            lines[0],
            "UPDATE gp_segment_configuration SET port = 5432, datadir = '/data/qddir/demoDataDir-1' WHERE content = -1 AND role = 'p';"
        );
        assert!(lines.contains(
            &"UPDATE gp_segment_configuration SET port = 25435, datadir = '/data/dbfast_mirror2/demoDataDir1' WHERE content = 1 AND role = 'm';"
        ));
    }

    #[test]
    fn literals_are_quoted() {
        assert_eq!(sql_literal("/data/o'brien"), "'/data/o''brien'");
    }

    #[test]
    fn staged_mirrors_are_registered_once() {
        let config = example_config_with_intermediate();
        let sql = register_mirrors_sql(config.intermediate().unwrap());
        let lines: Vec<&str> = sql.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("INSERT INTO gp_segment_configuration"));
        assert!(lines[0].contains("SELECT 4, 0, 'm', 'm', 's', 'u',"), "{}", lines[0]);
        assert!(lines[0].ends_with("WHERE content = 0 AND role = 'm');"));
        assert_eq!(
            lines[1],
            "UPDATE gp_segment_configuration SET mode = 's' WHERE content = 0;"
        );
    }

    #[test]
    fn target_takes_the_source_topology() {
        let config = example_config_with_intermediate();
        let intermediate = config.intermediate().unwrap();
        let target = target_cluster(&config.source, intermediate).unwrap();

        assert_eq!(target.destination, Destination::Target);
        assert_eq!(target.version, Version::new(6, 26, 0));
        assert_eq!(target.gphome, "/usr/local/gpdb6");
        assert_eq!(target.catalog_version, "301908232");
        assert_eq!(target.primaries, config.source.primaries);
        assert_eq!(target.mirrors, config.source.mirrors);
    }

    #[test]
    fn renames_are_grouped_by_host() {
        let config = example_config_with_intermediate();
        let (coordinator, by_host) = rename_pairs(&config.source, config.intermediate().unwrap());

        assert_eq!(coordinator.source, "/data/qddir/demoDataDir-1");
        assert_eq!(coordinator.target, "/data/qddir/demoDataDir.ABC123xyz_-.-1");
        assert_eq!(
            by_host.keys().collect::<Vec<_>>(),
            vec!["scdw", "sdw1", "sdw2"]
        );
        assert_eq!(
            by_host["sdw1"],
            vec![
                RenamePair::new(
                    "/data/dbfast1/demoDataDir0",
                    "/data/dbfast1/demoDataDir.ABC123xyz_-.0"
                ),
                RenamePair::new(
                    "/data/dbfast_mirror2/demoDataDir1",
                    "/data/dbfast_mirror2/demoDataDir.ABC123xyz_-.1"
                ),
            ]
        );
    }

    #[test]
    fn only_hosts_that_renamed_are_put_back() {
        let config = example_config_with_intermediate();
        let (_, by_host) = rename_pairs(&config.source, config.intermediate().unwrap());

        let done = renamed_hosts(by_host.clone(), &["sdw1".to_string()]);
        assert_eq!(done.keys().collect::<Vec<_>>(), vec!["sdw1"]);
        assert_eq!(done["sdw1"], by_host["sdw1"]);

        assert!(renamed_hosts(by_host, &[]).is_empty());
    }

    #[test]
    fn failed_host_leaves_every_data_directory_at_its_source() {
        let tmp = camino_tempfile::tempdir().unwrap();
        let pair = |name: &str| {
            let source = tmp.path().join(format!("demoDataDir{name}"));
            let target = tmp.path().join(format!("demoDataDir.ABC123xyz_-.{name}"));
            for (dir, marker) in [(&source, "source"), (&target, "target")] {
                std::fs::create_dir_all(dir).unwrap();
                std::fs::write(dir.join("marker"), marker).unwrap();
            }
            RenamePair::new(source, target)
        };
        let coordinator = pair("-1");
        let by_host = BTreeMap::from([
            ("sdw1".to_string(), vec![pair("0")]),
            ("sdw2".to_string(), vec![pair("1")]),
        ]);

        // sdw1 renamed, sdw2 failed before touching anything.
        rename::rename_data_directories(std::slice::from_ref(&coordinator)).unwrap();
        rename::rename_data_directories(&by_host["sdw1"]).unwrap();

        for pairs in renamed_hosts(by_host.clone(), &["sdw1".to_string()]).values() {
            rename::revert_renamed_data_directories(pairs).unwrap();
        }
        rename::revert_renamed_data_directories(std::slice::from_ref(&coordinator)).unwrap();

        for pair in by_host.values().flatten().chain([&coordinator]) {
            let marker = std::fs::read_to_string(pair.source.join("marker")).unwrap();
            assert_eq!(marker, "source", "{}", pair.source);
            let marker = std::fs::read_to_string(pair.target.join("marker")).unwrap();
            assert_eq!(marker, "target", "{}", pair.target);
        }
    }

    #[test]
    fn mirrors_get_their_port_and_their_primarys_port_back() {
        let config = example_config_with_intermediate();
        let intermediate = config.intermediate().unwrap();
        let mirror = &config.source.mirrors[&0];

        let rewrites =
            conf_rewrites(mirror, &config.source, intermediate, Version::new(6, 26, 0)).unwrap();
        assert_eq!(rewrites.len(), 2);
        assert_eq!(
            rewrites[0].0,
            "/data/dbfast_mirror1/demoDataDir0/postgresql.conf"
        );
        let temp_port = intermediate.mirrors[&0].port;
        assert_eq!(
            rewrites[0].1.apply(&format!("port={temp_port} # port\n")),
            "port=25434 # port\n"
        );

        assert_eq!(rewrites[1].0, "/data/dbfast_mirror1/demoDataDir0/recovery.conf");
        let temp_primary = intermediate.primaries[&0].port;
        assert_eq!(
            rewrites[1].1.apply(&format!(
                "primary_conninfo = 'user=gpadmin host=sdw1 port={temp_primary} sslmode=disable'\n"
            )),
            "primary_conninfo = 'user=gpadmin host=sdw1 port=25432 sslmode=disable'\n"
        );

        let seven =
            conf_rewrites(mirror, &config.source, intermediate, Version::new(7, 1, 0)).unwrap();
        assert_eq!(
            seven[1].0,
            "/data/dbfast_mirror1/demoDataDir0/postgresql.auto.conf"
        );
    }

    #[test]
    fn link_mode_mirrors_are_copies_of_their_primaries() {
        let mut config = example_config_with_intermediate();
        for (db_id, location) in [(2, "/data/tblspc/p0"), (4, "/data/tblspc/m0")] {
            config.source.tablespaces.insert(
                db_id,
                16386,
                TablespaceInfo {
                    location: location.into(),
                    user_defined: true,
                },
            );
        }

        let copies = mirror_copies(&config).unwrap();
        let sdw1 = &copies["sdw1"];
        assert_eq!(sdw1.len(), 2);
        assert_eq!(
            sdw1[0].sources,
            vec!["/data/dbfast1/demoDataDir.ABC123xyz_-.0/".to_string()]
        );
        assert_eq!(sdw1[0].destination_host.as_deref(), Some("sdw2"));
        assert_eq!(
            sdw1[0].destination,
            "/data/dbfast_mirror1/demoDataDir.ABC123xyz_-.0/"
        );
        assert!(sdw1[0].excludes.contains(&"postmaster.pid".to_string()));
        assert_eq!(
            sdw1[1].sources,
            vec!["/data/tblspc/p0/2/GPDB_6_301908232/".to_string()]
        );
        assert_eq!(sdw1[1].destination, "/data/tblspc/m0/4/GPDB_6_301908232/");

        let mirror = &config.intermediate().unwrap().mirrors[&0];
        let request = mirror_configuration(&config, mirror, "gpadmin").unwrap();
        assert_eq!(request.files[0].contents, "gp_dbid=4\n");
        assert!(request.files[1].path.ends_with("/recovery.conf"));
        assert!(request.files[1].contents.contains("host=sdw1"));
        assert_eq!(request.symlinks.len(), 1);
        assert_eq!(
            request.symlinks[0].path,
            "/data/dbfast_mirror1/demoDataDir.ABC123xyz_-.0/pg_tblspc/16386"
        );
        assert_eq!(request.symlinks[0].target, "/data/tblspc/m0/4");
    }
}
