//! The hub's half of execute: upgrading the coordinator, copying it to every primary
//! host, upgrading the primaries from that copy and starting the intermediate cluster.

use std::sync::Arc;

use anyhow::Context;
use camino::Utf8Path;
use tracing::info;

use greenplum::tablespaces::target_tablespace_dir;
use greenplum::{utilities, Cluster};
use step::{NextActionError, OutStreams, Phase, Step, StepError, Substep, SubstepError};
use upgrade::paths::OLD_TABLESPACES_FILE_NAME;
use upgrade::{backup_dirs, BackupDirs, Config};
use upgrade_proto::idl::{self, response, PgUpgradeAction};
use utils::exec::{BufferedOutput, OutputSink};
use utils::rsync::{self, RsyncOption};

use crate::agent_conns::{for_each_agent, for_each_concurrently, rpc_error};
use crate::initialize::{create_backup_dirs, PARENT_BACKUP_DIRS_HINT};
use crate::server::cluster_info;
use crate::{active_connections, pg_upgrade, Hub};

pub async fn execute(
    hub: &Hub,
    streams: Arc<dyn OutStreams>,
    request: idl::ExecuteRequest,
) -> Result<response::Contents, StepError> {
    hub.update_config(|c| c.pg_upgrade_verbose = request.pg_upgrade_verbose)
        .map_err(StepError::Hub)?;

    let mut st = Step::new(Phase::Execute, hub.store(), streams);

    st.run(Substep::CheckActiveConnectionsOnSourceCluster, |_| async move {
        active_connections::check(&hub.config().source).await
    })
    .await;

    st.run(Substep::ShutdownSourceCluster, |streams| async move {
        utilities::stop_if_running(&hub.config().source, streams.sink()).await
    })
    .await;

    st.run(Substep::UpgradeMaster, |streams| async move {
        upgrade_master(hub, streams.sink()).await
    })
    .await;

    let parent_backup_dirs = request.parent_backup_dirs;
    st.run(Substep::CopyMaster, |streams| async move {
        if !parent_backup_dirs.is_empty() {
            override_backup_dirs(hub, &parent_backup_dirs, streams.sink()).await?;
        }
        copy_master(&hub.config(), hub.state_dir(), streams.sink()).await
    })
    .await;

    st.run(Substep::UpgradePrimaries, |_| async move {
        pg_upgrade::upgrade_primaries(hub, &hub.config(), PgUpgradeAction::Upgrade).await
    })
    .await;

    st.run(Substep::StartTargetCluster, |streams| async move {
        start_if_stopped(hub.config().intermediate()?, streams.sink()).await
    })
    .await;

    st.finish()?;
    let config = hub.config();
    let intermediate = config.intermediate().map_err(StepError::Hub)?;
    Ok(response::Contents::ExecuteResponse(idl::ExecuteResponse {
        target: Some(cluster_info(intermediate)),
    }))
}

/// Starts `cluster` unless its coordinator already runs, in which case the substep is
/// shown as skipped.
pub async fn start_if_stopped(cluster: &Cluster, sink: &dyn OutputSink) -> Result<(), SubstepError> {
    if utilities::is_coordinator_running(cluster).await? {
        return Err(SubstepError::Skip);
    }
    utilities::start(cluster, sink).await?;
    Ok(())
}

/// Restores the pristine intermediate coordinator taken during initialize, then upgrades
/// the source coordinator into it.
async fn upgrade_master(hub: &Hub, sink: &dyn OutputSink) -> anyhow::Result<()> {
    let config = hub.config();
    let intermediate = config.intermediate()?;
    let pre = backup_dirs::pre_upgrade_coordinator(&config.backup_dirs.coordinator_backup_dir);

    let restore = rsync::Options::new(
        vec![rsync::contents_of(&pre)],
        rsync::contents_of(intermediate.coordinator_data_dir()),
    )
    .with_options(&[RsyncOption::Archive, RsyncOption::Delete]);
    rsync::rsync(&restore, sink)
        .await
        .with_context(|| format!("restore intermediate coordinator from {pre}"))?;

    pg_upgrade::upgrade_coordinator(hub, &config, PgUpgradeAction::Upgrade, sink).await
}

/// Moves the backup directories to the ones the operator passed on execute. The pristine
/// coordinator copy moves along when the coordinator's backup directory changes.
async fn override_backup_dirs(
    hub: &Hub,
    parent_backup_dirs: &str,
    sink: &dyn OutputSink,
) -> anyhow::Result<()> {
    let config = hub.config();
    let dirs = BackupDirs::parse(parent_backup_dirs, &config.source)
        .map_err(|e| NextActionError::new(e, PARENT_BACKUP_DIRS_HINT))?;
    if dirs == config.backup_dirs {
        return Ok(());
    }
    info!("moving backup directories to {parent_backup_dirs}");

    create_backup_dirs(hub, &dirs, &config.source).await?;

    let old = &config.backup_dirs;
    if old.coordinator_backup_dir != dirs.coordinator_backup_dir {
        let opts = rsync::Options::new(
            vec![rsync::contents_of(backup_dirs::pre_upgrade_coordinator(
                &old.coordinator_backup_dir,
            ))],
            rsync::contents_of(backup_dirs::pre_upgrade_coordinator(
                &dirs.coordinator_backup_dir,
            )),
        )
        .with_options(&[RsyncOption::Archive, RsyncOption::Delete]);
        rsync::rsync(&opts, sink).await?;

        backup_dirs::delete_backup_directory(&old.coordinator_backup_dir)
            .with_context(|| format!("delete {}", old.coordinator_backup_dir))?;
    }
    delete_agent_backup_dirs(hub, old, Some(&dirs)).await?;

    hub.update_config(|c| c.backup_dirs = dirs)
}

/// Deletes the backup directory of every primary host, except where `keep` names the
/// same directory.
pub async fn delete_agent_backup_dirs(
    hub: &Hub,
    dirs: &BackupDirs,
    keep: Option<&BackupDirs>,
) -> anyhow::Result<()> {
    let source = hub.config().source;
    let agents = hub.agents_on(&source.primary_hosts()).await?;
    for_each_agent(&agents, |conn| {
        let backup_dir = dirs.for_host(&conn.hostname).map(Utf8Path::to_owned);
        let kept = keep.and_then(|k| k.for_host(&conn.hostname)).map(Utf8Path::to_owned);
        async move {
            let Some(backup_dir) = backup_dir else {
                return Ok(());
            };
            if kept.as_ref() == Some(&backup_dir) {
                return Ok(());
            }
            conn.client()
                .delete_backup_directory(idl::DeleteBackupDirectoryRequest {
                    backup_dir: backup_dir.to_string(),
                })
                .await
                .map_err(rpc_error)?;
            Ok(())
        }
    })
    .await?;
    Ok(())
}

/// The copies giving `host` what its agent needs to upgrade its primaries: the upgraded
/// coordinator in POST, and in TBLSPC the coordinator's upgraded user tablespaces plus,
/// for 5X sources, the old tablespaces file.
pub fn copy_master_options(
    config: &Config,
    host: &str,
    state_dir: &Utf8Path,
) -> anyhow::Result<Vec<rsync::Options>> {
    let intermediate = config.intermediate()?;
    let backup_dir = config
        .backup_dirs
        .for_host(host)
        .with_context(|| format!("no backup directory for host {host}"))?;
    let tablespaces_dir = backup_dirs::tablespaces(backup_dir);

    let mut copies = vec![rsync::Options::new(
        vec![rsync::contents_of(intermediate.coordinator_data_dir())],
        rsync::contents_of(backup_dirs::post_upgrade_coordinator(backup_dir)),
    )
    .to_host(host)
    .with_options(&[RsyncOption::Archive, RsyncOption::Delete, RsyncOption::Stats])];

    let coordinator = config.source.coordinator();
    for (oid, info) in config
        .source
        .tablespaces
        .for_db_id(coordinator.db_id)
        .into_iter()
        .flatten()
        .filter(|(_, info)| info.user_defined)
    {
        let upgraded = target_tablespace_dir(
            &info.location,
            coordinator.db_id,
            config.target_version,
            &config.target_catalog_version,
        );
        copies.push(
            rsync::Options::new(
                vec![upgraded.to_string()],
                rsync::contents_of(tablespaces_dir.join(oid.to_string())),
            )
            .to_host(host)
            .with_options(&[RsyncOption::Archive, RsyncOption::Delete, RsyncOption::Stats]),
        );
    }

    if pg_upgrade::needs_old_tablespaces_file(config) {
        copies.push(
            rsync::Options::new(
                vec![state_dir.join(OLD_TABLESPACES_FILE_NAME).to_string()],
                rsync::contents_of(&tablespaces_dir),
            )
            .to_host(host)
            .with_options(&[RsyncOption::Archive]),
        );
    }
    Ok(copies)
}

async fn copy_master(
    config: &Config,
    state_dir: &Utf8Path,
    sink: &dyn OutputSink,
) -> anyhow::Result<()> {
    for_each_concurrently(config.source.primary_hosts(), |host| {
        let copies = copy_master_options(config, &host, state_dir);
        async move {
            let output = BufferedOutput::new();
            let result = async {
                for copy in copies? {
                    rsync::rsync(&copy, &output).await?;
                }
                anyhow::Ok(())
            }
            .await;
            output.flush_to(sink);
            result.with_context(|| format!("copy coordinator to {host}"))
        }
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
    fn copies_the_upgraded_coordinator_to_the_hosts_backup_directory() {
        let config = example_config_with_intermediate();
        let copies =
            copy_master_options(&config, "sdw1", Utf8Path::new("/home/gpadmin/.gpupgrade"))
                .unwrap();

        assert_eq!(copies.len(), 1);
        assert_eq!(
            copies[0].sources,
            vec!["/data/qddir/demoDataDir.ABC123xyz_-.-1/".to_string()]
        );
        assert_eq!(copies[0].destination_host.as_deref(), Some("sdw1"));
        assert_eq!(
            copies[0].destination,
            "/data/dbfast1/.gpupgrade/coordinator-post-upgrade/"
        );
        assert!(copies[0].options.contains(&RsyncOption::Delete));
    }

    #[test]
    fn copies_user_tablespaces_and_the_5x_mapping_file() {
        let mut config = example_config_with_intermediate();
        config.source.tablespaces.insert(
            1,
            16386,
            TablespaceInfo {
                location: "/data/tblspc/qddir".into(),
                user_defined: true,
            },
        );
        config.source.tablespaces.insert(
            1,
            1663,
            TablespaceInfo {
                location: "/data/qddir/demoDataDir-1/base".into(),
                user_defined: false,
            },
        );

        let copies =
            copy_master_options(&config, "sdw2", Utf8Path::new("/home/gpadmin/.gpupgrade"))
                .unwrap();
        assert_eq!(copies.len(), 3);
        assert_eq!(
            copies[1].sources,
            vec!["/data/tblspc/qddir/1/GPDB_6_301908232".to_string()]
        );
        assert_eq!(
            copies[1].destination,
            "/data/dbfast2/.gpupgrade/tablespaces/16386/"
        );
        assert_eq!(
            copies[2].sources,
            vec!["/home/gpadmin/.gpupgrade/old_tablespaces.txt".to_string()]
        );
        assert_eq!(copies[2].destination, "/data/dbfast2/.gpupgrade/tablespaces/");
    }

    #[test]
    fn unknown_hosts_have_nothing_to_copy_to() {
        let config = example_config_with_intermediate();
        let err = copy_master_options(&config, "sdw7", Utf8Path::new("/tmp")).unwrap_err();
        assert_eq!(err.to_string(), "no backup directory for host sdw7");
    }
}
