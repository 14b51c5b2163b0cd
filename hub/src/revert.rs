//! The hub's half of revert: removing the intermediate cluster and bringing the source
//! cluster back as it was. Each substep only runs if the step it undoes may have run.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

use greenplum::tablespaces::target_tablespace_dir;
use greenplum::{utilities, Cluster, Mode, SegConfig};
use step::{OutStreams, Phase, Step, StepError, StepStore, Substep, SubstepError};
use upgrade::{data_dirs, wire, Config};
use upgrade_proto::idl::{self, response};
use utils::exec::{ExecError, OutputSink};
use utils::rsync::{self, RsyncOption};

use crate::agent_conns::{for_each_agent, rpc_error};
use crate::finalize::{archive_log_directories, delete_backup_dirs, delete_segment_state_dirs};
use crate::server::cluster_info;
use crate::{active_connections, Hub};

/// Exit status of gpstart when some segments failed to come up.
const GPSTART_PARTIAL_FAILURE_EXIT_CODE: i32 = 1;

/// A link mode upgrade that started execute modified the source's only copy of its data.
pub fn ensure_revert_possible(config: &Config, store: &StepStore) -> anyhow::Result<()> {
    let source = &config.source;
    if !source.has_mirrors()
        && !source.has_standby()
        && config.mode == Mode::Link
        && store.has_phase_started(Phase::Execute)?
    {
        anyhow::bail!(
            "The source cluster does not have mirrors and a standby. Since execute was run \
             in link mode the source cluster cannot be restored. Please contact support."
        );
    }
    Ok(())
}

/// What the store says about the steps revert may have to undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevertConditions {
    pub config_saved: bool,
    pub agents_started: bool,
    pub primaries_upgraded: bool,
}

impl RevertConditions {
    pub fn read(store: &StepStore) -> anyhow::Result<RevertConditions> {
        Ok(RevertConditions {
            config_saved: store
                .has_substep_completed(Phase::Initialize, Substep::SavingSourceClusterConfig)?,
            agents_started: store.has_substep_run(Phase::Initialize, Substep::StartAgents)?,
            primaries_upgraded: store.has_substep_run(Phase::Execute, Substep::UpgradePrimaries)?,
        })
    }
}

pub async fn revert(
    hub: &Hub,
    streams: Arc<dyn OutStreams>,
) -> Result<response::Contents, StepError> {
    let config = hub.config();
    let store = hub.store();
    ensure_revert_possible(&config, &store).map_err(StepError::Hub)?;
    let cond = RevertConditions::read(&store).map_err(StepError::Store)?;
    info!("reverting with {cond:?}");

    let link = config.mode == Mode::Link;
    let source_is_5x = config.source.version.major == 5;
    let mut st = Step::new(Phase::Revert, store, streams);

    st.run_conditionally(
        Substep::EnsureGpupgradeAgentsAreRunning,
        cond.config_saved && cond.agents_started,
        |_| async move { hub.agents().await.map(|_| ()) },
    )
    .await;

    st.run_conditionally(
        Substep::CheckActiveConnectionsOnTargetCluster,
        cond.config_saved,
        |_| async move {
            let config = hub.config();
            let intermediate = config.intermediate.as_ref().ok_or(SubstepError::Skip)?;
            active_connections::check(intermediate).await
        },
    )
    .await;

    st.run_conditionally(
        Substep::ShutdownTargetCluster,
        cond.config_saved,
        |streams| async move {
            let config = hub.config();
            let intermediate = config.intermediate.as_ref().ok_or(SubstepError::Skip)?;
            utilities::stop_if_running(intermediate, streams.sink()).await?;
            Ok::<_, SubstepError>(())
        },
    )
    .await;

    st.run_conditionally(
        Substep::DeleteTargetClusterDatadirs,
        cond.config_saved,
        |_| async move { delete_target_data_dirs(hub).await },
    )
    .await;

    st.run_conditionally(
        Substep::DeleteTablespaces,
        cond.config_saved,
        |_| async move { delete_target_tablespaces(hub).await },
    )
    .await;

    st.run_conditionally(
        Substep::RestorePgcontrol,
        cond.config_saved && link,
        |_| async move { restore_pg_control(hub).await },
    )
    .await;

    st.run_conditionally(
        Substep::RestoreSourceCluster,
        cond.config_saved && link && config.source.has_all_mirrors_and_standby(),
        |_| async move { restore_source_cluster(hub).await },
    )
    .await;

    let expect_partial_start = source_is_5x && !link && cond.primaries_upgraded;
    st.run_conditionally(
        Substep::StartSourceCluster,
        cond.config_saved,
        |streams| async move {
            start_source_cluster(&hub.config().source, expect_partial_start, streams.sink()).await
        },
    )
    .await;

    st.run_conditionally(
        Substep::RecoversegSourceCluster,
        cond.config_saved && expect_partial_start,
        |streams| async move { utilities::recoverseg(&hub.config().source, streams.sink()).await },
    )
    .await;

    st.always_run(Substep::ArchiveLogDirectories, |_| async move {
        archive_log_directories(hub, cond.agents_started).await.map(|_| ())
    })
    .await;

    st.run_conditionally(Substep::DeleteBackupdir, cond.config_saved, |_| async move {
        delete_backup_dirs(hub).await
    })
    .await;

    st.always_run(Substep::DeleteSegmentStatedirs, |_| async move {
        if !cond.agents_started {
            return Err(SubstepError::Skip);
        }
        delete_segment_state_dirs(hub).await?;
        Ok(())
    })
    .await;

    st.finish()?;

    let config = hub.config();
    Ok(response::Contents::RevertResponse(idl::RevertResponse {
        source: Some(cluster_info(&config.source)),
        log_archive_directory: config
            .log_archive_dir
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_default(),
    }))
}

/// Deletes the data directories of every intermediate segment. The coordinator's is
/// deleted locally.
async fn delete_target_data_dirs(hub: &Hub) -> Result<(), SubstepError> {
    let config = hub.config();
    let intermediate = config.intermediate.as_ref().ok_or(SubstepError::Skip)?;

    data_dirs::delete_data_directories(&[intermediate.coordinator_data_dir().clone()])?;

    let by_host = data_dirs_by_host(intermediate.segments().filter(|s| !s.is_coordinator()));
    let agents = hub
        .agents_on(&by_host.keys().cloned().collect::<Vec<_>>())
        .await?;
    for_each_agent(&agents, |conn| {
        let data_dirs = paths_on(&by_host, &conn.hostname);
        async move {
            conn.client()
                .delete_data_directories(idl::DeleteDataDirectoriesRequest { data_dirs })
                .await
                .map_err(rpc_error)?;
            Ok(())
        }
    })
    .await
    .map_err(anyhow::Error::from)?;
    Ok(())
}

fn data_dirs_by_host<'a>(
    segments: impl Iterator<Item = &'a SegConfig>,
) -> BTreeMap<String, Vec<Utf8PathBuf>> {
    let mut by_host: BTreeMap<String, Vec<Utf8PathBuf>> = BTreeMap::new();
    for seg in segments {
        by_host
            .entry(seg.hostname.clone())
            .or_default()
            .push(seg.data_dir.clone());
    }
    by_host
}

fn paths_on(by_host: &BTreeMap<String, Vec<Utf8PathBuf>>, host: &str) -> Vec<String> {
    by_host
        .get(host)
        .into_iter()
        .flatten()
        .map(|p| p.to_string())
        .collect()
}

/// The directories the target version created in the source's user tablespaces, which
/// exist once the intermediate cluster was initialized.
pub fn target_tablespace_dirs(config: &Config, seg: &SegConfig) -> Vec<Utf8PathBuf> {
    config
        .source
        .tablespaces
        .user_defined_locations(seg.db_id)
        .iter()
        .map(|location| {
            target_tablespace_dir(
                location,
                seg.db_id,
                config.target_version,
                &config.target_catalog_version,
            )
        })
        .collect()
}

async fn delete_target_tablespaces(hub: &Hub) -> Result<(), SubstepError> {
    let config = hub.config();
    if config.target_catalog_version.is_empty() {
        return Err(SubstepError::Skip);
    }

    let coordinator = config.source.coordinator();
    data_dirs::delete_tablespace_directories(&target_tablespace_dirs(&config, coordinator))?;

    let by_host = BTreeMap::from_iter(config.source.primaries_by_host().into_iter().map(
        |(host, primaries)| {
            let dirs = primaries
                .into_iter()
                .flat_map(|seg| target_tablespace_dirs(&config, seg))
                .collect::<Vec<_>>();
            (host, dirs)
        },
    ));
    let agents = hub
        .agents_on(&by_host.keys().cloned().collect::<Vec<_>>())
        .await?;
    for_each_agent(&agents, |conn| {
        let dirs = paths_on(&by_host, &conn.hostname);
        async move {
            if dirs.is_empty() {
                return Ok(());
            }
            conn.client()
                .delete_tablespace_directories(idl::DeleteTablespaceDirectoriesRequest { dirs })
                .await
                .map_err(rpc_error)?;
            Ok(())
        }
    })
    .await
    .map_err(anyhow::Error::from)?;
    Ok(())
}

async fn restore_pg_control(hub: &Hub) -> anyhow::Result<()> {
    let config = hub.config();
    data_dirs::restore_pg_control(config.source.coordinator_data_dir())?;

    let by_host = data_dirs_by_host(config.source.primaries_excluding_coordinator());
    let agents = hub
        .agents_on(&by_host.keys().cloned().collect::<Vec<_>>())
        .await?;
    for_each_agent(&agents, |conn| {
        let data_dirs = paths_on(&by_host, &conn.hostname);
        async move {
            conn.client()
                .restore_pg_control(idl::RestorePgControlRequest { data_dirs })
                .await
                .map_err(rpc_error)?;
            Ok(())
        }
    })
    .await?;
    Ok(())
}

/// Where the source keeps a user tablespace: 5X filespaces are per segment already,
/// later versions add a db id directory under the shared location.
fn source_tablespace_dir(source: &Cluster, location: &Utf8Path, db_id: i32) -> Utf8PathBuf {
    if source.version.major == 5 {
        location.to_owned()
    } else {
        location.join(db_id.to_string())
    }
}

/// Per mirror host, the copies restoring each primary, and the coordinator, from its
/// untouched mirror.
pub fn restore_copies(source: &Cluster) -> anyhow::Result<BTreeMap<String, Vec<rsync::Options>>> {
    let excludes = data_dirs::SEGMENT_LOCAL_FILES
        .iter()
        .chain(&["postmaster.pid", "recovery.conf", "backup_label"])
        .copied();

    let mut by_host: BTreeMap<String, Vec<rsync::Options>> = BTreeMap::new();
    for mirror in source.mirrors.values() {
        let primary = source
            .primaries
            .get(&mirror.content_id)
            .with_context(|| format!("no primary for the mirror of content {}", mirror.content_id))?;
        let copies = by_host.entry(mirror.hostname.clone()).or_default();

        copies.push(
            rsync::Options::new(
                vec![rsync::contents_of(&mirror.data_dir)],
                rsync::contents_of(&primary.data_dir),
            )
            .to_host(&primary.hostname)
            .with_options(&[RsyncOption::Archive, RsyncOption::Delete])
            .with_excludes(excludes.clone()),
        );

        let tablespaces = &source.tablespaces;
        let Some(mirror_tablespaces) = tablespaces.for_db_id(mirror.db_id) else {
            continue;
        };
        for (oid, info) in mirror_tablespaces.iter().filter(|(_, t)| t.user_defined) {
            let primary_location = tablespaces
                .for_db_id(primary.db_id)
                .and_then(|ts| ts.get(oid))
                .map(|ts| &ts.location)
                .with_context(|| {
                    format!("dbid {} has no location for tablespace {oid}", primary.db_id)
                })?;
            copies.push(
                rsync::Options::new(
                    vec![rsync::contents_of(source_tablespace_dir(
                        source,
                        &info.location,
                        mirror.db_id,
                    ))],
                    rsync::contents_of(source_tablespace_dir(
                        source,
                        primary_location,
                        primary.db_id,
                    )),
                )
                .to_host(&primary.hostname)
                .with_options(&[RsyncOption::Archive, RsyncOption::Delete]),
            );
        }
    }
    Ok(by_host)
}

/// Link mode upgraded the primaries in place, so they are brought back from their
/// mirrors, which the upgrade never touched.
async fn restore_source_cluster(hub: &Hub) -> anyhow::Result<()> {
    let config = hub.config();
    let copies = restore_copies(&config.source)?;
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

/// After a 5X copy mode upgrade the mirrors refuse to start until they are recovered,
/// so gpstart reporting a partial failure is expected then.
async fn start_source_cluster(
    source: &Cluster,
    expect_partial_start: bool,
    sink: &dyn OutputSink,
) -> Result<(), SubstepError> {
    if utilities::is_coordinator_running(source).await? {
        return Err(SubstepError::Skip);
    }
    tolerate_partial_start(utilities::start(source, sink).await, expect_partial_start)
}

fn tolerate_partial_start(
    result: Result<(), ExecError>,
    expect_partial_start: bool,
) -> Result<(), SubstepError> {
    match result {
        Err(e)
            if expect_partial_start
                && e.exit_code() == Some(GPSTART_PARTIAL_FAILURE_EXIT_CODE) =>
        {
            info!("source cluster partially started, its mirrors are recovered next: {e}");
            Ok(())
        }
        other => other.map_err(SubstepError::from),
    }
}
