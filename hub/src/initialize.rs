//! The hub's half of initialize: checking every host, then creating the intermediate
//! cluster and making sure pg_upgrade is happy with the source.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use greenplum::{db, utilities, Cluster};
use step::{NextActionError, OutStreams, Phase, Step, StepError, Substep, SubstepError};
use upgrade::paths::OLD_TABLESPACES_FILE_NAME;
use upgrade::{backup_dirs, data_dirs, disk, environment, wire, BackupDirs, Config};
use upgrade_proto::idl::{self, response, PgUpgradeAction};
use utils::crashsafe;
use utils::exec::OutputSink;
use utils::rsync::{self, RsyncOption};

use crate::agent_conns::{for_each_agent, rpc_error, AggregateError};
use crate::init_config::InitConfig;
use crate::{intermediate, pg_upgrade, Hub};

pub const PARENT_BACKUP_DIRS_HINT: &str = "Please specify a different location with the parent_backup_dirs configuration option, \
e.g. parent_backup_dirs = \"/data/backup\" or parent_backup_dirs = \"cdw:/data/backup,sdw1:/data/backup\".";

pub const CLUSTER_READY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub async fn initialize(
    hub: &Hub,
    streams: Arc<dyn OutStreams>,
) -> Result<response::Contents, StepError> {
    let mut st = Step::new(Phase::Initialize, hub.store(), streams);

    st.always_run(Substep::StartAgents, |_| async move {
        hub.agents().await.map(|_| ())
    })
    .await;

    st.always_run(Substep::CheckEnvironment, |_| async move {
        check_environment(hub).await
    })
    .await;

    st.run(Substep::CreateBackupdirs, |_| async move {
        let config = hub.config();
        create_backup_dirs(hub, &config.backup_dirs, &config.source).await
    })
    .await;

    let config = hub.config();
    st.run_conditionally(
        Substep::CheckDiskSpace,
        config.disk_free_ratio > 0.0,
        |_| async move { check_disk_space(hub).await },
    )
    .await;

    st.finish()?;
    Ok(response::Contents::InitializeResponse(idl::InitializeResponse {
        has_all_mirrors_and_standby: config.source.has_all_mirrors_and_standby(),
    }))
}

pub async fn create_cluster(
    hub: &Hub,
    streams: Arc<dyn OutStreams>,
) -> Result<response::Contents, StepError> {
    let mut st = Step::new(Phase::Initialize, hub.store(), streams);

    st.run(Substep::GenerateTargetConfig, |_| async move {
        generate_target_config(hub).await
    })
    .await;

    st.run(Substep::InitTargetCluster, |streams| async move {
        init_target_cluster(hub, streams.sink()).await
    })
    .await;

    let config = hub.config();
    st.run_conditionally(
        Substep::SettingDynamicLibraryPathOnTargetCluster,
        config.dynamic_library_path != upgrade::DEFAULT_DYNAMIC_LIBRARY_PATH,
        |streams| async move { set_dynamic_library_path(hub, streams.sink()).await },
    )
    .await;

    st.always_run(Substep::ShutdownTargetCluster, |streams| async move {
        let config = hub.config();
        utilities::stop_if_running(config.intermediate()?, streams.sink()).await
    })
    .await;

    st.run(Substep::BackupTargetMaster, |streams| async move {
        backup_target_master(&hub.config(), streams.sink()).await
    })
    .await;

    st.always_run(Substep::InitializeWaitForClusterToBeReady, |_| async move {
        let port = hub.config().source.coordinator_port();
        db::wait_for_cluster_ready(port, CLUSTER_READY_TIMEOUT).await
    })
    .await;

    st.always_run(Substep::CheckUpgrade, |streams| async move {
        let config = hub.config();
        pg_upgrade::upgrade_coordinator(hub, &config, PgUpgradeAction::Check, streams.sink())
            .await?;
        pg_upgrade::upgrade_primaries(hub, &config, PgUpgradeAction::Check).await
    })
    .await;

    st.finish()?;
    Ok(response::Contents::InitializeResponse(idl::InitializeResponse {
        has_all_mirrors_and_standby: config.source.has_all_mirrors_and_standby(),
    }))
}

async fn check_environment(hub: &Hub) -> anyhow::Result<()> {
    let config = hub.config();
    let gphomes = [&config.source_gphome, &config.target_gphome];
    for gphome in gphomes {
        environment::check_gphome(gphome)
            .with_context(|| format!("host {}", config.source.coordinator_hostname()))?;
    }

    let request = idl::CheckEnvironmentRequest {
        gphomes: gphomes.iter().map(|g| g.to_string()).collect(),
    };
    let agents = hub.agents().await?;
    for_each_agent(&agents, |conn| {
        let request = request.clone();
        async move {
            conn.client()
                .check_environment(request)
                .await
                .map_err(rpc_error)?;
            Ok(())
        }
    })
    .await?;
    Ok(())
}

/// Creates the backup directories of the coordinator and of every primary host. Every
/// failing host is reported.
pub async fn create_backup_dirs(
    hub: &Hub,
    dirs: &BackupDirs,
    source: &Cluster,
) -> anyhow::Result<()> {
    let mut errors = Vec::new();
    if let Err(e) = backup_dirs::create_backup_directory(&dirs.coordinator_backup_dir) {
        errors.push(anyhow::Error::new(e).context(format!(
            "host {}: create {}",
            source.coordinator_hostname(),
            dirs.coordinator_backup_dir
        )));
    }

    let agents = hub.agents_on(&source.primary_hosts()).await?;
    let created = for_each_agent(&agents, |conn| {
        let backup_dir = dirs.for_host(&conn.hostname).map(|d| d.to_string());
        async move {
            let backup_dir = backup_dir.context("no backup directory for this host")?;
            conn.client()
                .create_backup_directory(idl::CreateBackupDirectoryRequest { backup_dir })
                .await
                .map_err(rpc_error)?;
            Ok(())
        }
    })
    .await;
    if let Err(AggregateError(agent_errors)) = created {
        errors.extend(agent_errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(NextActionError::new(AggregateError(errors), PARENT_BACKUP_DIRS_HINT).into())
    }
}

/// Measures the filesystems of every data directory and backup directory, and fails
/// with a table of shortfalls if any has less than the configured share free.
async fn check_disk_space(hub: &Hub) -> anyhow::Result<()> {
    let config = hub.config();
    let coordinator_host = config.source.coordinator_hostname();

    let mut usages = Vec::new();
    for dir in [
        config.source.coordinator_data_dir(),
        &config.backup_dirs.coordinator_backup_dir,
    ] {
        usages.push((coordinator_host.to_string(), disk::usage(dir)?));
    }

    let by_host = config.source.segments_by_host();
    let reported = Mutex::new(Vec::new());
    let agents = hub.agents().await?;
    for_each_agent(&agents, |conn| {
        let mut dirs: Vec<String> = by_host
            .get(&conn.hostname)
            .into_iter()
            .flatten()
            .filter(|seg| !seg.is_coordinator())
            .map(|seg| seg.data_dir.to_string())
            .collect();
        if let Some(backup_dir) = config.backup_dirs.for_host(&conn.hostname) {
            dirs.push(backup_dir.to_string());
        }
        let reported = &reported;
        async move {
            let reply = conn
                .client()
                .check_disk_space(idl::CheckDiskSpaceRequest { dirs })
                .await
                .map_err(rpc_error)?
                .into_inner();
            let mut reported = reported.lock().unwrap();
            for usage in reply.usages {
                reported.push((conn.hostname.clone(), wire::usage_from_proto(usage)));
            }
            Ok(())
        }
    })
    .await?;

    let mut reported = reported.into_inner().unwrap();
    reported.sort_by(|a, b| a.0.cmp(&b.0));
    usages.extend(reported);

    disk::check(&usages, config.disk_free_ratio)?;
    Ok(())
}

async fn generate_target_config(hub: &Hub) -> anyhow::Result<()> {
    let config = hub.config();
    let client = db::connect(config.source.coordinator_port(), "template1").await?;
    let encoding = db::show(&client, "server_encoding")
        .await?
        .context("source cluster did not report its server_encoding")?;
    // 7X dropped the setting.
    let checkpoint_segments = if config.target_version.major < 7 {
        db::show(&client, "checkpoint_segments").await?
    } else {
        None
    };

    let intermediate = intermediate::create(
        &config.source,
        &config.intermediate_ports,
        &config.upgrade_id,
        &config.target_gphome,
        config.target_version,
    )?;
    let seg_prefix = intermediate::segment_prefix(&config.source)?;
    let init_config = InitConfig {
        intermediate: &intermediate,
        seg_prefix: &seg_prefix,
        encoding: &encoding,
        checkpoint_segments: checkpoint_segments.as_deref(),
        use_hba_hostnames: config.use_hba_hostnames,
    }
    .render();

    let path = Config::init_config_path(hub.state_dir());
    info!("writing intermediate cluster configuration to {path}");
    crashsafe::overwrite(&path, init_config.as_bytes())?;

    if pg_upgrade::needs_old_tablespaces_file(&config) {
        let contents = config.source.tablespaces.old_tablespaces_file_contents();
        crashsafe::overwrite(
            &hub.state_dir().join(OLD_TABLESPACES_FILE_NAME),
            contents.as_bytes(),
        )?;
    }

    hub.update_config(|c| c.intermediate = Some(intermediate))
}

async fn init_target_cluster(hub: &Hub, sink: &dyn OutputSink) -> anyhow::Result<()> {
    let config = hub.config();
    let intermediate = config.intermediate()?;

    remove_intermediate_cluster(hub, intermediate, sink).await?;
    utilities::init_system(
        &config.target_gphome,
        &Config::init_config_path(hub.state_dir()),
        sink,
    )
    .await?;

    let catalog_version =
        utilities::catalog_version(&config.target_gphome, intermediate.coordinator_data_dir())
            .await?;
    info!("intermediate cluster has catalog version {catalog_version}");
    hub.update_config(|c| {
        c.target_catalog_version = catalog_version.clone();
        if let Some(intermediate) = c.intermediate.as_mut() {
            intermediate.catalog_version = catalog_version;
        }
    })
}

/// Stops and deletes whatever a previous attempt of init_target_cluster left behind.
async fn remove_intermediate_cluster(
    hub: &Hub,
    intermediate: &Cluster,
    sink: &dyn OutputSink,
) -> anyhow::Result<()> {
    let coordinator_dir = intermediate.coordinator_data_dir();
    if coordinator_dir.exists() {
        info!("removing intermediate cluster left by a previous attempt");
        utilities::stop_if_running(intermediate, sink).await?;
    }
    data_dirs::delete_data_directories(&[coordinator_dir.clone()])?;

    let by_host = intermediate.primaries_by_host();
    let agents = hub.agents_on(&intermediate.primary_hosts()).await?;
    for_each_agent(&agents, |conn| {
        let data_dirs = by_host
            .get(&conn.hostname)
            .into_iter()
            .flatten()
            .map(|seg| seg.data_dir.to_string())
            .collect();
        async move {
            conn.client()
                .delete_data_directories(idl::DeleteDataDirectoriesRequest { data_dirs })
                .await
                .map_err(rpc_error)?;
            Ok(())
        }
    })
    .await?;
    Ok(())
}

async fn set_dynamic_library_path(hub: &Hub, sink: &dyn OutputSink) -> Result<(), SubstepError> {
    let config = hub.config();
    let intermediate = config.intermediate()?;
    if !utilities::is_coordinator_running(intermediate).await? {
        utilities::start(intermediate, sink).await?;
    }
    utilities::set_guc(
        intermediate,
        "dynamic_library_path",
        &config.dynamic_library_path,
        sink,
    )
    .await?;
    Ok(())
}

/// Keeps a pristine copy of the intermediate coordinator, so that every execute starts
/// the coordinator upgrade from the same state.
async fn backup_target_master(config: &Config, sink: &dyn OutputSink) -> anyhow::Result<()> {
    let intermediate = config.intermediate()?;
    let pre = backup_dirs::pre_upgrade_coordinator(&config.backup_dirs.coordinator_backup_dir);
    let opts = rsync::Options::new(
        vec![rsync::contents_of(intermediate.coordinator_data_dir())],
        rsync::contents_of(&pre),
    )
    .with_options(&[RsyncOption::Archive, RsyncOption::Delete, RsyncOption::Stats]);
    rsync::rsync(&opts, sink).await?;
    Ok(())
}
