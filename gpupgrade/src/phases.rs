//! `gpupgrade execute`, `finalize` and `revert`. The hub does the work; the CLI owns the
//! phase's status and, once the hub is no longer needed, stops it and removes the state
//! directory.

use std::sync::Arc;

use anyhow::Context;
use camino::Utf8Path;
use tracing::info;

use step::{BeginOptions, ConsoleStreams, Phase, Step, StepStore, Substep, SubstepError};
use upgrade::Config;
use upgrade_proto::idl::{self, response};

use crate::hub_client;

#[derive(clap::Args, Debug)]
pub struct PhaseArgs {
    #[arg(long)]
    non_interactive: bool,
    #[arg(long, short)]
    verbose: bool,
}

#[derive(clap::Args, Debug)]
pub struct ExecuteArgs {
    #[command(flatten)]
    common: PhaseArgs,
    #[arg(long, requires = "verbose")]
    pg_upgrade_verbose: bool,
    /// Moves the backup directories, in the same syntax as initialize
    #[arg(long = "parent-backup-dir")]
    parent_backup_dirs: Option<String>,
}

const EXECUTE_CONFIRMATION: &str = "\nYou are about to run the \"execute\" command for a major-version upgrade of Greenplum.\n\
This should be done only during a downtime window.\n\n\
gpupgrade execute will upgrade the coordinator and primary segments to the target\n\
version. The source cluster will be stopped and will not be available until\n\
execute completes or the upgrade is reverted.\n";

const FINALIZE_CONFIRMATION: &str = "\nYou are about to finalize a major-version upgrade of Greenplum.\n\
This should be done only during a downtime window.\n\n\
gpupgrade finalize will upgrade the standby and mirrors, and move the upgraded\n\
cluster into the source cluster's ports and data directories.\n\n\
WARNING: After finalize completes the upgrade can no longer be reverted.\n";

const REVERT_CONFIRMATION: &str = "\nYou are about to revert this upgrade.\n\
This should be done only during a downtime window.\n\n\
gpupgrade revert will delete the intermediate cluster and restore the source\n\
cluster to the state it was in before initialize.\n";

fn begin(
    phase: Phase,
    state_dir: &Utf8Path,
    args: &PhaseArgs,
    confirmation_text: &str,
) -> anyhow::Result<Step> {
    let store = Arc::new(StepStore::new(state_dir));
    let streams = Arc::new(ConsoleStreams::new(args.verbose));
    let st = Step::begin(
        phase,
        store,
        streams,
        BeginOptions {
            verbose: args.verbose,
            non_interactive: args.non_interactive,
            confirmation_text,
        },
        std::io::stdin().lock(),
    )?;
    Ok(st)
}

/// How to point a shell at a cluster.
fn cluster_env(gphome: &Utf8Path, info: Option<&idl::ClusterInfo>) -> String {
    match info {
        Some(info) => format!(
            "source {gphome}/greenplum_path.sh\n\
             export MASTER_DATA_DIRECTORY={}\n\
             export PGPORT={}",
            info.coordinator_data_directory, info.port
        ),
        None => String::new(),
    }
}

pub async fn execute(args: ExecuteArgs, state_dir: &Utf8Path) -> anyhow::Result<()> {
    let mut st = begin(Phase::Execute, state_dir, &args.common, EXECUTE_CONFIRMATION)?;
    let config = Config::load(state_dir)?;
    let port = config.hub_port;

    let request = idl::ExecuteRequest {
        parent_backup_dirs: args.parent_backup_dirs.unwrap_or_default(),
        pg_upgrade_verbose: args.pg_upgrade_verbose,
    };
    let mut target = None;
    let target_ref = &mut target;
    st.run_hub_substep(|streams| async move {
        let mut client = hub_client::connect_or_advise(port).await?;
        let stream = client
            .execute(request)
            .await
            .map_err(hub_client::status_error)?
            .into_inner();
        if let response::Contents::ExecuteResponse(r) =
            hub_client::consume(stream, streams.as_ref()).await?
        {
            *target_ref = r.target;
        }
        Ok(())
    })
    .await;

    st.complete(&format!(
        "Execute completed successfully.\n\n\
         The intermediate cluster is now running. Before finalizing, you may run queries\n\
         against it and perform any other validation desired:\n\n{}\n\n\
         NEXT ACTIONS\n\
         To complete the upgrade, run \"gpupgrade finalize\".\n\n\
         To return the cluster to its original state, run \"gpupgrade revert\".",
        cluster_env(&config.target_gphome, target.as_ref())
    ))?;
    Ok(())
}

/// Stops the hub, which stops the agents first. A hub that is not running is fine.
async fn stop_hub_and_agents(port: u16) -> Result<(), SubstepError> {
    let Ok(mut client) = hub_client::connect(port).await else {
        info!("hub is not running");
        return Err(SubstepError::Skip);
    };
    match client.stop_services(idl::StopServicesRequest {}).await {
        Ok(_) => Ok(()),
        Err(status) if hub::agent_conns::is_agent_already_stopped(&status) => Ok(()),
        Err(status) => Err(hub_client::status_error(status)
            .context("stop hub and agents")
            .into()),
    }
}

fn delete_state_dir(state_dir: &Utf8Path) -> anyhow::Result<()> {
    info!("deleting state directory {state_dir}");
    utils::fs_ext::remove_dir_all(state_dir)
        .with_context(|| format!("delete state directory {state_dir}"))
}

/// The last substeps of finalize and revert: nothing in the state directory is needed
/// any more, including the step store itself.
async fn stop_and_clean_up(st: &mut Step, port: Option<u16>, state_dir: &Utf8Path) {
    if let Some(port) = port {
        st.always_run(Substep::StopHubAndAgents, |_| stop_hub_and_agents(port))
            .await;
    }
    if st.err().is_some() {
        return;
    }
    st.disable_store();
    st.always_run(Substep::DeleteMasterStatedir, |_| async move {
        delete_state_dir(state_dir)
    })
    .await;
}

pub async fn finalize(args: PhaseArgs, state_dir: &Utf8Path) -> anyhow::Result<()> {
    let mut st = begin(Phase::Finalize, state_dir, &args, FINALIZE_CONFIRMATION)?;
    let config = Config::load(state_dir)?;

    let mut finalized = None;
    let finalized_ref = &mut finalized;
    let port = config.hub_port;
    st.run_hub_substep(|streams| async move {
        let mut client = hub_client::connect_or_advise(port).await?;
        let stream = client
            .finalize(idl::FinalizeRequest {})
            .await
            .map_err(hub_client::status_error)?
            .into_inner();
        if let response::Contents::FinalizeResponse(r) =
            hub_client::consume(stream, streams.as_ref()).await?
        {
            *finalized_ref = Some(r);
        }
        Ok(())
    })
    .await;

    stop_and_clean_up(&mut st, Some(port), state_dir).await;

    let finalized = finalized.unwrap_or_default();
    st.complete(&format!(
        "Finalize completed successfully.\n\n\
         The target cluster is now upgraded and is ready to be used.\n\n\
         {env}\n\n\
         The source coordinator data directory was archived to {archived}\n\
         The gpupgrade logs can be found on all hosts in {logs}\n\n\
         NEXT ACTIONS\n\
         Run the post-finalize data migration scripts with\n\
         \"gpupgrade apply --phase post-finalize\".\n\n\
         Upgrade {id} is complete.",
        env = cluster_env(&config.target_gphome, finalized.target.as_ref()),
        archived = finalized.archived_source_coordinator_data_directory,
        logs = finalized.log_archive_directory,
        id = finalized.upgrade_id,
    ))?;
    Ok(())
}

pub async fn revert(args: PhaseArgs, state_dir: &Utf8Path) -> anyhow::Result<()> {
    let mut st = begin(Phase::Revert, state_dir, &args, REVERT_CONFIRMATION)?;

    // Without a saved configuration initialize never got far enough to start anything,
    // so there is only the state directory to remove.
    let config_saved = StepStore::new(state_dir)
        .has_substep_completed(Phase::Initialize, Substep::SavingSourceClusterConfig)?;
    let config = if config_saved {
        Some(Config::load(state_dir)?)
    } else {
        None
    };
    let port = config.as_ref().map(|c| c.hub_port);

    let mut reverted = None;
    if let Some(port) = port {
        st.always_run(Substep::StartHub, |streams| async move {
            hub_client::start_hub(port, streams.sink()).await
        })
        .await;

        let reverted_ref = &mut reverted;
        st.run_hub_substep(|streams| async move {
            let mut client = hub_client::connect_or_advise(port).await?;
            let stream = client
                .revert(idl::RevertRequest {})
                .await
                .map_err(hub_client::status_error)?
                .into_inner();
            if let response::Contents::RevertResponse(r) =
                hub_client::consume(stream, streams.as_ref()).await?
            {
                *reverted_ref = Some(r);
            }
            Ok(())
        })
        .await;
    }

    stop_and_clean_up(&mut st, port, state_dir).await;

    let reverted = reverted.unwrap_or_default();
    let mut text = String::from("Revert completed successfully.\n\n");
    if let (Some(config), Some(source)) = (&config, &reverted.source) {
        text.push_str(&format!(
            "The source cluster is now restored to its original state.\n\n{}\n\n",
            cluster_env(&config.source_gphome, Some(source))
        ));
    }
    if !reverted.log_archive_directory.is_empty() {
        text.push_str(&format!(
            "The gpupgrade logs can be found on all hosts in {}\n\n",
            reverted.log_archive_directory
        ));
    }
    text.push_str(
        "NEXT ACTIONS\n\
         Run the post-revert data migration scripts with\n\
         \"gpupgrade apply --phase post-revert\".\n\n\
         To restart the upgrade, run \"gpupgrade initialize\" again.",
    );
    st.complete(&text)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_env_points_at_the_coordinator() {
        let info = idl::ClusterInfo {
            port: 5432,
            coordinator_data_directory: "/data/qddir/demoDataDir-1".to_string(),
            version: "6.26.0".to_string(),
        };
        assert_eq!(
            cluster_env(Utf8Path::new("/usr/local/gpdb6"), Some(&info)),
            "source /usr/local/gpdb6/greenplum_path.sh\n\
             export MASTER_DATA_DIRECTORY=/data/qddir/demoDataDir-1\n\
             export PGPORT=5432"
        );
        assert_eq!(cluster_env(Utf8Path::new("/usr/local/gpdb6"), None), "");
    }

    #[tokio::test]
    async fn stopping_a_stopped_hub_is_skipped() {
        // nothing listens on the discard port
        let err = stop_hub_and_agents(9).await.unwrap_err();
        assert!(matches!(err, SubstepError::Skip));
    }

    #[test]
    fn state_directory_removal_is_idempotent() {
        let dir = camino_tempfile::tempdir().unwrap();
        let state = dir.path().join(".gpupgrade");
        std::fs::create_dir_all(state.join("pg_upgrade")).unwrap();
        std::fs::write(state.join("config.json"), "{}").unwrap();

        delete_state_dir(&state).unwrap();
        assert!(!state.exists());
        delete_state_dir(&state).unwrap();
    }
}
