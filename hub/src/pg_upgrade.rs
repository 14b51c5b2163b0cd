//! Running pg_upgrade across the cluster: the coordinator locally, the primaries through
//! their agents.

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};

use greenplum::{Cluster, Mode, SegConfig};
use upgrade::backup_dirs;
use upgrade::paths::OLD_TABLESPACES_FILE_NAME;
use upgrade::Config;
use upgrade_proto::idl::{self, PgOptions, PgUpgradeAction, UpgradePrimariesRequest};
use utils::exec::OutputSink;

use crate::agent_conns::{for_each_agent, rpc_error};
use crate::Hub;

/// pg_upgrade options upgrading `source` into its intermediate counterpart.
pub fn pg_options(
    config: &Config,
    action: PgUpgradeAction,
    source: &SegConfig,
    intermediate: &SegConfig,
    old_tablespaces_file: Option<&Utf8Path>,
    state_dir: &Utf8Path,
) -> PgOptions {
    let mode = match config.mode {
        Mode::Copy => idl::Mode::Copy,
        Mode::Link => idl::Mode::Link,
    };
    PgOptions {
        action: action.into(),
        mode: mode.into(),
        role: source.role.as_catalog().to_string(),
        content_id: source.content_id,
        old_bin_dir: config.source.bin_dir().to_string(),
        new_bin_dir: config.target_gphome.join("bin").to_string(),
        old_data_dir: source.data_dir.to_string(),
        new_data_dir: intermediate.data_dir.to_string(),
        old_port: source.port.into(),
        new_port: intermediate.port.into(),
        old_db_id: source.db_id,
        new_db_id: intermediate.db_id,
        old_version: config.source.version.to_string(),
        new_version: config.target_version.to_string(),
        old_tablespaces_file: old_tablespaces_file
            .map(|p| p.to_string())
            .unwrap_or_default(),
        jobs: 0,
        verbose: config.pg_upgrade_verbose,
        skip_checks: false,
        state_dir: state_dir.to_string(),
    }
}

/// Whether segments need the old tablespaces file: only 5X sources with user
/// tablespaces have one.
pub fn needs_old_tablespaces_file(config: &Config) -> bool {
    config.source.version.major == 5 && !config.source.tablespaces.is_empty()
}

fn uses_old_tablespaces_file(config: &Config, action: PgUpgradeAction) -> bool {
    action == PgUpgradeAction::Upgrade && needs_old_tablespaces_file(config)
}

pub async fn upgrade_coordinator(
    hub: &Hub,
    config: &Config,
    action: PgUpgradeAction,
    sink: &dyn OutputSink,
) -> anyhow::Result<()> {
    let intermediate = config.intermediate()?;
    let tablespaces_file = hub.state_dir().join(OLD_TABLESPACES_FILE_NAME);
    let opts = pg_options(
        config,
        action,
        config.source.coordinator(),
        intermediate.coordinator(),
        uses_old_tablespaces_file(config, action).then_some(tablespaces_file.as_path()),
        hub.state_dir(),
    );
    upgrade::pg_upgrade::run(&opts, sink).await
}

/// The request upgrading the primaries on `host`. Segments find the upgraded coordinator
/// and the old tablespaces file in the host's backup directory.
pub fn upgrade_primaries_request(
    config: &Config,
    intermediate: &Cluster,
    action: PgUpgradeAction,
    host: &str,
    primaries: &[&SegConfig],
    state_dir: &Utf8Path,
) -> anyhow::Result<UpgradePrimariesRequest> {
    let backup_dir = config
        .backup_dirs
        .for_host(host)
        .with_context(|| format!("no backup directory for host {host}"))?;
    let tablespaces_file: Utf8PathBuf =
        backup_dirs::tablespaces(backup_dir).join(OLD_TABLESPACES_FILE_NAME);
    let tablespaces_file =
        uses_old_tablespaces_file(config, action).then_some(tablespaces_file.as_path());

    let options = primaries
        .iter()
        .map(|seg| {
            let target = intermediate.counterpart(seg).with_context(|| {
                format!("intermediate cluster has no primary for content {}", seg.content_id)
            })?;
            Ok(pg_options(config, action, seg, target, tablespaces_file, state_dir))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(UpgradePrimariesRequest {
        options,
        post_upgrade_coordinator_backup_dir: backup_dirs::post_upgrade_coordinator(backup_dir)
            .to_string(),
    })
}

pub async fn upgrade_primaries(
    hub: &Hub,
    config: &Config,
    action: PgUpgradeAction,
) -> anyhow::Result<()> {
    let intermediate = config.intermediate()?;
    let by_host = config.source.primaries_by_host();
    let agents = hub.agents_on(&config.source.primary_hosts()).await?;

    for_each_agent(&agents, |conn| {
        let primaries = by_host.get(&conn.hostname).map(Vec::as_slice).unwrap_or_default();
        let request = upgrade_primaries_request(
            config,
            intermediate,
            action,
            &conn.hostname,
            primaries,
            hub.state_dir(),
        );
        async move {
            conn.client()
                .upgrade_primaries(request?)
                .await
                .map_err(rpc_error)?;
            Ok(())
        }
    })
    .await?;
    Ok(())
}
