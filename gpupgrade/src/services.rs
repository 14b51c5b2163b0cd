//! `config show`, `kill-services` and `restart-services`.

use anyhow::Context;
use camino::Utf8Path;

use upgrade::Config;
use upgrade_proto::idl;
use utils::exec::DevNull;

use crate::hub_client;

#[derive(clap::Args, Debug, Default)]
pub struct ShowArgs {
    #[arg(long)]
    upgrade_id: bool,
    #[arg(long)]
    source_gphome: bool,
    #[arg(long)]
    target_gphome: bool,
    /// Coordinator data directory of the target cluster
    #[arg(long)]
    target_datadir: bool,
    /// Coordinator port of the target cluster
    #[arg(long)]
    target_port: bool,
}

/// The value `args` asks for, or every top-level setting as `key: value` lines.
pub fn format_config(config: &Config, args: &ShowArgs) -> anyhow::Result<String> {
    // Before finalize the intermediate cluster is the target.
    let target = config.target.as_ref().or(config.intermediate.as_ref());
    let target_field = |f: fn(&greenplum::Cluster) -> String| {
        target
            .map(f)
            .context("the target cluster has not been created yet")
    };

    if args.upgrade_id {
        return Ok(config.upgrade_id.to_string());
    }
    if args.source_gphome {
        return Ok(config.source_gphome.to_string());
    }
    if args.target_gphome {
        return Ok(config.target_gphome.to_string());
    }
    if args.target_datadir {
        return target_field(|c| c.coordinator_data_dir().to_string());
    }
    if args.target_port {
        return target_field(|c| c.coordinator_port().to_string());
    }

    let value = serde_json::to_value(config)?;
    let fields = value
        .as_object()
        .context("configuration is not a JSON object")?;
    Ok(fields
        .iter()
        .map(|(key, value)| match value {
            serde_json::Value::String(s) => format!("{key}: {s}"),
            other => format!("{key}: {other}"),
        })
        .collect::<Vec<_>>()
        .join("\n"))
}

pub async fn config_show(args: ShowArgs, state_dir: &Utf8Path) -> anyhow::Result<()> {
    let config = Config::load(state_dir)?;
    let mut client = hub_client::connect_or_advise(config.hub_port).await?;
    let reply = client
        .get_config(idl::GetConfigRequest {})
        .await
        .map_err(hub_client::status_error)?
        .into_inner();
    let config: Config =
        serde_json::from_str(&reply.config_json).context("parse the hub's configuration")?;

    println!("{}", format_config(&config, &args)?);
    Ok(())
}

pub async fn kill_services(state_dir: &Utf8Path) -> anyhow::Result<()> {
    let Ok(config) = Config::load(state_dir) else {
        println!("There is no upgrade in progress, so there are no services to stop.");
        return Ok(());
    };
    let Ok(mut client) = hub_client::connect(config.hub_port).await else {
        println!("The hub is not running.");
        return Ok(());
    };

    match client.stop_services(idl::StopServicesRequest {}).await {
        Ok(_) => {}
        Err(status) if hub::agent_conns::is_agent_already_stopped(&status) => {}
        Err(status) => return Err(hub_client::status_error(status)),
    }
    println!("Stopped the hub and agents.");
    Ok(())
}

pub async fn restart_services(state_dir: &Utf8Path) -> anyhow::Result<()> {
    let config = Config::load(state_dir)?;
    match hub_client::start_hub(config.hub_port, &DevNull).await {
        Ok(()) => println!("Restarted hub."),
        Err(step::SubstepError::Skip) => println!("The hub is already running."),
        Err(step::SubstepError::Failed(e)) => return Err(e.context("start hub")),
        Err(step::SubstepError::Quit) => return Ok(()),
    }

    let mut client = hub_client::connect(config.hub_port).await?;
    let reply = client
        .restart_agents(idl::RestartAgentsRequest {})
        .await
        .map_err(hub_client::status_error)?
        .into_inner();
    println!("Restarted agents on: {}", reply.agent_hosts.join(", "));
    Ok(())
}

#[cfg(test)]
mod tests {
    use greenplum::{Destination, Role, SegConfig, Version};
    use upgrade::{BackupDirs, UpgradeId};

    use super::*;

    fn config() -> Config {
        let seg = |content_id, db_id, host: &str, port, dir: &str| SegConfig {
            db_id,
            content_id,
            role: Role::Primary,
            hostname: host.to_string(),
            port,
            data_dir: dir.into(),
        };
        let source = greenplum::Cluster::new(
            Destination::Source,
            "/usr/local/gpdb6".into(),
            Version::new(6, 26, 0),
            vec![
                seg(-1, 1, "cdw", 5432, "/data/qddir/demoDataDir-1"),
                seg(0, 2, "sdw1", 25432, "/data/dbfast1/demoDataDir0"),
            ],
        )
        .unwrap();
        Config {
            upgrade_id: UpgradeId::from("4zcDKhpMAXc"),
            mode: greenplum::Mode::Copy,
            backup_dirs: BackupDirs::default_for(&source),
            source,
            intermediate: None,
            target: None,
            hub_port: upgrade::DEFAULT_HUB_PORT,
            agent_port: upgrade::DEFAULT_AGENT_PORT,
            intermediate_ports: vec![50432, 50433],
            use_hba_hostnames: false,
            disk_free_ratio: 0.6,
            dynamic_library_path: upgrade::DEFAULT_DYNAMIC_LIBRARY_PATH.to_string(),
            source_gphome: "/usr/local/gpdb6".into(),
            target_gphome: "/usr/local/gpdb7".into(),
            target_version: Version::new(7, 1, 0),
            target_catalog_version: String::new(),
            pg_upgrade_verbose: false,
            log_archive_dir: None,
        }
    }

    #[test]
    fn single_values() {
        let config = config();
        let show = |args: ShowArgs| format_config(&config, &args);

        assert_eq!(
            show(ShowArgs {
                upgrade_id: true,
                ..Default::default()
            })
            .unwrap(),
            "4zcDKhpMAXc"
        );
        assert_eq!(
            show(ShowArgs {
                target_gphome: true,
                ..Default::default()
            })
            .unwrap(),
            "/usr/local/gpdb7"
        );
        let err = show(ShowArgs {
            target_port: true,
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "the target cluster has not been created yet");
    }

    #[test]
    fn target_falls_back_to_the_intermediate_cluster() {
        let mut config = config();
        let mut intermediate = config.source.clone();
        intermediate.destination = Destination::Intermediate;
        intermediate
            .primaries
            .get_mut(&-1)
            .unwrap()
            .port = 50432;
        config.intermediate = Some(intermediate);

        let port = format_config(
            &config,
            &ShowArgs {
                target_port: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(port, "50432");
    }

    #[test]
    fn everything() {
        let all = format_config(&config(), &ShowArgs::default()).unwrap();
        assert!(all.lines().any(|l| l == "upgrade_id: 4zcDKhpMAXc"), "{all}");
        assert!(all.lines().any(|l| l == "hub_port: 7527"), "{all}");
        assert!(all.lines().any(|l| l == "target_gphome: /usr/local/gpdb7"), "{all}");
    }
}
