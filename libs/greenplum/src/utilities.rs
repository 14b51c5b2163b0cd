//! Wrappers around the cluster management utilities shipped with each installation.
//!
//! Every utility runs through `bash -c "source <gphome>/greenplum_path.sh && ..."` with a
//! cleared environment, so the two installations involved in an upgrade never see each
//! other's `PATH` or `LD_LIBRARY_PATH`.

use camino::Utf8Path;
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;
use tracing::info;

use utils::exec::{self, shell_quote, ExecError, OutputSink};

use crate::{Cluster, Version};

/// Variables passed through to the utilities from our own environment.
const PASSTHROUGH_ENV: &[&str] = &["HOME", "USER", "LOGNAME", "PATH", "SHELL", "PGUSER"];

/// `gpinitsystem` exits with 1 when it finished with warnings.
const GPINITSYSTEM_WARNINGS_EXIT_CODE: i32 = 1;

/// Builds a command running `utility args...` in the environment of `gphome`.
pub fn greenplum_command(
    gphome: &Utf8Path,
    coordinator_data_dir: Option<&Utf8Path>,
    utility: &str,
    args: &[&str],
) -> Command {
    let script = format!(
        "source {} && {} {}",
        shell_quote(gphome.join("greenplum_path.sh").as_str()),
        shell_quote(gphome.join("bin").join(utility).as_str()),
        args.iter().map(|a| shell_quote(a)).join(" "),
    );

    let mut cmd = Command::new("bash");
    cmd.arg("-c").arg(script).env_clear();
    for var in PASSTHROUGH_ENV {
        if let Ok(value) = std::env::var(var) {
            cmd.env(var, value);
        }
    }
    if let Some(dir) = coordinator_data_dir {
        cmd.env("MASTER_DATA_DIRECTORY", dir.as_str())
            .env("COORDINATOR_DATA_DIRECTORY", dir.as_str());
    }
    cmd
}

fn cluster_command(cluster: &Cluster, utility: &str, args: &[&str]) -> Command {
    greenplum_command(
        &cluster.gphome,
        Some(cluster.coordinator_data_dir()),
        utility,
        args,
    )
}

pub async fn start(cluster: &Cluster, sink: &dyn OutputSink) -> Result<(), ExecError> {
    info!("starting {} cluster", cluster.destination);
    let dir = cluster.coordinator_data_dir().as_str();
    exec::run(&mut cluster_command(cluster, "gpstart", &["-a", "-d", dir]), sink).await
}

pub async fn start_coordinator_only(
    cluster: &Cluster,
    sink: &dyn OutputSink,
) -> Result<(), ExecError> {
    let dir = cluster.coordinator_data_dir().as_str();
    exec::run(
        &mut cluster_command(cluster, "gpstart", &["-m", "-a", "-d", dir]),
        sink,
    )
    .await
}

pub async fn stop(cluster: &Cluster, sink: &dyn OutputSink) -> Result<(), ExecError> {
    info!("stopping {} cluster", cluster.destination);
    let dir = cluster.coordinator_data_dir().as_str();
    exec::run(&mut cluster_command(cluster, "gpstop", &["-a", "-d", dir]), sink).await
}

pub async fn stop_coordinator_only(
    cluster: &Cluster,
    sink: &dyn OutputSink,
) -> Result<(), ExecError> {
    let dir = cluster.coordinator_data_dir().as_str();
    exec::run(
        &mut cluster_command(cluster, "gpstop", &["-m", "-a", "-d", dir]),
        sink,
    )
    .await
}

/// Whether the coordinator postmaster of `cluster` is running, according to `pg_ctl status`.
pub async fn is_coordinator_running(cluster: &Cluster) -> anyhow::Result<bool> {
    // pg_ctl status exits 3 when the server is not running and 4 without a data directory.
    let dir = cluster.coordinator_data_dir().as_str();
    match exec::run(
        &mut cluster_command(cluster, "pg_ctl", &["status", "-D", dir]),
        &exec::DevNull,
    )
    .await
    {
        Ok(()) => Ok(true),
        Err(e) if matches!(e.exit_code(), Some(3) | Some(4)) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Stops `cluster` if its coordinator is up.
pub async fn stop_if_running(cluster: &Cluster, sink: &dyn OutputSink) -> anyhow::Result<()> {
    if is_coordinator_running(cluster).await? {
        stop(cluster, sink).await?;
    } else {
        info!("{} cluster is already stopped", cluster.destination);
    }
    Ok(())
}

/// Runs `gpinitsystem -a -I <config_file>`. Completion with warnings counts as success.
pub async fn init_system(
    gphome: &Utf8Path,
    config_file: &Utf8Path,
    sink: &dyn OutputSink,
) -> Result<(), ExecError> {
    let mut cmd = greenplum_command(gphome, None, "gpinitsystem", &["-a", "-I", config_file.as_str()]);
    match exec::run(&mut cmd, sink).await {
        Err(e) if e.exit_code() == Some(GPINITSYSTEM_WARNINGS_EXIT_CODE) => {
            info!("gpinitsystem completed with warnings");
            Ok(())
        }
        other => other,
    }
}

/// Runs `gpaddmirrors` with a mirror configuration file of
/// `<content>|<address>|<port>|<data dir>` lines.
pub async fn add_mirrors(
    cluster: &Cluster,
    mirror_config_file: &Utf8Path,
    use_hba_hostnames: bool,
    sink: &dyn OutputSink,
) -> Result<(), ExecError> {
    let mut args = vec!["-a", "-i", mirror_config_file.as_str()];
    if use_hba_hostnames {
        args.push("--hba-hostnames");
    }
    exec::run(&mut cluster_command(cluster, "gpaddmirrors", &args), sink).await
}

pub async fn init_standby(
    cluster: &Cluster,
    host: &str,
    port: u16,
    data_dir: &Utf8Path,
    use_hba_hostnames: bool,
    sink: &dyn OutputSink,
) -> Result<(), ExecError> {
    let port = port.to_string();
    let mut args = vec!["-a", "-s", host, "-P", port.as_str(), "-S", data_dir.as_str()];
    if use_hba_hostnames {
        args.push("--hba-hostnames");
    }
    exec::run(&mut cluster_command(cluster, "gpinitstandby", &args), sink).await
}

/// Recovers failed mirrors in place.
pub async fn recoverseg(cluster: &Cluster, sink: &dyn OutputSink) -> Result<(), ExecError> {
    exec::run(&mut cluster_command(cluster, "gprecoverseg", &["-a"]), sink).await
}

/// Sets a configuration parameter on every segment with `gpconfig`.
pub async fn set_guc(
    cluster: &Cluster,
    name: &str,
    value: &str,
    sink: &dyn OutputSink,
) -> Result<(), ExecError> {
    exec::run(
        &mut cluster_command(cluster, "gpconfig", &["-c", name, "-v", value]),
        sink,
    )
    .await
}

/// Parses the `Catalog version number:` line of `pg_controldata` output.
pub fn parse_catalog_version(controldata: &str) -> anyhow::Result<String> {
    static CATVER_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?m)^Catalog version number:\s+(\d+)\s*$").unwrap());

    CATVER_RE
        .captures(controldata)
        .map(|c| c[1].to_string())
        .ok_or_else(|| anyhow::anyhow!("catalog version not found in pg_controldata output"))
}

pub async fn catalog_version(gphome: &Utf8Path, data_dir: &Utf8Path) -> anyhow::Result<String> {
    let output = exec::run_with_output(
        &mut greenplum_command(gphome, None, "pg_controldata", &[data_dir.as_str()]),
        &exec::DevNull,
    )
    .await?;
    parse_catalog_version(&output)
}

/// Reports the version of the installation at `gphome` from `postgres --gp-version`.
pub async fn gp_version(gphome: &Utf8Path) -> anyhow::Result<Version> {
    let postgres = gphome.join("bin").join("postgres");
    let mut cmd = Command::new(postgres.as_str());
    cmd.arg("--gp-version").env_clear();
    let output = exec::run_with_output(&mut cmd, &exec::DevNull).await?;
    Version::from_gp_version_output(&output)
}

/// Arguments for starting a coordinator in single-user utility mode with catalog
/// modifications allowed.
pub fn single_user_args(data_dir: &Utf8Path, version: Version) -> Vec<String> {
    let role_guc = if version.major >= 7 {
        "gp_role=utility"
    } else {
        "gp_session_role=utility"
    };
    vec![
        "--single".to_string(),
        "-D".to_string(),
        data_dir.to_string(),
        "-O".to_string(),
        "-c".to_string(),
        role_guc.to_string(),
        "-c".to_string(),
        "allow_system_table_mods=true".to_string(),
        "-c".to_string(),
        "exit_on_error=true".to_string(),
        "postgres".to_string(),
    ]
}

/// Feeds `sql` to `postgres --single` running against `data_dir`.
pub async fn run_single_user(
    gphome: &Utf8Path,
    version: Version,
    data_dir: &Utf8Path,
    sql: &str,
    sink: &dyn OutputSink,
) -> Result<String, ExecError> {
    let args = single_user_args(data_dir, version);
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let mut cmd = greenplum_command(gphome, None, "postgres", &args);
    exec::run_with_input(&mut cmd, sql.as_bytes(), sink).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sources_greenplum_path_with_clean_environment() {
        let cmd = greenplum_command(
            Utf8Path::new("/usr/local/greenplum-db-6"),
            Some(Utf8Path::new("/data/qddir/demoDataDir-1")),
            "gpstart",
            &["-a", "-d", "/data/qddir/demoDataDir-1"],
        );
        let std = cmd.as_std();
        assert_eq!(std.get_program(), "bash");

        let args: Vec<_> = std.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec![
                "-c",
                "source /usr/local/greenplum-db-6/greenplum_path.sh && /usr/local/greenplum-db-6/bin/gpstart -a -d /data/qddir/demoDataDir-1"
            ]
        );

        let envs: Vec<_> = std
            .get_envs()
            .filter_map(|(k, v)| Some((k.to_string_lossy().into_owned(), v?.to_string_lossy().into_owned())))
            .collect();
        assert!(envs.contains(&(
            "MASTER_DATA_DIRECTORY".to_string(),
            "/data/qddir/demoDataDir-1".to_string()
        )));
        assert!(envs.contains(&(
            "COORDINATOR_DATA_DIRECTORY".to_string(),
            "/data/qddir/demoDataDir-1".to_string()
        )));
    }

    #[test]
    fn parses_catalog_version() {
        let out = "pg_control version number:            9420600\n\
                   Catalog version number:               301908232\n\
                   Database system identifier:           7049382961675851017\n";
        assert_eq!(parse_catalog_version(out).unwrap(), "301908232");
        assert!(parse_catalog_version("nothing here").is_err());
    }

    #[test]
    fn single_user_mode_guc_depends_on_version() {
        let six = single_user_args(Utf8Path::new("/data/qd"), Version::new(6, 20, 0));
        assert!(six.contains(&"gp_session_role=utility".to_string()));
        let seven = single_user_args(Utf8Path::new("/data/qd"), Version::new(7, 0, 0));
        assert!(seven.contains(&"gp_role=utility".to_string()));
        assert_eq!(seven.last().map(String::as_str), Some("postgres"));
    }
}
