//! Running `pg_upgrade` against one segment.

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::process::Command;
use tracing::info;

use greenplum::{Version, COORDINATOR_CONTENT_ID};
use upgrade_proto::idl::{Mode, PgOptions, PgUpgradeAction};
use utils::exec::{self, OutputSink};

/// Working directory of one pg_upgrade run:
/// `<state dir>/pg_upgrade/<role>/<content>/<timestamp>-<target major>`.
pub fn working_dir(
    state_dir: &Utf8Path,
    role: &str,
    content_id: i32,
    timestamp: &str,
    target_version: Version,
) -> Utf8PathBuf {
    state_dir
        .join("pg_upgrade")
        .join(role)
        .join(content_id.to_string())
        .join(format!("{timestamp}-{}", target_version.major))
}

fn parse_version(version: &str, what: &str) -> anyhow::Result<Version> {
    version
        .parse()
        .with_context(|| format!("invalid {what} version {version:?}"))
}

/// Translates `opts` into pg_upgrade's command line.
pub fn args(opts: &PgOptions, working_dir: &Utf8Path) -> anyhow::Result<Vec<String>> {
    let old_version = parse_version(&opts.old_version, "source")?;
    let new_version = parse_version(&opts.new_version, "target")?;

    let mut args = vec![
        "--old-bindir".to_string(),
        opts.old_bin_dir.clone(),
        "--new-bindir".to_string(),
        opts.new_bin_dir.clone(),
        "--old-datadir".to_string(),
        opts.old_data_dir.clone(),
        "--new-datadir".to_string(),
        opts.new_data_dir.clone(),
        "--old-port".to_string(),
        opts.old_port.to_string(),
        "--new-port".to_string(),
        opts.new_port.to_string(),
    ];

    let segment_mode = if opts.content_id == COORDINATOR_CONTENT_ID {
        "dispatcher"
    } else {
        "segment"
    };
    args.push(format!("--mode={segment_mode}"));

    if opts.jobs > 0 {
        args.push(format!("--jobs={}", opts.jobs));
    }
    if opts.mode() == Mode::Link {
        args.push("--link".to_string());
    }
    if opts.verbose {
        args.push("--verbose".to_string());
    }
    if opts.skip_checks {
        args.push("--skip-checks".to_string());
    }

    let check = opts.action() == PgUpgradeAction::Check;
    if check {
        args.push("--check".to_string());
        args.push("--continue-check-on-fatal".to_string());
    }

    // 5X segments only know their db id from the command line.
    if old_version.major == 5 {
        args.push(format!("--old-options=-x {}", opts.old_db_id));
    }

    if new_version.major < 7 {
        if !check && !opts.old_tablespaces_file.is_empty() {
            args.push(format!("--old-tablespaces-file={}", opts.old_tablespaces_file));
        }
        args.push(format!("--old-gp-dbid={}", opts.old_db_id));
        args.push(format!("--new-gp-dbid={}", opts.new_db_id));
    } else {
        args.push(format!("--output-dir={working_dir}"));
    }

    Ok(args)
}

/// Runs pg_upgrade for one segment in a fresh working directory with an empty
/// environment.
pub async fn run(opts: &PgOptions, sink: &dyn OutputSink) -> anyhow::Result<()> {
    let timestamp = chrono::Local::now().format("%Y%m%dT%H%M%S").to_string();
    let dir = working_dir(
        Utf8Path::new(&opts.state_dir),
        &opts.role,
        opts.content_id,
        &timestamp,
        parse_version(&opts.new_version, "target")?,
    );
    create_working_dir(&dir)?;

    let args = args(opts, &dir)?;
    let pg_upgrade = Utf8Path::new(&opts.new_bin_dir).join("pg_upgrade");
    info!(
        "running pg_upgrade {} for content {} in {dir}",
        opts.action().as_str_name(),
        opts.content_id
    );

    let mut cmd = Command::new(pg_upgrade.as_str());
    cmd.args(&args).current_dir(&dir).env_clear();
    exec::run(&mut cmd, sink)
        .await
        .with_context(|| format!("{} pg_upgrade on content {}", action_verb(opts), opts.content_id))
}

fn action_verb(opts: &PgOptions) -> &'static str {
    match opts.action() {
        PgUpgradeAction::Check => "check",
        PgUpgradeAction::Upgrade => "upgrade",
    }
}

fn create_working_dir(dir: &Utf8Path) -> anyhow::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .with_context(|| format!("create pg_upgrade working directory {dir}"))
}
