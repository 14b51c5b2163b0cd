//! `gpupgrade generate` and `gpupgrade apply`: the SQL scripts that move objects the target
//! version cannot upgrade out of the way, and back again afterwards.
//!
//! Every seed script is a query whose result rows are SQL. Generating runs the seeds
//! against each database of the source cluster and saves the rows as one script per
//! database and seed. Applying replays those scripts.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::sync::Arc;

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};
use tokio_postgres::SimpleQueryMessage;
use tracing::info;

use step::{BeginOptions, ConsoleStreams, OutStreams, Phase, Step, StepStore, Substep, SubstepError};
use upgrade::{paths, Config};
use utils::crashsafe;

use hub::agent_conns::for_each_concurrently;

const MIGRATION_STATUS_FILE_NAME: &str = "status.json";

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataMigrationPhase {
    PreInitialize,
    PostFinalize,
    PostRevert,
    Stats,
}

impl DataMigrationPhase {
    pub const ALL: [DataMigrationPhase; 4] = [
        DataMigrationPhase::PreInitialize,
        DataMigrationPhase::PostFinalize,
        DataMigrationPhase::PostRevert,
        DataMigrationPhase::Stats,
    ];

    /// Directory name under both the seed and the output directories.
    pub fn dir_name(self) -> &'static str {
        match self {
            DataMigrationPhase::PreInitialize => "pre-initialize",
            DataMigrationPhase::PostFinalize => "post-finalize",
            DataMigrationPhase::PostRevert => "post-revert",
            DataMigrationPhase::Stats => "stats",
        }
    }
}

#[derive(clap::Args, Debug)]
pub struct GenerateArgs {
    /// Directory holding the seed scripts, one subdirectory per phase
    #[arg(long)]
    seed_dir: Utf8PathBuf,
    /// Where the generated scripts are written
    #[arg(long)]
    output_dir: Option<Utf8PathBuf>,
    /// Source coordinator port. Defaults to the port of the upgrade in progress.
    #[arg(long, env = "PGPORT")]
    port: Option<u16>,
    #[arg(long)]
    non_interactive: bool,
    #[arg(long, short)]
    verbose: bool,
}

#[derive(clap::Args, Debug)]
pub struct ApplyArgs {
    #[arg(long, value_enum)]
    phase: DataMigrationPhase,
    /// Where `gpupgrade generate` wrote the scripts
    #[arg(long)]
    input_dir: Option<Utf8PathBuf>,
    #[arg(long, env = "PGPORT")]
    port: Option<u16>,
    #[arg(long)]
    non_interactive: bool,
    #[arg(long, short)]
    verbose: bool,
}

fn resolve_port(port: Option<u16>, state_dir: &Utf8Path) -> anyhow::Result<u16> {
    if let Some(port) = port {
        return Ok(port);
    }
    let config = Config::load(state_dir)
        .context("no --port given and there is no upgrade in progress to take it from")?;
    Ok(config.source.coordinator_port())
}

fn begin(
    phase: Phase,
    scripts_dir: &Utf8Path,
    verbose: bool,
    non_interactive: bool,
    confirmation_text: &str,
) -> anyhow::Result<Step> {
    crashsafe::create_dir_all(scripts_dir)?;
    let store = Arc::new(StepStore::at(scripts_dir.join(MIGRATION_STATUS_FILE_NAME)));
    let streams = Arc::new(ConsoleStreams::new(verbose));
    let st = Step::begin(
        phase,
        store,
        streams,
        BeginOptions {
            verbose,
            non_interactive,
            confirmation_text,
        },
        std::io::stdin().lock(),
    )?;
    Ok(st)
}

/// The `*.sql` seeds for `phase`, by name. A missing phase directory has no seeds.
pub fn seed_scripts(
    seed_dir: &Utf8Path,
    phase: DataMigrationPhase,
) -> anyhow::Result<BTreeMap<String, Utf8PathBuf>> {
    let dir = seed_dir.join(phase.dir_name());
    let entries = match dir.read_dir_utf8() {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e).with_context(|| format!("read seed directory {dir}")),
    };

    let mut seeds = BTreeMap::new();
    for entry in entries {
        let path = entry?.into_path();
        if path.extension() != Some("sql") {
            continue;
        }
        if let Some(name) = path.file_stem() {
            seeds.insert(name.to_string(), path.clone());
        }
    }
    Ok(seeds)
}

pub fn script_path(
    output_dir: &Utf8Path,
    phase: DataMigrationPhase,
    seed: &str,
    database: &str,
) -> Utf8PathBuf {
    output_dir
        .join(phase.dir_name())
        .join(seed)
        .join(format!("migration_{database}_{seed}.sql"))
}

/// The database a generated script connects to on its first line.
pub fn script_database(contents: &str) -> anyhow::Result<&str> {
    let first = contents.lines().next().unwrap_or_default();
    match first.strip_prefix("\\c ") {
        Some(db) if !db.trim().is_empty() => Ok(db.trim()),
        _ => bail!("expected the script to start with \\c <database>, got {first:?}"),
    }
}

/// The text of every row the seed produced, one row per line.
fn rows_to_script(database: &str, messages: &[SimpleQueryMessage]) -> Option<String> {
    let rows: Vec<&str> = messages
        .iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => row.get(0),
            _ => None,
        })
        .collect();
    if rows.is_empty() {
        return None;
    }
    Some(format!("\\c {database}\n{}\n", rows.join("\n")))
}

async fn generate_for_database(
    port: u16,
    database: &str,
    output_dir: &Utf8Path,
    seeds: &[(DataMigrationPhase, String, Utf8PathBuf)],
) -> anyhow::Result<()> {
    let client = greenplum::db::connect(port, database).await?;
    for (phase, name, path) in seeds {
        let seed = std::fs::read_to_string(path).with_context(|| format!("read seed {path}"))?;
        let messages = client
            .simple_query(&seed)
            .await
            .with_context(|| format!("run seed {path} against {database}"))?;
        let Some(script) = rows_to_script(database, &messages) else {
            continue;
        };
        let out = script_path(output_dir, *phase, name, database);
        if let Some(dir) = out.parent() {
            crashsafe::create_dir_all(dir)?;
        }
        crashsafe::overwrite(&out, script.as_bytes())?;
        info!("wrote {out}");
    }
    Ok(())
}

/// Runs every seed against every database except `template0`, replacing previously
/// generated scripts.
pub async fn generate_scripts(
    seed_dir: &Utf8Path,
    output_dir: &Utf8Path,
    port: u16,
) -> anyhow::Result<()> {
    let mut seeds = Vec::new();
    for phase in DataMigrationPhase::ALL {
        for (name, path) in seed_scripts(seed_dir, phase)? {
            seeds.push((phase, name, path));
        }
        utils::fs_ext::remove_dir_all(&output_dir.join(phase.dir_name()))?;
    }
    if seeds.is_empty() {
        bail!("no seed scripts found in {seed_dir}");
    }

    let client = greenplum::db::connect(port, "postgres").await?;
    let databases = greenplum::db::databases(&client).await?;
    drop(client);

    let seeds = &seeds;
    for_each_concurrently(&databases, |database| async move {
        generate_for_database(port, database, output_dir, seeds)
            .await
            .with_context(|| format!("database {database}"))
    })
    .await?;
    Ok(())
}

/// Generated scripts for `phase`, in seed then database order.
pub fn generated_scripts(
    input_dir: &Utf8Path,
    phase: DataMigrationPhase,
) -> anyhow::Result<Vec<Utf8PathBuf>> {
    let dir = input_dir.join(phase.dir_name());
    let seeds = match dir.read_dir_utf8() {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("read {dir}")),
    };

    let mut scripts = Vec::new();
    for seed in seeds {
        let seed = seed?;
        if !seed.file_type()?.is_dir() {
            continue;
        }
        for script in seed.path().read_dir_utf8()? {
            let path = script?.into_path();
            if path.extension() == Some("sql") {
                scripts.push(path);
            }
        }
    }
    scripts.sort();
    Ok(scripts)
}

/// Asks whether to apply everything. `Ok(false)` means quit.
pub fn prompt_apply_all(streams: &dyn OutStreams, mut input: impl BufRead) -> std::io::Result<bool> {
    loop {
        streams.console("\nApply these scripts? [a]ll / [q]uit: ");
        let mut answer = String::new();
        if input.read_line(&mut answer)? == 0 {
            return Ok(false);
        }
        match answer.trim().to_lowercase().as_str() {
            "a" => return Ok(true),
            "q" => return Ok(false),
            _ => {}
        }
    }
}

async fn apply_to_database(port: u16, database: &str, scripts: &[(Utf8PathBuf, String)]) -> anyhow::Result<()> {
    let client = greenplum::db::connect(port, database).await?;
    for (path, contents) in scripts {
        // The \c line is for psql; the connection already points at the database.
        let body = contents.split_once('\n').map(|(_, rest)| rest).unwrap_or_default();
        client
            .batch_execute(body)
            .await
            .with_context(|| format!("apply {path}"))?;
        info!("applied {path}");
    }
    Ok(())
}

pub async fn apply_scripts(scripts: &[Utf8PathBuf], port: u16) -> anyhow::Result<()> {
    let mut by_database: BTreeMap<String, Vec<(Utf8PathBuf, String)>> = BTreeMap::new();
    for path in scripts {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("read script {path}"))?;
        let database = script_database(&contents)
            .with_context(|| format!("script {path}"))?
            .to_string();
        by_database
            .entry(database)
            .or_default()
            .push((path.clone(), contents));
    }

    for_each_concurrently(&by_database, |(database, scripts)| async move {
        apply_to_database(port, database, scripts)
            .await
            .with_context(|| format!("database {database}"))
    })
    .await?;
    Ok(())
}

pub async fn generate(args: GenerateArgs, state_dir: &Utf8Path) -> anyhow::Result<()> {
    let output_dir = match args.output_dir {
        Some(dir) => dir,
        None => paths::data_migration_dir()?,
    };
    let port = resolve_port(args.port, state_dir)?;
    let confirmation = format!(
        "\nThe data migration scripts will be generated from the seeds in {}\n\
         by querying every database of the cluster on port {port}, and written to\n\
         {output_dir}.\n\
         Previously generated scripts in that directory are replaced.\n",
        args.seed_dir
    );
    let mut st = begin(
        Phase::Generate,
        &output_dir,
        args.verbose,
        args.non_interactive,
        &confirmation,
    )?;

    let seed_dir = &args.seed_dir;
    let out = &output_dir;
    st.always_run(Substep::GenerateDataMigrationScripts, |_| async move {
        generate_scripts(seed_dir, out, port).await
    })
    .await;

    st.complete(&format!(
        "Generated the data migration scripts in {output_dir}.\n\n\
         NEXT ACTIONS\n\
         Review the scripts, then run \"gpupgrade apply --phase pre-initialize\"\n\
         before running \"gpupgrade initialize\"."
    ))?;
    Ok(())
}

pub async fn apply(args: ApplyArgs, state_dir: &Utf8Path) -> anyhow::Result<()> {
    let input_dir = match args.input_dir {
        Some(dir) => dir,
        None => paths::data_migration_dir()?,
    };
    let port = resolve_port(args.port, state_dir)?;
    let phase = args.phase;
    let confirmation = format!(
        "\nThe {} data migration scripts in {input_dir} will be applied to the\n\
         cluster on port {port}.\n",
        phase.dir_name()
    );
    // The prompt listing the scripts replaces the generic one.
    let mut st = begin(Phase::Apply, &input_dir, args.verbose, true, &confirmation)?;

    let non_interactive = args.non_interactive;
    let input = &input_dir;
    st.always_run(Substep::ApplyDataMigrationScripts, |streams| async move {
        let scripts = generated_scripts(input, phase)?;
        if scripts.is_empty() {
            info!("no {} scripts in {input}", phase.dir_name());
            return Err(SubstepError::Skip);
        }

        let listing: String = scripts.iter().map(|s| format!("  {s}\n")).collect();
        streams.console(&format!("\nScripts to apply:\n{listing}"));
        if !non_interactive && !prompt_apply_all(streams.as_ref(), std::io::stdin().lock()).context("read answer")? {
            return Err(SubstepError::Quit);
        }

        apply_scripts(&scripts, port).await?;
        Ok(())
    })
    .await;

    st.complete(&format!(
        "Applied the {} data migration scripts.",
        phase.dir_name()
    ))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use utils::exec::DevNull;

    use super::*;

    #[test]
    fn seeds_are_found_per_phase() {
        let dir = camino_tempfile::tempdir().unwrap();
        let pre = dir.path().join("pre-initialize");
        std::fs::create_dir_all(&pre).unwrap();
        std::fs::write(pre.join("unique_primary_foreign_key_constraint.sql"), "SELECT 1").unwrap();
        std::fs::write(pre.join("gen_alter_name_type_columns.sql"), "SELECT 1").unwrap();
        std::fs::write(pre.join("README"), "not a seed").unwrap();

        let seeds = seed_scripts(dir.path(), DataMigrationPhase::PreInitialize).unwrap();
        assert_eq!(
            seeds.keys().collect::<Vec<_>>(),
            ["gen_alter_name_type_columns", "unique_primary_foreign_key_constraint"]
        );
        assert!(seed_scripts(dir.path(), DataMigrationPhase::Stats)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn scripts_name_their_database() {
        let out = script_path(
            Utf8Path::new("/home/gpadmin/gpupgrade/data-migration-scripts"),
            DataMigrationPhase::PostFinalize,
            "gen_index_recreate",
            "postgres",
        );
        assert_eq!(
            out,
            "/home/gpadmin/gpupgrade/data-migration-scripts/post-finalize/gen_index_recreate/migration_postgres_gen_index_recreate.sql"
        );

        assert_eq!(script_database("\\c regression\nDROP VIEW v;\n").unwrap(), "regression");
        assert!(script_database("DROP VIEW v;\n").is_err());
        assert!(script_database("").is_err());
    }

    #[test]
    fn generated_scripts_are_listed_in_order() {
        let dir = camino_tempfile::tempdir().unwrap();
        for (seed, db) in [("b_seed", "postgres"), ("a_seed", "regression"), ("a_seed", "postgres")] {
            let path = script_path(dir.path(), DataMigrationPhase::PostRevert, seed, db);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, format!("\\c {db}\nSELECT 1;\n")).unwrap();
        }
        std::fs::write(dir.path().join("post-revert").join("stray.txt"), "").unwrap();

        let scripts = generated_scripts(dir.path(), DataMigrationPhase::PostRevert).unwrap();
        let names: Vec<_> = scripts.iter().map(|p| p.file_name().unwrap()).collect();
        assert_eq!(
            names,
            [
                "migration_postgres_a_seed.sql",
                "migration_regression_a_seed.sql",
                "migration_postgres_b_seed.sql"
            ]
        );
        assert!(generated_scripts(dir.path(), DataMigrationPhase::Stats)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn apply_prompt() {
        assert!(prompt_apply_all(&DevNull, Cursor::new("a\n")).unwrap());
        assert!(prompt_apply_all(&DevNull, Cursor::new("x\n\nA\n")).unwrap());
        assert!(!prompt_apply_all(&DevNull, Cursor::new("q\n")).unwrap());
        assert!(!prompt_apply_all(&DevNull, Cursor::new("")).unwrap());
    }

    #[tokio::test]
    async fn scripts_without_a_database_are_rejected_before_connecting() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("migration.sql");
        std::fs::write(&path, "DROP TABLE t;\n").unwrap();

        // Nothing listens on the discard port, so reaching the database would fail differently.
        let err = apply_scripts(&[path.clone()], 9).await.unwrap_err();
        assert_eq!(
            format!("{err:#}"),
            format!("script {path}: expected the script to start with \\c <database>, got \"DROP TABLE t;\"")
        );
    }

    #[test]
    fn port_comes_from_the_upgrade_in_progress() {
        let dir = camino_tempfile::tempdir().unwrap();
        assert_eq!(resolve_port(Some(6000), dir.path()).unwrap(), 6000);
        assert!(resolve_port(None, dir.path()).is_err());
    }
}
