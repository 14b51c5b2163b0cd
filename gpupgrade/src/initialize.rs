//! `gpupgrade initialize`: records the source cluster, then has the hub prepare the hosts
//! and create the intermediate cluster.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};

use greenplum::{db, utilities, Cluster, Destination, Mode, Version};
use hub::agent_conns::for_each_concurrently;
use hub::intermediate::{self, DEFAULT_TEMP_PORT_RANGE};
use step::{BeginOptions, ConsoleStreams, NextActionError, Phase, Step, StepStore, Substep};
use upgrade::{
    default_disk_free_ratio, BackupDirs, Config, UpgradeId, DEFAULT_AGENT_PORT,
    DEFAULT_DYNAMIC_LIBRARY_PATH, DEFAULT_HUB_PORT,
};
use upgrade_proto::idl::{self, response};
use utils::exec::{self, DevNull};

use crate::hub_client;

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    Copy,
    Link,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Mode {
        match mode {
            ModeArg::Copy => Mode::Copy,
            ModeArg::Link => Mode::Link,
        }
    }
}

#[derive(clap::Args, Debug)]
pub struct InitializeArgs {
    /// File of `key = value` settings for the upgrade, used instead of the flags below
    #[arg(
        long,
        short = 'f',
        conflicts_with_all = [
            "source_gphome", "target_gphome", "source_master_port", "mode",
            "temp_port_range", "parent_backup_dirs", "disk_free_ratio", "hub_port",
            "agent_port", "use_hba_hostnames", "dynamic_library_path",
        ]
    )]
    file: Option<Utf8PathBuf>,
    /// Installation directory of the source cluster's Greenplum
    #[arg(long)]
    source_gphome: Option<Utf8PathBuf>,
    /// Installation directory of the target Greenplum
    #[arg(long)]
    target_gphome: Option<Utf8PathBuf>,
    /// Port of the source cluster's coordinator
    #[arg(long)]
    source_master_port: Option<u16>,
    /// Whether data files are copied or hard linked into the new cluster
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,
    /// Ports for the intermediate cluster, e.g. 50432-65535 or 50432,50433
    #[arg(long)]
    temp_port_range: Option<String>,
    /// Parent directories of the backup directories, as /path or host:/path,host:/path
    #[arg(long = "parent-backup-dir")]
    parent_backup_dirs: Option<String>,
    /// Fraction of each filesystem that must be free
    #[arg(long)]
    disk_free_ratio: Option<f64>,
    #[arg(long)]
    hub_port: Option<u16>,
    #[arg(long)]
    agent_port: Option<u16>,
    /// Use hostnames rather than addresses in pg_hba.conf
    #[arg(long)]
    use_hba_hostnames: bool,
    /// dynamic_library_path for the intermediate cluster
    #[arg(long)]
    dynamic_library_path: Option<String>,
    #[arg(long)]
    non_interactive: bool,
    #[arg(long, short)]
    verbose: bool,
    #[arg(long, requires = "verbose")]
    pg_upgrade_verbose: bool,
    #[arg(long, hide = true)]
    stop_before_cluster_creation: bool,
}

/// What initialize was asked to do, after defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub source_gphome: Utf8PathBuf,
    pub target_gphome: Utf8PathBuf,
    pub source_master_port: u16,
    pub mode: Mode,
    pub temp_port_range: String,
    pub parent_backup_dirs: Option<String>,
    pub disk_free_ratio: f64,
    pub hub_port: u16,
    pub agent_port: u16,
    pub use_hba_hostnames: bool,
    pub dynamic_library_path: String,
}

/// Settings as given, before defaults and validation.
#[derive(Debug, Default)]
struct RawSettings {
    source_gphome: Option<Utf8PathBuf>,
    target_gphome: Option<Utf8PathBuf>,
    source_master_port: Option<u16>,
    mode: Option<Mode>,
    temp_port_range: Option<String>,
    parent_backup_dirs: Option<String>,
    disk_free_ratio: Option<f64>,
    hub_port: Option<u16>,
    agent_port: Option<u16>,
    use_hba_hostnames: bool,
    dynamic_library_path: Option<String>,
}

impl RawSettings {
    fn from_args(args: &InitializeArgs) -> RawSettings {
        RawSettings {
            source_gphome: args.source_gphome.clone(),
            target_gphome: args.target_gphome.clone(),
            source_master_port: args.source_master_port,
            mode: args.mode.map(Mode::from),
            temp_port_range: args.temp_port_range.clone(),
            parent_backup_dirs: args.parent_backup_dirs.clone(),
            disk_free_ratio: args.disk_free_ratio,
            hub_port: args.hub_port,
            agent_port: args.agent_port,
            use_hba_hostnames: args.use_hba_hostnames,
            dynamic_library_path: args.dynamic_library_path.clone(),
        }
    }

    fn from_file(contents: &str) -> anyhow::Result<RawSettings> {
        let values = parse_settings_file(contents)?;
        let mut raw = RawSettings::default();
        for (key, value) in values {
            let invalid = || format!("invalid value {value:?} for {key}");
            match key.as_str() {
                "source_gphome" => raw.source_gphome = Some(value.as_str().into()),
                "target_gphome" => raw.target_gphome = Some(value.as_str().into()),
                "source_master_port" => {
                    raw.source_master_port = Some(value.parse().with_context(invalid)?)
                }
                "mode" => raw.mode = Some(value.parse().with_context(invalid)?),
                "temp_port_range" => raw.temp_port_range = Some(value.clone()),
                "parent_backup_dirs" => raw.parent_backup_dirs = Some(value.clone()),
                "disk_free_ratio" => raw.disk_free_ratio = Some(value.parse().with_context(invalid)?),
                "hub_port" => raw.hub_port = Some(value.parse().with_context(invalid)?),
                "agent_port" => raw.agent_port = Some(value.parse().with_context(invalid)?),
                "use_hba_hostnames" => raw.use_hba_hostnames = value.parse().with_context(invalid)?,
                "dynamic_library_path" => raw.dynamic_library_path = Some(value.clone()),
                other => bail!("unknown setting {other:?}"),
            }
        }
        Ok(raw)
    }

    fn resolve(self) -> anyhow::Result<Settings> {
        let mode = self.mode.unwrap_or_default();
        let disk_free_ratio = self
            .disk_free_ratio
            .unwrap_or_else(|| default_disk_free_ratio(mode));
        if !(0.0..=1.0).contains(&disk_free_ratio) {
            bail!("disk_free_ratio must be between 0.0 and 1.0, got {disk_free_ratio}");
        }

        Ok(Settings {
            source_gphome: self.source_gphome.context("source_gphome is required")?,
            target_gphome: self.target_gphome.context("target_gphome is required")?,
            source_master_port: self
                .source_master_port
                .context("source_master_port is required")?,
            mode,
            temp_port_range: self
                .temp_port_range
                .unwrap_or_else(|| DEFAULT_TEMP_PORT_RANGE.to_string()),
            parent_backup_dirs: self.parent_backup_dirs.filter(|dirs| !dirs.is_empty()),
            disk_free_ratio,
            hub_port: self.hub_port.unwrap_or(DEFAULT_HUB_PORT),
            agent_port: self.agent_port.unwrap_or(DEFAULT_AGENT_PORT),
            use_hba_hostnames: self.use_hba_hostnames,
            dynamic_library_path: self
                .dynamic_library_path
                .unwrap_or_else(|| DEFAULT_DYNAMIC_LIBRARY_PATH.to_string()),
        })
    }
}

/// Parses `key = value` lines. Blank lines and lines starting with `#` are ignored.
fn parse_settings_file(contents: &str) -> anyhow::Result<BTreeMap<String, String>> {
    let mut values = BTreeMap::new();
    for (i, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .with_context(|| format!("line {}: expected key = value, got {line:?}", i + 1))?;
        let key = key.trim().to_string();
        if values
            .insert(key.clone(), value.trim().to_string())
            .is_some()
        {
            bail!("line {}: {key} is set more than once", i + 1);
        }
    }
    Ok(values)
}

impl Settings {
    pub fn from_args(args: &InitializeArgs) -> anyhow::Result<Settings> {
        let raw = match &args.file {
            Some(path) => {
                let contents =
                    std::fs::read_to_string(path).with_context(|| format!("read {path}"))?;
                RawSettings::from_file(&contents).with_context(|| format!("parse {path}"))?
            }
            None => RawSettings::from_args(args),
        };
        raw.resolve()
    }
}

/// Only upgrades to the next major version are supported.
pub fn check_versions(source: Version, target: Version) -> anyhow::Result<()> {
    if target.major != source.major + 1 {
        bail!(
            "upgrading from {source} to {target} is not supported: the target must be the next major version"
        );
    }
    Ok(())
}

/// Builds the upgrade's configuration from the settings and the running source cluster.
async fn source_cluster_config(settings: &Settings) -> anyhow::Result<Config> {
    let source_version = utilities::gp_version(&settings.source_gphome).await?;
    let target_version = utilities::gp_version(&settings.target_gphome).await?;
    check_versions(source_version, target_version)?;

    let intermediate_ports = intermediate::sanitize_ports(&settings.temp_port_range)?;

    let client = db::connect(settings.source_master_port, "template1").await?;
    let segments = db::query_segments(&client, source_version).await?;
    let mut source = Cluster::new(
        Destination::Source,
        settings.source_gphome.clone(),
        source_version,
        segments,
    )?;
    source.tablespaces = db::query_tablespaces(&client, source_version).await?;

    let backup_dirs = match &settings.parent_backup_dirs {
        Some(dirs) => BackupDirs::parse(dirs, &source)
            .map_err(|e| NextActionError::new(e, hub::PARENT_BACKUP_DIRS_HINT))?,
        None => BackupDirs::default_for(&source),
    };

    Ok(Config {
        upgrade_id: UpgradeId::generate(),
        mode: settings.mode,
        backup_dirs,
        source,
        intermediate: None,
        target: None,
        hub_port: settings.hub_port,
        agent_port: settings.agent_port,
        intermediate_ports,
        use_hba_hostnames: settings.use_hba_hostnames,
        disk_free_ratio: settings.disk_free_ratio,
        dynamic_library_path: settings.dynamic_library_path.clone(),
        source_gphome: settings.source_gphome.clone(),
        target_gphome: settings.target_gphome.clone(),
        target_version,
        target_catalog_version: String::new(),
        pg_upgrade_verbose: false,
        log_archive_dir: None,
    })
}

/// Checks over ssh that this gpupgrade executable exists on every other host.
async fn verify_installed(config: &Config) -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("find gpupgrade executable")?;
    let exe = exe.to_string_lossy().into_owned();

    for_each_concurrently(config.source.hosts(), |host| {
        let mut cmd = utils::ssh::command(&host, ["test", "-x", exe.as_str()]);
        let failure = format!("gpupgrade is not installed at {exe} on {host}");
        async move {
            exec::run(&mut cmd, &DevNull).await.context(failure)?;
            Ok(())
        }
    })
    .await?;
    Ok(())
}

fn confirmation_text(settings: &Settings) -> String {
    format!(
        "\nYou are about to initialize a major-version upgrade of Greenplum.\n\
         This should be done only during a downtime window.\n\n\
         gpupgrade initialize will perform a series of checks and create an intermediate\n\
         cluster using {target}. The source cluster will remain running.\n\n\
         Source GPHOME:   {source}\n\
         Target GPHOME:   {target}\n\
         Mode:            {mode}\n\
         Disk free ratio: {ratio:.2}\n",
        source = settings.source_gphome,
        target = settings.target_gphome,
        mode = settings.mode,
        ratio = settings.disk_free_ratio,
    )
}

fn success_text(config: &Config, response: Option<&idl::InitializeResponse>) -> String {
    let mut text = String::from(
        "Initialize completed successfully.\n\n\
         NEXT ACTIONS\n\
         To proceed with the upgrade, run \"gpupgrade execute\"\n\
         followed by \"gpupgrade finalize\".\n\n\
         To return the cluster to its original state, run \"gpupgrade revert\".",
    );
    let mirrored = response.is_some_and(|r| r.has_all_mirrors_and_standby);
    if config.mode == Mode::Link && !mirrored {
        text.push_str(
            "\n\nWARNING: The source cluster does not have a standby and mirrors for every segment.\n\
             After \"gpupgrade execute\" has been run in link mode the source cluster\n\
             can no longer be restored by \"gpupgrade revert\".",
        );
    }
    text
}

pub async fn run(args: InitializeArgs, state_dir: &Utf8Path) -> anyhow::Result<()> {
    let settings = Settings::from_args(&args)?;

    let store = Arc::new(StepStore::new(state_dir));
    let streams = Arc::new(ConsoleStreams::new(args.verbose));
    let mut st = Step::begin(
        Phase::Initialize,
        store,
        streams,
        BeginOptions {
            verbose: args.verbose,
            non_interactive: args.non_interactive,
            confirmation_text: &confirmation_text(&settings),
        },
        std::io::stdin().lock(),
    )?;

    st.run(Substep::SavingSourceClusterConfig, |_| async {
        let mut config = source_cluster_config(&settings).await?;
        config.pg_upgrade_verbose = args.pg_upgrade_verbose;
        config.save(state_dir)?;
        anyhow::Ok(())
    })
    .await;

    // Reruns skip the substep above and pick up what the first run saved.
    let config = match st.err() {
        None => Some(Config::load(state_dir)?),
        Some(_) => None,
    };

    if let Some(config) = &config {
        st.run(Substep::VerifyGpupgradeIsInstalledAcrossAllHosts, |_| {
            verify_installed(config)
        })
        .await;

        st.always_run(Substep::StartHub, |streams| async move {
            hub_client::start_hub(config.hub_port, streams.sink()).await
        })
        .await;
    }

    let mut initialized = None;
    let initialized_ref = &mut initialized;
    let port = config.as_ref().map_or(settings.hub_port, |c| c.hub_port);
    let create_cluster = !args.stop_before_cluster_creation;
    st.run_hub_substep(|streams| async move {
        let mut client = hub_client::connect_or_advise(port).await?;

        let stream = client
            .initialize(idl::InitializeRequest {})
            .await
            .map_err(hub_client::status_error)?
            .into_inner();
        if let response::Contents::InitializeResponse(r) =
            hub_client::consume(stream, streams.as_ref()).await?
        {
            *initialized_ref = Some(r);
        }

        if !create_cluster {
            return Ok(());
        }
        let stream = client
            .initialize_create_cluster(idl::InitializeCreateClusterRequest {})
            .await
            .map_err(hub_client::status_error)?
            .into_inner();
        hub_client::consume(stream, streams.as_ref()).await?;
        Ok(())
    })
    .await;

    let text = match &config {
        Some(config) => success_text(config, initialized.as_ref()),
        None => String::new(),
    };
    st.complete(&text)?;
    Ok(())
}
