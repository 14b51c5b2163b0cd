//! `gpupgrade`: the operator's command line, and the entry point of the hub and agent
//! services, which run from the same executable.

use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use step::StepError;
use upgrade::paths;
use utils::logging::{self, LogFormat, Output};

mod data_migration;
mod hub_client;
mod initialize;
mod phases;
mod services;

const LOG_FORMAT_ENV: &str = "GPUPGRADE_LOG_FORMAT";

#[derive(Parser)]
#[command(name = "gpupgrade", version, about = "Upgrades a Greenplum cluster to the next major version", long_about = None)]
#[command(arg_required_else_help(true))]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Prepares the source cluster and creates the intermediate cluster
    Initialize(initialize::InitializeArgs),
    /// Upgrades the coordinator and primaries
    Execute(phases::ExecuteArgs),
    /// Upgrades the standby and mirrors, and makes the upgraded cluster the new source
    Finalize(phases::PhaseArgs),
    /// Returns the cluster to its state before initialize
    Revert(phases::PhaseArgs),
    /// Shows the configuration of the upgrade in progress
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Stops the hub and agents
    KillServices,
    /// Starts the hub and agents after they were stopped
    RestartServices,
    /// Generates the data migration scripts
    Generate(data_migration::GenerateArgs),
    /// Applies the data migration scripts of one phase
    Apply(data_migration::ApplyArgs),
    #[command(hide = true)]
    Hub {
        #[arg(long)]
        daemonize: bool,
    },
    #[command(hide = true)]
    Agent {
        #[arg(long)]
        daemonize: bool,
        #[arg(long, default_value_t = upgrade::DEFAULT_AGENT_PORT)]
        port: u16,
        #[arg(long)]
        state_directory: Option<Utf8PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Show(services::ShowArgs),
}

impl Command {
    fn log_name(&self) -> &'static str {
        match self {
            Command::Hub { .. } => "hub",
            Command::Agent { .. } => "agent",
            _ => "cli",
        }
    }

    fn daemonize(&self) -> bool {
        matches!(
            self,
            Command::Hub { daemonize: true } | Command::Agent { daemonize: true, .. }
        )
    }
}

/// What the operator sees when a command fails.
fn error_report(err: &anyhow::Error) -> String {
    if let Some(e) = step::find_next_action(err) {
        if e.step_error().is_some_and(StepError::is_cancellation) {
            return format!("{e}");
        }
        if e.next_action.is_empty() {
            return format!("Error: {err:#}");
        }
        return format!("Error: {err:#}\n\nNext Action:\n{}", e.next_action);
    }
    match err.downcast_ref::<StepError>() {
        Some(e) if e.is_cancellation() => format!("{e}"),
        Some(e) => match e.next_action() {
            Some(next_action) => format!("Error: {err:#}\n\nNext Action:\n{next_action}"),
            None => format!("Error: {err:#}"),
        },
        None => format!("Error: {err:#}"),
    }
}

async fn run(command: Command) -> anyhow::Result<()> {
    let state_dir = paths::state_dir()?;

    match command {
        Command::Initialize(args) => initialize::run(args, &state_dir).await,
        Command::Execute(args) => phases::execute(args, &state_dir).await,
        Command::Finalize(args) => phases::finalize(args, &state_dir).await,
        Command::Revert(args) => phases::revert(args, &state_dir).await,
        Command::Config {
            command: ConfigCommand::Show(args),
        } => services::config_show(args, &state_dir).await,
        Command::KillServices => services::kill_services(&state_dir).await,
        Command::RestartServices => services::restart_services(&state_dir).await,
        Command::Generate(args) => data_migration::generate(args, &state_dir).await,
        Command::Apply(args) => data_migration::apply(args, &state_dir).await,
        Command::Hub { .. } => {
            logging::replace_panic_hook_with_tracing_panic_hook();
            hub::serve(state_dir).await
        }
        Command::Agent {
            port,
            state_directory,
            ..
        } => {
            logging::replace_panic_hook_with_tracing_panic_hook();
            agent::serve(port, state_directory.unwrap_or(state_dir)).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.command.daemonize() {
        let ready_line = match cli.command {
            Command::Hub { .. } => hub::READY_LINE,
            _ => agent::READY_LINE,
        };
        return match utils::daemon::daemonize(std::env::args_os().collect(), ready_line).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {e:#}");
                ExitCode::FAILURE
            }
        };
    }

    let log_name = cli.command.log_name();
    let log_file = match paths::log_file(log_name) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    let log_format = match std::env::var(LOG_FORMAT_ENV) {
        Ok(format) => LogFormat::from_config(&format),
        Err(_) => Ok(LogFormat::Plain),
    };
    if let Err(e) = log_format.and_then(|format| logging::init(format, Output::File(log_file))) {
        eprintln!("Error: {e:#}");
        return ExitCode::FAILURE;
    }
    info!("starting {log_name}: {:?}", cli.command);

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:?}");
            eprintln!("{}", error_report(&err));
            ExitCode::FAILURE
        }
    }
}
