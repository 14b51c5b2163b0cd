//! The hub: the long-lived service on the coordinator host that runs each phase of an
//! upgrade on behalf of the CLI, driving the agents on the segment hosts.

use std::sync::Arc;

use anyhow::Context;
use camino::Utf8PathBuf;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

use upgrade::Config;
use upgrade_proto::idl::cli_to_hub_server::CliToHubServer;

pub mod agent_conns;
mod active_connections;
mod execute;
mod finalize;
mod init_config;
mod initialize;
pub mod intermediate;
mod pg_upgrade;
pub mod revert;
mod server;
mod streams;

pub use initialize::PARENT_BACKUP_DIRS_HINT;
pub use server::{Hub, HubService};

/// Printed once the hub accepts requests.
pub const READY_LINE: &str = "gpupgrade hub started";

/// Serves the CLI until a signal arrives or the CLI asks the hub to stop.
pub async fn serve(state_dir: Utf8PathBuf) -> anyhow::Result<()> {
    let config = Config::load(&state_dir).context("the hub needs an initialized configuration")?;
    let addr = format!("0.0.0.0:{}", config.hub_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("listen on {addr}"))?;

    let shutdown = CancellationToken::new();
    tokio::spawn(utils::daemon::cancel_on_signal(shutdown.clone()));

    let hub = Arc::new(Hub::new(state_dir, config, shutdown.clone()));
    info!("hub listening on {addr}");
    utils::daemon::signal_ready(READY_LINE);

    tonic::transport::Server::builder()
        .add_service(CliToHubServer::new(HubService::new(Arc::clone(&hub))))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.cancelled())
        .await
        .context("serve")?;

    hub.close_agent_connections();
    info!("hub stopped");
    Ok(())
}
