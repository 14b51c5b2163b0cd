//! The agent: a small service on every segment host that performs the host-local parts of
//! each phase on the hub's behalf.

use anyhow::Context;
use camino::Utf8PathBuf;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

use upgrade_proto::idl::agent_server::AgentServer;

mod server;

pub use server::AgentService;

/// Printed once the agent accepts requests.
pub const READY_LINE: &str = "gpupgrade agent started";

/// Serves the hub until a signal arrives or the hub asks the agent to stop.
pub async fn serve(port: u16, state_dir: Utf8PathBuf) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("listen on {addr}"))?;

    let shutdown = CancellationToken::new();
    tokio::spawn(utils::daemon::cancel_on_signal(shutdown.clone()));

    info!("agent listening on {addr}, state directory {state_dir}");
    utils::daemon::signal_ready(READY_LINE);

    tonic::transport::Server::builder()
        .add_service(AgentServer::new(AgentService::new(
            state_dir,
            shutdown.clone(),
        )))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.cancelled())
        .await
        .context("serve")?;

    info!("agent stopped");
    Ok(())
}
