//! Talking to the hub: starting it, connecting to it, and replaying a phase's stream on
//! the console.

use std::time::Duration;

use anyhow::Context;
use tokio::process::Command;
use tonic::transport::{Channel, Endpoint};
use tonic::Streaming;
use tracing::{info, warn};

use step::{NextActionError, OutStreams, Status, Substep, SubstepError};
use upgrade_proto::idl::cli_to_hub_client::CliToHubClient;
use upgrade_proto::idl::{self, chunk, message, response};
use utils::exec::{self, OutputSink};

const DIAL_TIMEOUT: Duration = Duration::from_secs(3);

pub const RESTART_SERVICES: &str = r#"Please run "gpupgrade restart-services"."#;

pub type HubClient = CliToHubClient<Channel>;

pub async fn connect(port: u16) -> anyhow::Result<HubClient> {
    let endpoint =
        Endpoint::from_shared(format!("http://localhost:{port}"))?.connect_timeout(DIAL_TIMEOUT);
    let channel = endpoint
        .connect()
        .await
        .with_context(|| format!("could not connect to the hub on port {port}"))?;
    Ok(CliToHubClient::new(channel))
}

/// Like [`connect`], but tells the operator how to bring the hub back.
pub async fn connect_or_advise(port: u16) -> anyhow::Result<HubClient> {
    connect(port)
        .await
        .map_err(|e| NextActionError::new(e, RESTART_SERVICES).into())
}

/// Starts the hub in the background. Skipped when a hub already listens on `port`.
pub async fn start_hub(port: u16, sink: &dyn OutputSink) -> Result<(), SubstepError> {
    if connect(port).await.is_ok() {
        info!("hub is already running on port {port}");
        return Err(SubstepError::Skip);
    }

    let exe = std::env::current_exe().context("find gpupgrade executable")?;
    let mut cmd = Command::new(exe);
    cmd.args(["hub", utils::daemon::DAEMONIZE_FLAG]);
    exec::run(&mut cmd, sink).await?;
    Ok(())
}

/// Turns a failed phase's status back into the error the hub reported, next action
/// included.
pub fn status_error(status: tonic::Status) -> anyhow::Error {
    let err = anyhow::anyhow!("{}", status.message());
    match upgrade_proto::next_action(&status) {
        Some(next_action) => NextActionError::new(err, next_action).into(),
        None => err,
    }
}

/// Replays a phase's output and substep statuses onto `streams` until the hub sends the
/// phase's response.
pub async fn consume(
    mut stream: Streaming<idl::Message>,
    streams: &dyn OutStreams,
) -> anyhow::Result<response::Contents> {
    let mut response = None;
    while let Some(msg) = stream.message().await.map_err(status_error)? {
        match msg.contents {
            Some(message::Contents::Chunk(c)) => match c.r#type() {
                chunk::Type::Stdout => streams.stdout(&c.buffer),
                chunk::Type::Stderr => streams.stderr(&c.buffer),
            },
            Some(message::Contents::Status(s)) => {
                match (s.substep.parse::<Substep>(), s.status.parse::<Status>()) {
                    (Ok(substep), Ok(status)) => streams.substep_status(substep, status),
                    _ => warn!("ignoring unknown substep status {}={}", s.substep, s.status),
                }
            }
            Some(message::Contents::Response(r)) => response = r.contents,
            None => {}
        }
    }
    response.context("the hub ended the phase without a response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_action_is_restored_from_the_status() {
        let status = upgrade_proto::status_with_next_action(
            tonic::Code::Unknown,
            "substep \"check_upgrade\": pg_upgrade --check failed".to_string(),
            "Please address the above issue and run \"gpupgrade initialize\" again.",
        );
        let err = status_error(status);
        assert_eq!(
            err.to_string(),
            "substep \"check_upgrade\": pg_upgrade --check failed"
        );
        assert_eq!(
            step::find_next_action(&err).unwrap().next_action,
            "Please address the above issue and run \"gpupgrade initialize\" again."
        );

        let plain = status_error(tonic::Status::internal("no config"));
        assert!(step::find_next_action(&plain).is_none());
    }
}
