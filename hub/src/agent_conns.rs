//! The hub's connections to the agents on the segment hosts, and fan-out of requests
//! over them.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use camino::Utf8Path;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tower::ServiceExt;
use tracing::{info, warn};

use step::NextActionError;
use upgrade_proto::idl::agent_client::AgentClient;
use upgrade_proto::idl::StopAgentRequest;
use utils::exec;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(3);
pub const READY_TIMEOUT: Duration = Duration::from_secs(15);
const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub const KILL_AND_RESTART_SERVICES: &str =
    r#"Please run "gpupgrade kill-services" followed by "gpupgrade restart-services"."#;

/// What the starting agent prints when another agent already holds its port.
const ADDRESS_IN_USE: &str = "address already in use";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectivityState::Idle => "IDLE",
            ConnectivityState::Connecting => "CONNECTING",
            ConnectivityState::Ready => "READY",
            ConnectivityState::TransientFailure => "TRANSIENT_FAILURE",
            ConnectivityState::Shutdown => "SHUTDOWN",
        })
    }
}

/// A connection to the agent on one host.
#[derive(Debug)]
pub struct AgentConn {
    pub hostname: String,
    channel: Channel,
    cancel: CancellationToken,
    state: Mutex<ConnectivityState>,
}

impl AgentConn {
    fn new(hostname: &str, channel: Channel) -> AgentConn {
        AgentConn {
            hostname: hostname.to_string(),
            channel,
            cancel: CancellationToken::new(),
            state: Mutex::new(ConnectivityState::Idle),
        }
    }

    pub fn client(&self) -> AgentClient<Channel> {
        AgentClient::new(self.channel.clone())
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.lock().unwrap()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Closes the connection. Requests in flight over it fail.
    pub fn close(&self) {
        self.cancel.cancel();
        *self.state.lock().unwrap() = ConnectivityState::Shutdown;
    }

    async fn probe(&self) -> ConnectivityState {
        if self.is_closed() {
            return ConnectivityState::Shutdown;
        }
        let mut channel = self.channel.clone();
        let ready = ServiceExt::<tonic::codegen::http::Request<tonic::body::BoxBody>>::ready(
            &mut channel,
        );
        let state = match tokio::time::timeout(READY_POLL_INTERVAL, ready).await {
            Ok(Ok(_)) => ConnectivityState::Ready,
            Ok(Err(_)) => ConnectivityState::TransientFailure,
            Err(_) => ConnectivityState::Connecting,
        };
        *self.state.lock().unwrap() = state;
        state
    }
}

/// Errors from several hosts, in host order. Each is tagged with its host.
#[derive(thiserror::Error, Debug)]
pub struct AggregateError(pub Vec<anyhow::Error>);

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{e:#}")?;
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub struct AgentsNotReadyError {
    pub hosts: Vec<(String, ConnectivityState)>,
}

impl fmt::Display for AgentsNotReadyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timed out waiting for agents to be ready:")?;
        for (host, state) in &self.hosts {
            write!(f, "\n  {host}: {state}")?;
        }
        Ok(())
    }
}

/// Runs `f` on every item concurrently and waits for all of them. Every failure is
/// returned, in the order of the items.
pub async fn for_each_concurrently<T, F, Fut>(
    items: impl IntoIterator<Item = T>,
    f: F,
) -> Result<(), AggregateError>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let results = futures::future::join_all(items.into_iter().map(f)).await;
    let errors: Vec<anyhow::Error> = results.into_iter().filter_map(Result::err).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(AggregateError(errors))
    }
}

/// Runs `f` against every agent concurrently. A connection closed while its request is
/// in flight fails that request.
pub async fn for_each_agent<F, Fut>(conns: &[Arc<AgentConn>], f: F) -> Result<(), AggregateError>
where
    F: Fn(Arc<AgentConn>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    for_each_concurrently(conns.iter().cloned(), |conn| {
        let request = f(Arc::clone(&conn));
        async move {
            tokio::select! {
                result = request => result.with_context(|| format!("host {}", conn.hostname)),
                _ = conn.cancel.cancelled() => {
                    Err(anyhow::anyhow!("host {}: connection to agent closed", conn.hostname))
                }
            }
        }
    })
    .await
}

/// Converts a failed agent request into an error carrying the agent's message.
pub fn rpc_error(status: tonic::Status) -> anyhow::Error {
    match upgrade_proto::next_action(&status) {
        Some(next_action) => {
            NextActionError::new(anyhow::anyhow!("{}", status.message()), next_action).into()
        }
        None => anyhow::anyhow!("{}", status.message()),
    }
}

/// Whether a request failed only because the agent exited while answering it.
pub fn is_agent_already_stopped(status: &tonic::Status) -> bool {
    status.code() == tonic::Code::Unavailable
        && (status.message().contains("transport is closing")
            || status.message().contains("error reading from server: EOF"))
}

async fn dial_one(host: &str, port: u16) -> anyhow::Result<AgentConn> {
    let endpoint = Endpoint::from_shared(format!("http://{host}:{port}"))?
        .connect_timeout(DIAL_TIMEOUT);
    let channel = tokio::time::timeout(DIAL_TIMEOUT, endpoint.connect())
        .await
        .with_context(|| format!("timed out connecting to agent on {host}:{port}"))?
        .with_context(|| format!("connect to agent on {host}:{port}"))?;
    Ok(AgentConn::new(host, channel))
}

/// Dials every host concurrently. Results are in host order.
async fn dial_all(hosts: &[String], port: u16) -> Vec<(String, anyhow::Result<AgentConn>)> {
    let mut tasks = JoinSet::new();
    for (i, host) in hosts.iter().enumerate() {
        let host = host.clone();
        tasks.spawn(async move {
            let conn = dial_one(&host, port).await;
            (i, host, conn)
        });
    }

    let mut results = Vec::with_capacity(hosts.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => warn!("dial task failed: {e}"),
        }
    }
    results.sort_by_key(|(i, _, _)| *i);
    results.into_iter().map(|(_, host, conn)| (host, conn)).collect()
}

pub async fn dial(hosts: &[String], port: u16) -> Result<Vec<Arc<AgentConn>>, AggregateError> {
    let mut conns = Vec::new();
    let mut errors = Vec::new();
    for (_, conn) in dial_all(hosts, port).await {
        match conn {
            Ok(conn) => conns.push(Arc::new(conn)),
            Err(e) => errors.push(e),
        }
    }
    if errors.is_empty() {
        Ok(conns)
    } else {
        Err(AggregateError(errors))
    }
}

/// Polls every connection until all are ready, or until `timeout` has passed.
pub async fn wait_for_ready(
    conns: &[Arc<AgentConn>],
    timeout: Duration,
) -> Result<(), AgentsNotReadyError> {
    let deadline = Instant::now() + timeout;
    loop {
        let states = futures::future::join_all(conns.iter().map(|c| c.probe())).await;
        let not_ready: Vec<(String, ConnectivityState)> = conns
            .iter()
            .zip(states)
            .filter(|(_, state)| *state != ConnectivityState::Ready)
            .map(|(conn, state)| (conn.hostname.clone(), state))
            .collect();

        if not_ready.is_empty() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(AgentsNotReadyError { hosts: not_ready });
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}

/// Starts an agent on every host over ssh, using the same executable path as this
/// process. An agent that is already running is left alone.
pub async fn restart_agents(hosts: &[String], port: u16, state_dir: &Utf8Path) -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("find gpupgrade executable")?;
    let exe = exe.to_string_lossy().into_owned();
    let port = port.to_string();

    for_each_concurrently(hosts, |host| {
        let remote = [
            exe.as_str(),
            "agent",
            utils::daemon::DAEMONIZE_FLAG,
            "--port",
            port.as_str(),
            "--state-directory",
            state_dir.as_str(),
        ];
        let mut cmd = utils::ssh::command(host, remote);
        async move {
            match exec::run(&mut cmd, &exec::DevNull).await {
                Ok(()) => {
                    info!("started agent on {host}");
                    Ok(())
                }
                Err(e) if e.stderr().to_lowercase().contains(ADDRESS_IN_USE) => {
                    info!("agent on {host} is already running");
                    Ok(())
                }
                Err(e) => Err(anyhow::Error::new(e).context(format!("start agent on {host}"))),
            }
        }
    })
    .await?;
    Ok(())
}

/// The agent connections the hub keeps between requests.
pub struct AgentConns {
    port: u16,
    conns: Mutex<Vec<Arc<AgentConn>>>,
}

impl AgentConns {
    pub fn new(port: u16) -> AgentConns {
        AgentConns {
            port,
            conns: Mutex::new(Vec::new()),
        }
    }

    fn existing(&self, hosts: &[String]) -> Vec<Arc<AgentConn>> {
        self.conns
            .lock()
            .unwrap()
            .iter()
            .filter(|c| !c.is_closed() && hosts.contains(&c.hostname))
            .cloned()
            .collect()
    }

    /// Returns ready connections to the agents on `hosts`. Hosts that cannot be dialed
    /// get their agent restarted and are dialed again.
    pub async fn ensure(
        &self,
        hosts: &[String],
        state_dir: &Utf8Path,
    ) -> anyhow::Result<Vec<Arc<AgentConn>>> {
        let mut conns = self.existing(hosts);
        let missing: Vec<String> = hosts
            .iter()
            .filter(|h| !conns.iter().any(|c| &c.hostname == *h))
            .cloned()
            .collect();

        if !missing.is_empty() {
            let dialed = match dial(&missing, self.port).await {
                Ok(dialed) => dialed,
                Err(e) => {
                    info!("restarting agents after failing to reach them: {e}");
                    restart_agents(&missing, self.port, state_dir).await?;
                    dial(&missing, self.port).await?
                }
            };
            conns.extend(dialed);
        }
        conns.sort_by(|a, b| a.hostname.cmp(&b.hostname));

        wait_for_ready(&conns, READY_TIMEOUT)
            .await
            .map_err(|e| NextActionError::new(e, KILL_AND_RESTART_SERVICES))?;

        *self.conns.lock().unwrap() = conns.clone();
        Ok(conns)
    }

    /// Asks every reachable agent on `hosts` to exit. Agents that cannot be reached are
    /// taken to be stopped already.
    pub async fn stop_agents(&self, hosts: &[String]) -> anyhow::Result<()> {
        let mut conns = self.existing(hosts);
        let missing: Vec<String> = hosts
            .iter()
            .filter(|h| !conns.iter().any(|c| &c.hostname == *h))
            .cloned()
            .collect();
        for (host, conn) in dial_all(&missing, self.port).await {
            match conn {
                Ok(conn) => conns.push(Arc::new(conn)),
                Err(e) => info!("not stopping agent on {host}, it is unreachable: {e:#}"),
            }
        }

        let result = for_each_agent(&conns, |conn| async move {
            match conn.client().stop_agent(StopAgentRequest {}).await {
                Ok(_) => Ok(()),
                Err(status) if is_agent_already_stopped(&status) => Ok(()),
                Err(status) => Err(rpc_error(status)),
            }
        })
        .await;

        self.close_all();
        result.map_err(Into::into)
    }

    pub fn close_all(&self) {
        for conn in self.conns.lock().unwrap().drain(..) {
            conn.close();
        }
    }
}
