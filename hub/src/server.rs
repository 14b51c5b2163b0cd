use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Request, Response, Status};
use tracing::{info, info_span, warn, Instrument};

use greenplum::Cluster;
use step::{OutStreams, Phase, StepError, StepStore};
use upgrade::Config;
use upgrade_proto::idl::cli_to_hub_server::CliToHub;
use upgrade_proto::idl::{self, response};

use crate::agent_conns::{AgentConn, AgentConns};
use crate::streams::MessageStreams;
use crate::{execute, finalize, initialize, revert};

/// State shared by every request the hub serves.
pub struct Hub {
    state_dir: Utf8PathBuf,
    config: Mutex<Config>,
    agents: AgentConns,
    shutdown: CancellationToken,
}

impl Hub {
    pub fn new(state_dir: Utf8PathBuf, config: Config, shutdown: CancellationToken) -> Hub {
        Hub {
            state_dir,
            agents: AgentConns::new(config.agent_port),
            config: Mutex::new(config),
            shutdown,
        }
    }

    pub fn state_dir(&self) -> &Utf8Path {
        &self.state_dir
    }

    /// A snapshot of the configuration.
    pub fn config(&self) -> Config {
        self.config.lock().unwrap().clone()
    }

    /// Applies `f` to the configuration and persists the result. The in-memory copy only
    /// changes once the file is written.
    pub fn update_config(&self, f: impl FnOnce(&mut Config)) -> anyhow::Result<()> {
        let mut config = self.config.lock().unwrap();
        let mut updated = config.clone();
        f(&mut updated);
        updated.save(&self.state_dir)?;
        *config = updated;
        Ok(())
    }

    /// Picks up changes the CLI made to config.json, e.g. an execute override.
    fn reload_config(&self) -> anyhow::Result<()> {
        let config = Config::load(&self.state_dir)?;
        *self.config.lock().unwrap() = config;
        Ok(())
    }

    pub fn store(&self) -> Arc<StepStore> {
        Arc::new(StepStore::new(&self.state_dir))
    }

    /// Ready connections to the agents on every segment host.
    pub async fn agents(&self) -> anyhow::Result<Vec<Arc<AgentConn>>> {
        let hosts = self.config().source.hosts();
        self.agents.ensure(&hosts, &self.state_dir).await
    }

    /// Ready connections to the agents on `hosts` only.
    pub async fn agents_on(&self, hosts: &[String]) -> anyhow::Result<Vec<Arc<AgentConn>>> {
        let all = self.agents().await?;
        Ok(all
            .into_iter()
            .filter(|conn| hosts.contains(&conn.hostname))
            .collect())
    }

    pub async fn restart_agents(&self) -> anyhow::Result<Vec<String>> {
        let config = self.config();
        let hosts = config.source.hosts();
        crate::agent_conns::restart_agents(&hosts, config.agent_port, &self.state_dir).await?;
        Ok(hosts)
    }

    pub async fn stop_agents(&self) -> anyhow::Result<()> {
        let hosts = self.config().source.hosts();
        self.agents.stop_agents(&hosts).await
    }

    pub fn close_agent_connections(&self) {
        self.agents.close_all();
    }
}

type MessageStream = Pin<Box<dyn Stream<Item = Result<idl::Message, Status>> + Send + 'static>>;

/// The hub's gRPC face.
#[derive(Clone)]
pub struct HubService {
    hub: Arc<Hub>,
}

impl HubService {
    pub fn new(hub: Arc<Hub>) -> HubService {
        HubService { hub }
    }

    /// Runs a phase in the background, streaming its progress. The stream ends with the
    /// phase's response, or with an error status carrying the next action.
    fn run_phase<F, Fut>(&self, phase: Phase, f: F) -> Response<MessageStream>
    where
        F: FnOnce(Arc<Hub>, Arc<dyn OutStreams>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<response::Contents, StepError>> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let streams = Arc::new(MessageStreams::new(tx));
        let hub = Arc::clone(&self.hub);

        tokio::spawn(
            async move {
                if let Err(e) = hub.reload_config() {
                    warn!("{e:#}");
                    streams.fail(Status::internal(format!("{e:#}")));
                    return;
                }
                match f(hub, Arc::clone(&streams) as Arc<dyn OutStreams>).await {
                    Ok(response) => {
                        info!("{phase} succeeded");
                        streams.respond(response);
                    }
                    Err(err) => {
                        warn!("{phase} failed: {err}");
                        let next_action = err.next_action().unwrap_or_default().to_string();
                        streams.fail(upgrade_proto::status_with_next_action(
                            Code::Unknown,
                            err.to_string(),
                            &next_action,
                        ));
                    }
                }
            }
            .instrument(info_span!("phase", %phase)),
        );

        Response::new(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

/// How the CLI reaches `cluster`.
pub(crate) fn cluster_info(cluster: &Cluster) -> idl::ClusterInfo {
    idl::ClusterInfo {
        port: cluster.coordinator_port().into(),
        coordinator_data_directory: cluster.coordinator_data_dir().to_string(),
        version: cluster.version.to_string(),
    }
}

fn internal(e: anyhow::Error) -> Status {
    Status::internal(format!("{e:#}"))
}

#[tonic::async_trait]
impl CliToHub for HubService {
    type InitializeStream = MessageStream;
    type InitializeCreateClusterStream = MessageStream;
    type ExecuteStream = MessageStream;
    type FinalizeStream = MessageStream;
    type RevertStream = MessageStream;

    async fn initialize(
        &self,
        _request: Request<idl::InitializeRequest>,
    ) -> Result<Response<Self::InitializeStream>, Status> {
        Ok(self.run_phase(Phase::Initialize, |hub, streams| async move {
            initialize::initialize(&hub, streams).await
        }))
    }

    async fn initialize_create_cluster(
        &self,
        _request: Request<idl::InitializeCreateClusterRequest>,
    ) -> Result<Response<Self::InitializeCreateClusterStream>, Status> {
        Ok(self.run_phase(Phase::Initialize, |hub, streams| async move {
            initialize::create_cluster(&hub, streams).await
        }))
    }

    async fn execute(
        &self,
        request: Request<idl::ExecuteRequest>,
    ) -> Result<Response<Self::ExecuteStream>, Status> {
        let request = request.into_inner();
        Ok(self.run_phase(Phase::Execute, |hub, streams| async move {
            execute::execute(&hub, streams, request).await
        }))
    }

    async fn finalize(
        &self,
        _request: Request<idl::FinalizeRequest>,
    ) -> Result<Response<Self::FinalizeStream>, Status> {
        Ok(self.run_phase(Phase::Finalize, |hub, streams| async move {
            finalize::finalize(&hub, streams).await
        }))
    }

    async fn revert(
        &self,
        _request: Request<idl::RevertRequest>,
    ) -> Result<Response<Self::RevertStream>, Status> {
        Ok(self.run_phase(Phase::Revert, |hub, streams| async move {
            revert::revert(&hub, streams).await
        }))
    }

    async fn get_config(
        &self,
        _request: Request<idl::GetConfigRequest>,
    ) -> Result<Response<idl::GetConfigReply>, Status> {
        let config_json = serde_json::to_string(&self.hub.config())
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(idl::GetConfigReply { config_json }))
    }

    async fn restart_agents(
        &self,
        _request: Request<idl::RestartAgentsRequest>,
    ) -> Result<Response<idl::RestartAgentsReply>, Status> {
        let agent_hosts = self.hub.restart_agents().await.map_err(internal)?;
        Ok(Response::new(idl::RestartAgentsReply { agent_hosts }))
    }

    async fn stop_services(
        &self,
        _request: Request<idl::StopServicesRequest>,
    ) -> Result<Response<idl::StopServicesReply>, Status> {
        let stopped = self.hub.stop_agents().await;
        // The server finishes answering this request before it exits.
        self.hub.shutdown.cancel();
        stopped.map_err(internal)?;
        Ok(Response::new(idl::StopServicesReply {}))
    }
}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt;

    use super::*;
    use crate::tests::example_config;

    #[tokio::test]
    async fn config_updates_are_persisted() {
        let dir = camino_tempfile::tempdir().unwrap();
        let config = example_config();
        config.save(dir.path()).unwrap();
        let hub = Hub::new(dir.path().to_owned(), config, CancellationToken::new());

        hub.update_config(|c| c.target_catalog_version = "301908232".to_string())
            .unwrap();
        assert_eq!(hub.config().target_catalog_version, "301908232");
        assert_eq!(
            Config::load(dir.path()).unwrap().target_catalog_version,
            "301908232"
        );
    }

    #[tokio::test]
    async fn failed_phase_ends_the_stream_with_its_next_action() {
        let dir = camino_tempfile::tempdir().unwrap();
        let config = example_config();
        config.save(dir.path()).unwrap();
        let service = HubService::new(Arc::new(Hub::new(
            dir.path().to_owned(),
            config,
            CancellationToken::new(),
        )));

        let response = service.run_phase(Phase::Execute, |_hub, streams| async move {
            streams.stdout(b"working\n");
            Err(StepError::OutOfOrder {
                next_action: "Please run \"gpupgrade initialize\".".to_string(),
            })
        });
        let messages: Vec<_> = response.into_inner().collect().await;

        assert_eq!(messages.len(), 2);
        assert!(matches!(
            messages[0].as_ref().unwrap().contents,
            Some(idl::message::Contents::Chunk(_))
        ));
        let status = messages[1].as_ref().unwrap_err();
        assert_eq!(status.message(), "gpupgrade commands must be run in order");
        assert_eq!(
            upgrade_proto::next_action(status).as_deref(),
            Some("Please run \"gpupgrade initialize\".")
        );
    }

    #[tokio::test]
    async fn missing_config_fails_the_phase() {
        let dir = camino_tempfile::tempdir().unwrap();
        let service = HubService::new(Arc::new(Hub::new(
            dir.path().to_owned(),
            example_config(),
            CancellationToken::new(),
        )));

        let response = service.run_phase(Phase::Finalize, |_hub, _streams| async move {
            Ok(response::Contents::FinalizeResponse(Default::default()))
        });
        let messages: Vec<_> = response.into_inner().collect().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].as_ref().unwrap_err().code(), Code::Internal);
    }
}
