use std::io;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Request, Response, Status};
use tracing::{info, warn};

use upgrade::data_dirs::{self, LineRewrite};
use upgrade::{archive, backup_dirs, disk, environment, paths, pg_upgrade, rename, wire};
use upgrade_proto::idl::agent_server::Agent;
use upgrade_proto::idl::{self, PgUpgradeAction};
use utils::exec::BufferedOutput;
use utils::{crashsafe, fs_ext, rsync};

/// The agent's gRPC face. Requests are independent of each other: everything an
/// operation needs arrives with it.
pub struct AgentService {
    state_dir: Utf8PathBuf,
    shutdown: CancellationToken,
}

impl AgentService {
    pub fn new(state_dir: Utf8PathBuf, shutdown: CancellationToken) -> AgentService {
        AgentService {
            state_dir,
            shutdown,
        }
    }
}

fn to_status(err: anyhow::Error) -> Status {
    to_status_all(vec![err])
}

/// One status for several failures, carrying the first next action any of them has.
fn to_status_all(errors: Vec<anyhow::Error>) -> Status {
    for err in &errors {
        warn!("{err:#}");
    }
    let message = errors
        .iter()
        .map(|e| format!("{e:#}"))
        .collect::<Vec<_>>()
        .join("\n");
    let next_action = errors
        .iter()
        .find_map(step::find_next_action)
        .map(|e| e.next_action.clone())
        .unwrap_or_default();
    upgrade_proto::status_with_next_action(Code::Unknown, message, &next_action)
}

/// Runs filesystem work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, Status>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Status::internal(format!("blocking task failed: {e}")))?
        .map_err(to_status)
}

/// Upgrades one primary. For an upgrade proper, the data directory first receives the
/// coordinator the hub upgraded and copied to this host.
async fn upgrade_primary(opts: &idl::PgOptions, post_upgrade_coordinator: &Utf8Path) -> anyhow::Result<()> {
    let output = BufferedOutput::new();
    let result = async {
        if opts.action() == PgUpgradeAction::Upgrade {
            data_dirs::restore_upgraded_coordinator(
                post_upgrade_coordinator,
                Utf8Path::new(&opts.new_data_dir),
                &output,
            )
            .await?;
        }
        pg_upgrade::run(opts, &output).await
    }
    .await;

    let stdout = output.stdout_string();
    if !stdout.is_empty() {
        info!(content_id = opts.content_id, "{}", stdout.trim_end());
    }
    result.with_context(|| format!("upgrade primary with content {}", opts.content_id))
}

/// Runs one rsync, logging its output whether or not it succeeded. Returns that output.
async fn copy(opts: &rsync::Options) -> anyhow::Result<String> {
    let output = BufferedOutput::new();
    let result = rsync::rsync(opts, &output).await;

    let stdout = output.stdout_string();
    if !stdout.is_empty() {
        info!(destination = %opts.destination, "{}", stdout.trim_end());
    }
    let stderr = output.stderr_string();
    if !stderr.is_empty() {
        warn!(destination = %opts.destination, "{}", stderr.trim_end());
    }
    result?;
    Ok(stdout)
}

/// Points `path` at `target`, replacing whatever file or link is there. A real directory
/// at `path` is never removed.
fn replace_symlink(path: &Utf8Path, target: &Utf8Path) -> anyhow::Result<()> {
    match path.symlink_metadata() {
        Ok(meta) if meta.is_dir() => anyhow::bail!("{path} is a directory, not a symlink"),
        Ok(_) => std::fs::remove_file(path).with_context(|| format!("remove {path}"))?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("stat {path}")),
    }
    if let Some(parent) = path.parent() {
        crashsafe::create_dir_all(parent)?;
    }
    std::os::unix::fs::symlink(target, path)
        .with_context(|| format!("link {path} to {target}"))?;
    Ok(())
}

/// Applies an [`idl::UpdateConfigurationRequest`]: rewrites first, in the order given for
/// each file, then whole files, then symlinks.
pub(crate) fn update_configuration(req: &idl::UpdateConfigurationRequest) -> anyhow::Result<()> {
    let mut by_path: Vec<(Utf8PathBuf, Vec<LineRewrite>)> = Vec::new();
    for r in &req.rewrites {
        let rewrite = LineRewrite::new(&r.pattern, r.replacement.as_str())?;
        let path = Utf8PathBuf::from(&r.path);
        match by_path.iter_mut().find(|(p, _)| *p == path) {
            Some((_, rewrites)) => rewrites.push(rewrite),
            None => by_path.push((path, vec![rewrite])),
        }
    }
    for (path, rewrites) in &by_path {
        data_dirs::rewrite_file(path, rewrites)?;
    }

    for file in &req.files {
        let path = Utf8Path::new(&file.path);
        info!("writing {path}");
        crashsafe::overwrite(path, file.contents.as_bytes())
            .with_context(|| format!("write {path}"))?;
    }

    for link in &req.symlinks {
        replace_symlink(Utf8Path::new(&link.path), Utf8Path::new(&link.target))?;
    }
    Ok(())
}

#[tonic::async_trait]
impl Agent for AgentService {
    async fn check_environment(
        &self,
        request: Request<idl::CheckEnvironmentRequest>,
    ) -> Result<Response<idl::CheckEnvironmentReply>, Status> {
        let errors: Vec<anyhow::Error> = request
            .into_inner()
            .gphomes
            .iter()
            .filter_map(|gphome| environment::check_gphome(Utf8Path::new(gphome)).err())
            .map(anyhow::Error::new)
            .collect();
        if !errors.is_empty() {
            return Err(to_status_all(errors));
        }
        Ok(Response::new(idl::CheckEnvironmentReply {}))
    }

    async fn create_backup_directory(
        &self,
        request: Request<idl::CreateBackupDirectoryRequest>,
    ) -> Result<Response<idl::CreateBackupDirectoryReply>, Status> {
        let dir = Utf8PathBuf::from(request.into_inner().backup_dir);
        info!("creating backup directory {dir}");
        backup_dirs::create_backup_directory(&dir)
            .with_context(|| format!("create backup directory {dir}"))
            .map_err(to_status)?;
        Ok(Response::new(idl::CreateBackupDirectoryReply {}))
    }

    async fn delete_backup_directory(
        &self,
        request: Request<idl::DeleteBackupDirectoryRequest>,
    ) -> Result<Response<idl::DeleteBackupDirectoryReply>, Status> {
        let dir = Utf8PathBuf::from(request.into_inner().backup_dir);
        blocking(move || {
            info!("deleting backup directory {dir}");
            backup_dirs::delete_backup_directory(&dir)
                .with_context(|| format!("delete backup directory {dir}"))
        })
        .await?;
        Ok(Response::new(idl::DeleteBackupDirectoryReply {}))
    }

    async fn check_disk_space(
        &self,
        request: Request<idl::CheckDiskSpaceRequest>,
    ) -> Result<Response<idl::CheckDiskSpaceReply>, Status> {
        let usages = request
            .into_inner()
            .dirs
            .iter()
            .map(|dir| disk::usage(Utf8Path::new(dir)).map(|u| wire::usage_to_proto(&u)))
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(to_status)?;
        Ok(Response::new(idl::CheckDiskSpaceReply { usages }))
    }

    async fn upgrade_primaries(
        &self,
        request: Request<idl::UpgradePrimariesRequest>,
    ) -> Result<Response<idl::UpgradePrimariesReply>, Status> {
        let request = request.into_inner();
        let post = Utf8PathBuf::from(&request.post_upgrade_coordinator_backup_dir);

        let errors: Vec<anyhow::Error> =
            join_all(request.options.iter().map(|opts| upgrade_primary(opts, &post)))
                .await
                .into_iter()
                .filter_map(Result::err)
                .collect();
        if !errors.is_empty() {
            return Err(to_status_all(errors));
        }
        Ok(Response::new(idl::UpgradePrimariesReply {}))
    }

    async fn rename_directories(
        &self,
        request: Request<idl::RenameDirectoriesRequest>,
    ) -> Result<Response<idl::RenameDirectoriesReply>, Status> {
        let request = request.into_inner();
        let pairs: Vec<_> = request.pairs.iter().map(wire::rename_pair_from_proto).collect();
        blocking(move || {
            if request.revert {
                rename::revert_renamed_data_directories(&pairs)
            } else {
                rename::rename_data_directories(&pairs)
            }
        })
        .await?;
        Ok(Response::new(idl::RenameDirectoriesReply {}))
    }

    async fn rsync(
        &self,
        request: Request<idl::RsyncRequest>,
    ) -> Result<Response<idl::RsyncReply>, Status> {
        let copies = request
            .into_inner()
            .options
            .iter()
            .map(wire::rsync_from_proto)
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(to_status)?;

        let errors: Vec<anyhow::Error> = join_all(copies.iter().map(copy))
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();
        if !errors.is_empty() {
            return Err(to_status_all(errors));
        }
        Ok(Response::new(idl::RsyncReply {}))
    }

    async fn restore_pg_control(
        &self,
        request: Request<idl::RestorePgControlRequest>,
    ) -> Result<Response<idl::RestorePgControlReply>, Status> {
        let dirs = wire::paths(&request.into_inner().data_dirs);
        blocking(move || {
            for dir in &dirs {
                data_dirs::restore_pg_control(dir)?;
            }
            Ok(())
        })
        .await?;
        Ok(Response::new(idl::RestorePgControlReply {}))
    }

    async fn delete_data_directories(
        &self,
        request: Request<idl::DeleteDataDirectoriesRequest>,
    ) -> Result<Response<idl::DeleteDataDirectoriesReply>, Status> {
        let dirs = wire::paths(&request.into_inner().data_dirs);
        blocking(move || data_dirs::delete_data_directories(&dirs)).await?;
        Ok(Response::new(idl::DeleteDataDirectoriesReply {}))
    }

    async fn delete_tablespace_directories(
        &self,
        request: Request<idl::DeleteTablespaceDirectoriesRequest>,
    ) -> Result<Response<idl::DeleteTablespaceDirectoriesReply>, Status> {
        let dirs = wire::paths(&request.into_inner().dirs);
        blocking(move || data_dirs::delete_tablespace_directories(&dirs)).await?;
        Ok(Response::new(idl::DeleteTablespaceDirectoriesReply {}))
    }

    async fn delete_state_directory(
        &self,
        _request: Request<idl::DeleteStateDirectoryRequest>,
    ) -> Result<Response<idl::DeleteStateDirectoryReply>, Status> {
        let dir = self.state_dir.clone();
        blocking(move || {
            info!("deleting state directory {dir}");
            fs_ext::remove_dir_all(&dir).with_context(|| format!("delete state directory {dir}"))
        })
        .await?;
        Ok(Response::new(idl::DeleteStateDirectoryReply {}))
    }

    async fn archive_log_directory(
        &self,
        request: Request<idl::ArchiveLogDirectoryRequest>,
    ) -> Result<Response<idl::ArchiveLogDirectoryReply>, Status> {
        let new_dir = Utf8PathBuf::from(request.into_inner().new_dir);
        let log_dir = paths::log_dir().map_err(to_status)?;
        archive::archive_log_directory(&log_dir, &new_dir).map_err(to_status)?;
        Ok(Response::new(idl::ArchiveLogDirectoryReply {}))
    }

    async fn update_configuration(
        &self,
        request: Request<idl::UpdateConfigurationRequest>,
    ) -> Result<Response<idl::UpdateConfigurationReply>, Status> {
        let request = request.into_inner();
        blocking(move || update_configuration(&request)).await?;
        Ok(Response::new(idl::UpdateConfigurationReply {}))
    }

    async fn stop_agent(
        &self,
        _request: Request<idl::StopAgentRequest>,
    ) -> Result<Response<idl::StopAgentReply>, Status> {
        info!("stopping on request");
        // The server finishes answering this request before it exits.
        self.shutdown.cancel();
        Ok(Response::new(idl::StopAgentReply {}))
    }
}

#[cfg(test)]
mod tests {
    use camino_tempfile::Utf8TempDir;
    use upgrade_proto::idl::{ConfFile, ConfFileRewrite, Symlink};

    use super::*;

    fn service(dir: &Utf8TempDir) -> AgentService {
        AgentService::new(dir.path().join("state"), CancellationToken::new())
    }

    #[tokio::test]
    async fn copies_keep_rsyncs_output() {
        let dir = camino_tempfile::tempdir().unwrap();
        let source = dir.path().join("coordinator-post-upgrade");
        std::fs::create_dir(&source).unwrap();
        std::fs::write(source.join("PG_VERSION"), "9.4\n").unwrap();
        let destination = dir.path().join("demoDataDir0");

        let opts = rsync::Options::new(vec![rsync::contents_of(&source)], destination.as_str())
            .with_options(&[rsync::RsyncOption::Archive, rsync::RsyncOption::Stats]);
        let output = copy(&opts).await.unwrap();

        assert!(output.contains("Number of files"), "{output}");
        assert_eq!(
            std::fs::read_to_string(destination.join("PG_VERSION")).unwrap(),
            "9.4\n"
        );
    }

    #[test]
    fn configuration_rewrites_files_and_links() {
        let dir = camino_tempfile::tempdir().unwrap();
        let conf = dir.path().join("postgresql.conf");
        std::fs::write(&conf, "port=25432 # primary\nmax_connections=250\n").unwrap();
        let tblspc = dir.path().join("pg_tblspc");
        std::fs::create_dir(&tblspc).unwrap();
        std::os::unix::fs::symlink("/data/old", tblspc.join("16386")).unwrap();

        update_configuration(&idl::UpdateConfigurationRequest {
            rewrites: vec![
                ConfFileRewrite {
                    path: conf.to_string(),
                    pattern: r"^port=25432\b".to_string(),
                    replacement: "port=50433".to_string(),
                },
                ConfFileRewrite {
                    path: conf.to_string(),
                    pattern: r"^max_connections=250".to_string(),
                    replacement: "max_connections=750".to_string(),
                },
            ],
            files: vec![ConfFile {
                path: dir.path().join("internal.auto.conf").to_string(),
                contents: "gp_dbid=4\n".to_string(),
            }],
            symlinks: vec![Symlink {
                path: tblspc.join("16386").to_string(),
                target: "/data/new/4".to_string(),
            }],
        })
        .unwrap();

        assert_eq!(
            std::fs::read_to_string(&conf).unwrap(),
            "port=50433 # primary\nmax_connections=750\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("internal.auto.conf")).unwrap(),
            "gp_dbid=4\n"
        );
        assert_eq!(
            std::fs::read_link(tblspc.join("16386")).unwrap(),
            std::path::Path::new("/data/new/4")
        );
    }

    #[test]
    fn symlinks_never_replace_directories() {
        let dir = camino_tempfile::tempdir().unwrap();
        let err = replace_symlink(dir.path(), Utf8Path::new("/elsewhere")).unwrap_err();
        assert!(err.to_string().contains("is a directory"), "{err}");
        assert!(dir.path().is_dir());
    }

    #[test]
    fn bad_patterns_are_rejected_before_anything_changes() {
        let dir = camino_tempfile::tempdir().unwrap();
        let target = dir.path().join("written");
        let err = update_configuration(&idl::UpdateConfigurationRequest {
            rewrites: vec![ConfFileRewrite {
                path: dir.path().join("postgresql.conf").to_string(),
                pattern: "(".to_string(),
                replacement: String::new(),
            }],
            files: vec![ConfFile {
                path: target.to_string(),
                contents: "x".to_string(),
            }],
            symlinks: vec![],
        })
        .unwrap_err();
        assert!(err.to_string().contains("invalid pattern"), "{err}");
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn backup_and_state_directories_come_and_go() {
        let dir = camino_tempfile::tempdir().unwrap();
        let agent = service(&dir);
        let backup_dir = dir.path().join("backup/.gpupgrade");

        agent
            .create_backup_directory(Request::new(idl::CreateBackupDirectoryRequest {
                backup_dir: backup_dir.to_string(),
            }))
            .await
            .unwrap();
        assert!(backup_dir.join("tablespaces").is_dir());

        agent
            .delete_backup_directory(Request::new(idl::DeleteBackupDirectoryRequest {
                backup_dir: backup_dir.to_string(),
            }))
            .await
            .unwrap();
        assert!(!backup_dir.exists());

        std::fs::create_dir_all(dir.path().join("state/pg_upgrade")).unwrap();
        agent
            .delete_state_directory(Request::new(idl::DeleteStateDirectoryRequest {}))
            .await
            .unwrap();
        assert!(!dir.path().join("state").exists());

        // already gone
        agent
            .delete_state_directory(Request::new(idl::DeleteStateDirectoryRequest {}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn disk_usage_is_reported_for_directories_yet_to_exist() {
        let dir = camino_tempfile::tempdir().unwrap();
        let missing = dir.path().join("not/yet");
        let reply = service(&dir)
            .check_disk_space(Request::new(idl::CheckDiskSpaceRequest {
                dirs: vec![dir.path().to_string(), missing.to_string()],
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(reply.usages.len(), 2);
        assert_eq!(reply.usages[1].path, missing.as_str());
        assert_eq!(reply.usages[0].filesystem, reply.usages[1].filesystem);
        assert!(reply.usages[0].total_kib >= reply.usages[0].available_kib);
    }

    #[tokio::test]
    async fn environment_failures_name_every_bad_gphome() {
        let dir = camino_tempfile::tempdir().unwrap();
        let status = service(&dir)
            .check_environment(Request::new(idl::CheckEnvironmentRequest {
                gphomes: vec!["/no/gpdb5".to_string(), "/no/gpdb6".to_string()],
            }))
            .await
            .unwrap_err();
        assert!(status.message().contains("/no/gpdb5"), "{}", status.message());
        assert!(status.message().contains("/no/gpdb6"), "{}", status.message());
    }

    #[tokio::test]
    async fn deleting_a_non_data_directory_fails() {
        let dir = camino_tempfile::tempdir().unwrap();
        let not_data = dir.path().join("home");
        std::fs::create_dir(&not_data).unwrap();

        let status = service(&dir)
            .delete_data_directories(Request::new(idl::DeleteDataDirectoriesRequest {
                data_dirs: vec![not_data.to_string()],
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unknown);
        assert!(not_data.exists());
    }

    #[tokio::test]
    async fn stop_cancels_the_server() {
        let dir = camino_tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let agent = AgentService::new(dir.path().to_owned(), token.clone());
        agent
            .stop_agent(Request::new(idl::StopAgentRequest {}))
            .await
            .unwrap();
        assert!(token.is_cancelled());
    }
}
