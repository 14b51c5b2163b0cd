//! Support for `--daemonize`: the invoking process re-executes itself without the flag in a
//! new session, waits until the child reports that it is serving, and then exits, leaving
//! the child running in the background.

use std::ffi::OsString;
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

pub const DAEMONIZE_FLAG: &str = "--daemonize";

const START_TIMEOUT: Duration = Duration::from_secs(30);

/// Restarts the current executable with `args` minus [`DAEMONIZE_FLAG`], and waits for the
/// child to print `ready_line` on its stdout.
pub async fn daemonize(args: Vec<OsString>, ready_line: &str) -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("find current executable")?;
    let args: Vec<OsString> = args
        .into_iter()
        .skip(1)
        .filter(|arg| arg != DAEMONIZE_FLAG)
        .collect();

    let mut std_cmd = std::process::Command::new(&exe);
    std_cmd
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // SAFETY: setsid(2) is async-signal-safe and the closure does not allocate.
    unsafe {
        std_cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            Ok(())
        });
    }
    let mut child = Command::from(std_cmd)
        .spawn()
        .with_context(|| format!("spawn {exe:?}"))?;

    let stdout = child.stdout.take().context("child stdout is not piped")?;
    let mut lines = BufReader::new(stdout).lines();

    let wait_for_ready = async {
        while let Some(line) = lines.next_line().await? {
            if line.trim() == ready_line {
                return Ok(true);
            }
        }
        anyhow::Ok(false)
    };

    match tokio::time::timeout(START_TIMEOUT, wait_for_ready).await {
        Ok(Ok(true)) => Ok(()),
        Ok(Ok(false)) => {
            let status = child.wait().await.context("wait for child")?;
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                pipe.read_to_string(&mut stderr).await.ok();
            }
            bail!("{exe:?} exited with {status} before it was ready: {}", stderr.trim_end())
        }
        Ok(Err(e)) => Err(e).context("read child stdout"),
        Err(_) => bail!("{exe:?} did not become ready within {START_TIMEOUT:?}"),
    }
}

/// Called by the daemonized child once it is serving. Errors are ignored: once the parent
/// has exited nobody reads the pipe.
pub fn signal_ready(ready_line: &str) {
    let mut stdout = std::io::stdout();
    let _ = writeln!(stdout, "{ready_line}");
    let _ = stdout.flush();
}

/// Cancels `token` on the first SIGINT, SIGTERM or SIGQUIT.
pub async fn cancel_on_signal(token: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
        _ = token.cancelled() => return Ok(()),
    }
    tracing::info!("terminating on signal");
    token.cancel();
    Ok(())
}
