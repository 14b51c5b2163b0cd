//! Runs external utilities to completion.
//!
//! Every child runs with stdin closed. Its stdout and stderr are buffered and handed to an
//! [`OutputSink`] once the child has exited, so output of children running in parallel
//! is never interleaved.

use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;

use tokio::process::Command;

/// Receives the output of a finished child process.
pub trait OutputSink: Send + Sync {
    fn stdout(&self, buf: &[u8]);
    fn stderr(&self, buf: &[u8]);
}

/// Discards everything.
pub struct DevNull;

impl OutputSink for DevNull {
    fn stdout(&self, _buf: &[u8]) {}
    fn stderr(&self, _buf: &[u8]) {}
}

/// Keeps output in memory until [`BufferedOutput::flush_to`] is called.
#[derive(Default)]
pub struct BufferedOutput {
    stdout: Mutex<Vec<u8>>,
    stderr: Mutex<Vec<u8>>,
}

impl BufferedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flush_to(&self, sink: &dyn OutputSink) {
        let stdout = std::mem::take(&mut *self.stdout.lock().unwrap());
        let stderr = std::mem::take(&mut *self.stderr.lock().unwrap());
        if !stdout.is_empty() {
            sink.stdout(&stdout);
        }
        if !stderr.is_empty() {
            sink.stderr(&stderr);
        }
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout.lock().unwrap()).into_owned()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr.lock().unwrap()).into_owned()
    }
}

impl OutputSink for BufferedOutput {
    fn stdout(&self, buf: &[u8]) {
        self.stdout.lock().unwrap().extend_from_slice(buf);
    }
    fn stderr(&self, buf: &[u8]) {
        self.stderr.lock().unwrap().extend_from_slice(buf);
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ExecError {
    #[error("could not spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{program}` {status}{}", stderr_suffix(.stderr))]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
}

fn stderr_suffix(stderr: &str) -> String {
    let stderr = stderr.trim_end();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

impl ExecError {
    /// Exit code of a child that ran and failed; `None` for spawn errors and signals.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecError::Spawn { .. } => None,
            ExecError::Failed { status, .. } => status.code(),
        }
    }

    pub fn stderr(&self) -> &str {
        match self {
            ExecError::Spawn { .. } => "",
            ExecError::Failed { stderr, .. } => stderr,
        }
    }
}

fn program_name(cmd: &Command) -> String {
    cmd.as_std().get_program().to_string_lossy().into_owned()
}

/// Runs `cmd` and returns its captured stdout. The output is also forwarded to `sink`.
pub async fn run_with_output(cmd: &mut Command, sink: &dyn OutputSink) -> Result<String, ExecError> {
    let program = program_name(cmd);
    tracing::debug!("running {:?}", cmd.as_std());

    let output = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ExecError::Spawn {
            program: program.clone(),
            source,
        })?;

    sink.stdout(&output.stdout);
    sink.stderr(&output.stderr);

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        tracing::debug!("{program} failed with {}: {stderr}", output.status);
        return Err(ExecError::Failed {
            program,
            status: output.status,
            stderr,
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Runs `cmd`, forwarding its output to `sink`.
pub async fn run(cmd: &mut Command, sink: &dyn OutputSink) -> Result<(), ExecError> {
    run_with_output(cmd, sink).await.map(|_| ())
}

/// Like [`run_with_output`], but writes `input` to the child's stdin and then closes it.
pub async fn run_with_input(
    cmd: &mut Command,
    input: &[u8],
    sink: &dyn OutputSink,
) -> Result<String, ExecError> {
    use tokio::io::AsyncWriteExt;

    let program = program_name(cmd);
    tracing::debug!("running {:?} with {} bytes of input", cmd.as_std(), input.len());

    let spawn_error = |source| ExecError::Spawn {
        program: program.clone(),
        source,
    };

    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(spawn_error)?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input).await.map_err(spawn_error)?;
        // dropping stdin sends EOF
    }

    let output = child.wait_with_output().await.map_err(spawn_error)?;

    sink.stdout(&output.stdout);
    sink.stderr(&output.stderr);

    if !output.status.success() {
        return Err(ExecError::Failed {
            program,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Quotes `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let buffered = BufferedOutput::new();
        let err = run(
            Command::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]),
            &buffered,
        )
        .await
        .unwrap_err();

        assert_eq!(err.exit_code(), Some(3));
        assert_eq!(err.stderr(), "err\n");
        assert!(err.to_string().contains("err"), "{err}");
        assert_eq!(buffered.stdout_string(), "out\n");
        assert_eq!(buffered.stderr_string(), "err\n");
    }

    #[tokio::test]
    async fn returns_stdout() {
        let out = run_with_output(Command::new("sh").args(["-c", "printf hello"]), &DevNull)
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn feeds_stdin() {
        let out = run_with_input(&mut Command::new("cat"), b"SELECT 1;\n", &DevNull)
            .await
            .unwrap();
        assert_eq!(out, "SELECT 1;\n");
    }

    #[tokio::test]
    async fn spawn_failure_names_the_program() {
        let err = run(&mut Command::new("/nonexistent/gpupgrade-test-binary"), &DevNull)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
        assert!(err.to_string().contains("/nonexistent/gpupgrade-test-binary"));
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("/usr/local/gpdb6"), "/usr/local/gpdb6");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
