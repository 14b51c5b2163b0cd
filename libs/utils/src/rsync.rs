//! Wrapper around the `rsync` physical-copy utility.
//!
//! A source path with a trailing `/` transfers the contents of the directory rather than
//! the directory itself; [`contents_of`] builds such paths.

use tokio::process::Command;

use crate::exec::{self, ExecError, OutputSink};

/// rsync's "partial transfer due to error" exit code.
pub const PARTIAL_TRANSFER_EXIT_CODE: i32 = 23;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum RsyncOption {
    Archive,
    Compress,
    Delete,
    Stats,
    Hardlinks,
    Checksum,
}

impl RsyncOption {
    fn flag(&self) -> &'static str {
        match self {
            RsyncOption::Archive => "--archive",
            RsyncOption::Compress => "--compress",
            RsyncOption::Delete => "--delete",
            RsyncOption::Stats => "--stats",
            RsyncOption::Hardlinks => "--hard-links",
            RsyncOption::Checksum => "--checksum",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Options {
    pub sources: Vec<String>,
    /// Remote host of the destination; `None` copies locally.
    pub destination_host: Option<String>,
    pub destination: String,
    pub options: Vec<RsyncOption>,
    pub excludes: Vec<String>,
}

impl Options {
    pub fn new(sources: Vec<String>, destination: impl Into<String>) -> Self {
        Options {
            sources,
            destination: destination.into(),
            ..Default::default()
        }
    }

    pub fn to_host(mut self, host: impl Into<String>) -> Self {
        self.destination_host = Some(host.into());
        self
    }

    pub fn with_options(mut self, options: &[RsyncOption]) -> Self {
        self.options.extend_from_slice(options);
        self
    }

    pub fn with_excludes<I, S>(mut self, excludes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excludes.extend(excludes.into_iter().map(Into::into));
        self
    }

    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = self.options.iter().map(|o| o.flag().to_string()).collect();
        for exclude in &self.excludes {
            args.push(format!("--exclude={exclude}"));
        }
        args.extend(self.sources.iter().cloned());
        args.push(match &self.destination_host {
            Some(host) => format!("{host}:{}", self.destination),
            None => self.destination.clone(),
        });
        args
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RsyncError {
    #[error("rsync partial transfer to \"{destination}\" (exit status {PARTIAL_TRANSFER_EXIT_CODE}): {stderr}")]
    PartialTransfer { destination: String, stderr: String },
    #[error("rsync to \"{destination}\" failed: {source}")]
    Failed {
        destination: String,
        #[source]
        source: ExecError,
    },
}

impl RsyncError {
    /// stderr of the failed transfer, verbatim.
    pub fn stderr(&self) -> &str {
        match self {
            RsyncError::PartialTransfer { stderr, .. } => stderr,
            RsyncError::Failed { source, .. } => source.stderr(),
        }
    }
}

/// Returns `path` with a trailing separator, i.e. "the contents of `path`".
pub fn contents_of(path: impl AsRef<str>) -> String {
    let path = path.as_ref();
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

pub async fn rsync(opts: &Options, sink: &dyn OutputSink) -> Result<(), RsyncError> {
    let destination = match &opts.destination_host {
        Some(host) => format!("{host}:{}", opts.destination),
        None => opts.destination.clone(),
    };
    tracing::info!("rsync {:?} to {destination}", opts.sources);

    let mut cmd = Command::new("rsync");
    cmd.args(opts.args());
    match exec::run(&mut cmd, sink).await {
        Ok(()) => Ok(()),
        Err(e) if e.exit_code() == Some(PARTIAL_TRANSFER_EXIT_CODE) => {
            Err(RsyncError::PartialTransfer {
                destination,
                stderr: e.stderr().to_string(),
            })
        }
        Err(source) => Err(RsyncError::Failed {
            destination,
            source,
        }),
    }
}
