use std::fs::OpenOptions;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use camino::Utf8PathBuf;
use strum_macros::{EnumString, VariantNames};

#[derive(EnumString, strum_macros::Display, VariantNames, Eq, PartialEq, Debug, Clone, Copy)]
#[strum(serialize_all = "snake_case")]
pub enum LogFormat {
    Plain,
    Json,
    Test,
}

impl LogFormat {
    pub fn from_config(s: &str) -> anyhow::Result<LogFormat> {
        use strum::VariantNames;
        LogFormat::from_str(s).with_context(|| {
            format!(
                "Unrecognized log format. Please specify one of: {:?}",
                LogFormat::VARIANTS
            )
        })
    }
}

/// Where the logging should output to.
#[derive(Clone, Debug)]
pub enum Output {
    Stdout,
    Stderr,
    /// Append to the given file, creating it and its directory if needed.
    File(Utf8PathBuf),
}

pub fn init(log_format: LogFormat, output: Output) -> anyhow::Result<()> {
    // We fall back to printing all spans at info-level or above if
    // the RUST_LOG environment variable is not set.
    let rust_log_env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    let file = match &output {
        Output::File(path) => {
            if let Some(dir) = path.parent() {
                crate::crashsafe::create_dir_all(dir)
                    .with_context(|| format!("create log directory {dir}"))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {path}"))?;
            Some(Arc::new(file))
        }
        Output::Stdout | Output::Stderr => None,
    };

    use tracing_subscriber::prelude::*;
    let r = tracing_subscriber::registry();
    let r = r.with({
        let log_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .with_writer(move || -> Box<dyn std::io::Write> {
                match (&output, &file) {
                    (Output::File(_), Some(file)) => Box::new(file.clone()),
                    (Output::Stdout, _) => Box::new(std::io::stdout()),
                    _ => Box::new(std::io::stderr()),
                }
            });
        let log_layer = match log_format {
            LogFormat::Json => log_layer.json().boxed(),
            LogFormat::Plain => log_layer.boxed(),
            LogFormat::Test => log_layer.with_test_writer().boxed(),
        };
        log_layer.with_filter(rust_log_env_filter())
    });
    r.try_init()
        .context("global tracing subscriber is already installed")?;

    Ok(())
}

/// Replaces the default rust panic hook with one that logs the panic through `tracing`,
/// so that panics in the hub and agents end up in their log files.
pub fn replace_panic_hook_with_tracing_panic_hook() {
    std::panic::set_hook(Box::new(tracing_panic_hook));
}

fn tracing_panic_hook(info: &std::panic::PanicHookInfo) {
    let location = info.location();

    let msg = match info.payload().downcast_ref::<&'static str>() {
        Some(s) => *s,
        None => match info.payload().downcast_ref::<String>() {
            Some(s) => &s[..],
            None => "Box<dyn Any>",
        },
    };

    let thread = std::thread::current();
    let thread = thread.name().unwrap_or("<unnamed>");
    let backtrace = std::backtrace::Backtrace::capture();

    let _entered = if let Some(location) = location {
        tracing::error_span!(
            "panic",
            %thread,
            location = %format!("{}:{}:{}", location.file(), location.line(), location.column())
        )
    } else {
        tracing::error_span!("panic", %thread)
    }
    .entered();

    if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
        tracing::error!("{msg}\n\nStack backtrace:\n{backtrace}");
    } else {
        tracing::error!("{msg}");
    }
    eprintln!("thread '{thread}' panicked at '{msg}'");
}
