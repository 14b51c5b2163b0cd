//! Where substep output and status transitions go.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use utils::exec::{BufferedOutput, DevNull, OutputSink};

use crate::{Status, Substep};

/// Width the substep description is padded to before its status.
const DESCRIPTION_WIDTH: usize = 60;

/// Output sink for a phase: child output plus substep status transitions.
pub trait OutStreams: OutputSink {
    fn substep_status(&self, substep: Substep, status: Status);

    /// These streams as a plain sink for child processes.
    fn sink(&self) -> &dyn OutputSink;

    /// Text meant for the operator regardless of verbosity, such as prompts.
    fn console(&self, text: &str) {
        self.stdout(text.as_bytes());
    }
}

impl OutStreams for DevNull {
    fn substep_status(&self, _substep: Substep, _status: Status) {}

    fn sink(&self) -> &dyn OutputSink {
        self
    }
}

pub fn format_status(substep: Substep, status: Status) -> String {
    let label = match status {
        Status::Running => "[IN PROGRESS]",
        Status::Complete => "[COMPLETE]",
        Status::Failed => "[FAILED]",
        Status::Skipped => "[SKIPPED]",
        Status::Quit => "[QUIT]",
        Status::Unknown => "[UNKNOWN]",
    };
    format!("{:<width$}{label}", substep.description(), width = DESCRIPTION_WIDTH)
}

/// Prints substep statuses to the terminal.
///
/// Without `verbose`, each substep occupies one line that is rewritten in place when the
/// substep finishes, and child output is only logged. With `verbose`, child output is held
/// back until the substep finishes and then printed below its final status, followed by
/// the time the substep took.
pub struct ConsoleStreams {
    verbose: bool,
    out: Mutex<Box<dyn Write + Send>>,
    buffered: BufferedOutput,
    started: Mutex<HashMap<Substep, Instant>>,
}

impl ConsoleStreams {
    pub fn new(verbose: bool) -> Self {
        Self::with_writer(verbose, Box::new(std::io::stdout()))
    }

    pub fn with_writer(verbose: bool, out: Box<dyn Write + Send>) -> Self {
        ConsoleStreams {
            verbose,
            out: Mutex::new(out),
            buffered: BufferedOutput::new(),
            started: Mutex::new(HashMap::new()),
        }
    }

    fn write(&self, buf: &[u8]) {
        let mut out = self.out.lock().unwrap();
        // Nothing sensible to do if the terminal went away.
        let _ = out.write_all(buf);
        let _ = out.flush();
    }

    fn elapsed(&self, substep: Substep) -> Option<Duration> {
        self.started
            .lock()
            .unwrap()
            .remove(&substep)
            .map(|start| start.elapsed())
    }
}

impl OutputSink for ConsoleStreams {
    fn stdout(&self, buf: &[u8]) {
        if self.verbose {
            self.buffered.stdout(buf);
        } else {
            tracing::debug!("{}", String::from_utf8_lossy(buf).trim_end());
        }
    }

    fn stderr(&self, buf: &[u8]) {
        if self.verbose {
            self.buffered.stderr(buf);
        } else {
            tracing::debug!("{}", String::from_utf8_lossy(buf).trim_end());
        }
    }
}

impl OutStreams for ConsoleStreams {
    fn sink(&self) -> &dyn OutputSink {
        self
    }

    fn console(&self, text: &str) {
        self.write(text.as_bytes());
    }

    fn substep_status(&self, substep: Substep, status: Status) {
        let line = format_status(substep, status);

        if status == Status::Running {
            self.started.lock().unwrap().insert(substep, Instant::now());
            if !self.verbose {
                self.write(format!("\r{line}").as_bytes());
            }
            return;
        }

        let elapsed = self.elapsed(substep);
        if !self.verbose {
            self.write(format!("\r{line}\n").as_bytes());
            return;
        }

        self.write(format!("{line}\n").as_bytes());
        let output = ConsoleCapture::default();
        self.buffered.flush_to(&output);
        let output = output.0.into_inner().unwrap();
        if !output.is_empty() {
            self.write(&output);
        }
        if let Some(elapsed) = elapsed {
            // Whole milliseconds are plenty for a human.
            let elapsed = Duration::from_millis(elapsed.as_millis() as u64);
            self.write(
                format!(
                    "{} took {}\n\n",
                    substep.description().trim_end_matches("..."),
                    humantime::format_duration(elapsed)
                )
                .as_bytes(),
            );
        }
    }
}

/// Collects flushed child output so it can be written under the console lock in one go.
#[derive(Default)]
struct ConsoleCapture(Mutex<Vec<u8>>);

impl OutputSink for ConsoleCapture {
    fn stdout(&self, buf: &[u8]) {
        self.0.lock().unwrap().extend_from_slice(buf);
    }
    fn stderr(&self, buf: &[u8]) {
        self.0.lock().unwrap().extend_from_slice(buf);
    }
}
