use std::future::Future;
use std::io::BufRead;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, info_span, warn, Instrument};

use crate::{
    validate_phase_order, NextActionError, OutStreams, Phase, Status, StepError, StepStore,
    Substep, SubstepError,
};

pub struct BeginOptions<'a> {
    pub verbose: bool,
    pub non_interactive: bool,
    /// Printed before the prompt.
    pub confirmation_text: &'a str,
}

/// One run of a phase: a sequence of substeps sharing a status store and output streams.
///
/// The first substep that fails is remembered, and every substep after it is skipped
/// without being entered.
pub struct Step {
    phase: Phase,
    store: Arc<StepStore>,
    streams: Arc<dyn OutStreams>,
    verbose: bool,
    err: Option<StepError>,
    started: Instant,
    store_disabled: bool,
}

impl Step {
    /// Starts a phase on behalf of the operator: checks the phase may run now, asks for
    /// confirmation unless `non_interactive`, and marks the phase as running.
    pub fn begin(
        phase: Phase,
        store: Arc<StepStore>,
        streams: Arc<dyn OutStreams>,
        opts: BeginOptions<'_>,
        input: impl BufRead,
    ) -> Result<Step, StepError> {
        validate_phase_order(&store, phase)?;

        streams.console(&format!("{}\n", opts.confirmation_text));
        if !opts.non_interactive {
            prompt(phase, streams.as_ref(), input)?;
        }

        store
            .write_phase(phase, Status::Running)
            .map_err(StepError::Store)?;

        let mut step = Step::new(phase, store, streams);
        step.verbose = opts.verbose;
        Ok(step)
    }

    /// A step whose phase status is owned by someone else, i.e. the hub's half of a phase
    /// driven by the CLI.
    pub fn new(phase: Phase, store: Arc<StepStore>, streams: Arc<dyn OutStreams>) -> Step {
        Step {
            phase,
            store,
            streams,
            verbose: false,
            err: None,
            started: Instant::now(),
            store_disabled: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn streams(&self) -> Arc<dyn OutStreams> {
        Arc::clone(&self.streams)
    }

    pub fn err(&self) -> Option<&StepError> {
        self.err.as_ref()
    }

    /// Runs `f` unless a previous run of this substep completed.
    pub async fn run<F, Fut, E>(&mut self, substep: Substep, f: F)
    where
        F: FnOnce(Arc<dyn OutStreams>) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Into<SubstepError>,
    {
        self.run_internal(substep, false, f).await
    }

    /// Runs `f` even if a previous run of this substep completed.
    pub async fn always_run<F, Fut, E>(&mut self, substep: Substep, f: F)
    where
        F: FnOnce(Arc<dyn OutStreams>) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Into<SubstepError>,
    {
        self.run_internal(substep, true, f).await
    }

    /// Like [`Step::run`], but does nothing at all unless `should_run`.
    pub async fn run_conditionally<F, Fut, E>(&mut self, substep: Substep, should_run: bool, f: F)
    where
        F: FnOnce(Arc<dyn OutStreams>) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Into<SubstepError>,
    {
        if !should_run {
            info!("skipping {substep} since its condition does not hold");
            return;
        }
        self.run_internal(substep, false, f).await
    }

    /// Runs `f`, a call into the hub which reports its own substeps, without recording a
    /// status of its own.
    pub async fn run_hub_substep<F, Fut>(&mut self, f: F)
    where
        F: FnOnce(Arc<dyn OutStreams>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        if self.err.is_some() {
            return;
        }
        if let Err(e) = f(self.streams()).await {
            self.err = Some(StepError::Hub(e));
        }
    }

    async fn run_internal<F, Fut, E>(&mut self, substep: Substep, always_run: bool, f: F)
    where
        F: FnOnce(Arc<dyn OutStreams>) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Into<SubstepError>,
    {
        if self.err.is_some() {
            return;
        }

        let prior = match self.read_status(substep) {
            Ok(status) => status,
            Err(e) => {
                self.err = Some(StepError::Store(e));
                return;
            }
        };

        if prior == Status::Running {
            // The previous attempt died in the middle of this substep. Its effects are
            // unknown, so an operator has to look before anything else happens.
            self.streams.substep_status(substep, Status::Failed);
            let write = self.write_status(substep, Status::Failed);
            self.err = Some(match write {
                Ok(()) => StepError::Substep {
                    substep,
                    error: anyhow::anyhow!(
                        "Found previous substep {substep} was running. Manual intervention needed."
                    ),
                },
                Err(e) => StepError::Store(e),
            });
            return;
        }

        if prior == Status::Complete && !always_run {
            info!("skipping completed substep {substep}");
            self.streams.substep_status(substep, Status::Skipped);
            return;
        }

        if let Err(e) = self.write_status(substep, Status::Running) {
            self.err = Some(StepError::Store(e));
            return;
        }
        self.streams.substep_status(substep, Status::Running);

        let span = info_span!("substep", phase = %self.phase, %substep);
        let started = Instant::now();
        let result: Result<(), SubstepError> = f(self.streams()).instrument(span).await.map_err(Into::into);
        info!(
            "substep {substep} finished in {}",
            humantime::format_duration(started.elapsed())
        );

        let (stored, shown) = match &result {
            Ok(()) => (Status::Complete, Status::Complete),
            // Persisted as complete so that a rerun does not try again.
            Err(SubstepError::Skip) => (Status::Complete, Status::Skipped),
            Err(SubstepError::Quit) => (Status::Quit, Status::Quit),
            Err(SubstepError::Failed(_)) => (Status::Failed, Status::Failed),
        };

        let write = self.write_status(substep, stored);
        self.streams.substep_status(substep, shown);

        match result {
            Ok(()) | Err(SubstepError::Skip) => {}
            Err(SubstepError::Quit) => self.err = Some(StepError::Quit),
            Err(SubstepError::Failed(error)) => {
                warn!("substep {substep} failed: {error:#}");
                self.err = Some(StepError::Substep { substep, error });
            }
        }
        if let Err(e) = write {
            self.err.get_or_insert(StepError::Store(e));
        }
    }

    fn read_status(&self, substep: Substep) -> anyhow::Result<Status> {
        if self.store_disabled {
            return Ok(Status::Unknown);
        }
        self.store.read(self.phase, substep)
    }

    fn write_status(&self, substep: Substep, status: Status) -> anyhow::Result<()> {
        if self.store_disabled {
            return Ok(());
        }
        self.store.write(self.phase, substep, status)
    }

    /// Stops the remaining substeps and [`Step::complete`] from touching the store, which is
    /// about to be deleted along with the state directory.
    pub fn disable_store(&mut self) {
        self.store_disabled = true;
    }

    /// Records the phase's final status. On success prints `success_text`. On failure
    /// returns the first error together with the next action the operator should take.
    pub fn complete(mut self, success_text: &str) -> Result<(), NextActionError> {
        let status = match &self.err {
            None => Status::Complete,
            Some(StepError::Quit) => Status::Quit,
            Some(_) => Status::Failed,
        };

        if !self.store_disabled {
            if let Err(e) = self.store.write_phase(self.phase, status) {
                self.err.get_or_insert(StepError::Store(e));
            }
        }

        info!(
            "{} took {}",
            self.phase,
            humantime::format_duration(self.started.elapsed())
        );

        let Some(err) = self.err.take() else {
            self.streams.console(&format!("\n{success_text}\n"));
            return Ok(());
        };

        if err.is_cancellation() {
            return Err(NextActionError::new(err, ""));
        }

        let next_action = match err.next_action() {
            Some(specific) => specific.to_string(),
            None => generic_next_action(self.phase),
        };
        Err(NextActionError::new(err, next_action))
    }

    /// Returns the first error, if any. Used by the hub, whose caller records the phase's
    /// status.
    pub fn finish(self) -> Result<(), StepError> {
        match self.err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub fn generic_next_action(phase: Phase) -> String {
    let mut next_action =
        format!(r#"Please address the above issue and run "gpupgrade {phase}" again."#);
    if matches!(phase, Phase::Initialize | Phase::Execute) {
        next_action.push_str(
            "\nIf you would like to return the cluster to its original state, please run \"gpupgrade revert\".",
        );
    }
    next_action
}

/// Asks before a phase starts. Declining, or closing the input, cancels the phase with
/// [`StepError::UserCanceled`]; [`StepError::Quit`] is reserved for a substep that quits.
fn prompt(phase: Phase, streams: &dyn OutStreams, mut input: impl BufRead) -> Result<(), StepError> {
    loop {
        streams.console(&format!("Continue with gpupgrade {phase}? Yy|Nn: "));

        let mut answer = String::new();
        match input.read_line(&mut answer) {
            // end of input counts as no
            Ok(0) => return Err(StepError::UserCanceled),
            Ok(_) => {}
            Err(e) => return Err(StepError::Prompt(e)),
        }

        match answer.trim() {
            "y" | "Y" => {
                streams.console("\nProceeding with upgrade\n\n");
                return Ok(());
            }
            "n" | "N" => {
                streams.console(&format!("\nCanceling gpupgrade {phase}\n"));
                return Err(StepError::UserCanceled);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use camino_tempfile::Utf8TempDir;
    use utils::exec::OutputSink;

    use super::*;

    /// Records everything a step prints.
    #[derive(Default)]
    struct Recorder {
        stdout: Mutex<Vec<u8>>,
        statuses: Mutex<Vec<(Substep, Status)>>,
    }

    impl Recorder {
        fn stdout_string(&self) -> String {
            String::from_utf8_lossy(&self.stdout.lock().unwrap()).into_owned()
        }
        fn statuses(&self) -> Vec<(Substep, Status)> {
            self.statuses.lock().unwrap().clone()
        }
    }

    impl OutputSink for Recorder {
        fn stdout(&self, buf: &[u8]) {
            self.stdout.lock().unwrap().extend_from_slice(buf);
        }
        fn stderr(&self, _buf: &[u8]) {}
    }

    impl OutStreams for Recorder {
        fn substep_status(&self, substep: Substep, status: Status) {
            self.statuses.lock().unwrap().push((substep, status));
        }
        fn sink(&self) -> &dyn OutputSink {
            self
        }
    }

    async fn unreachable_substep(_streams: Arc<dyn OutStreams>) -> anyhow::Result<()> {
        panic!("must not be called")
    }

    fn setup() -> (Utf8TempDir, Arc<StepStore>, Arc<Recorder>) {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = Arc::new(StepStore::new(dir.path()));
        (dir, store, Arc::new(Recorder::default()))
    }

    fn opts(non_interactive: bool) -> BeginOptions<'static> {
        BeginOptions {
            verbose: false,
            non_interactive,
            confirmation_text: "HELLO",
        }
    }

    #[test]
    fn prompt_accepted() {
        let (_dir, store, recorder) = setup();
        let step = Step::begin(
            Phase::Initialize,
            store.clone(),
            recorder.clone(),
            opts(false),
            &b"y\n"[..],
        )
        .unwrap();
        assert!(step.err().is_none());

        let out = recorder.stdout_string();
        let hello = out.find("HELLO").unwrap();
        let prompt = out
            .find("Continue with gpupgrade initialize? Yy|Nn: ")
            .unwrap();
        assert!(hello < prompt, "{out}");
        assert_eq!(store.read_phase(Phase::Initialize).unwrap(), Status::Running);
    }

    #[test]
    fn prompt_declined() {
        let (_dir, store, recorder) = setup();
        let err = Step::begin(
            Phase::Initialize,
            store.clone(),
            recorder.clone(),
            opts(false),
            &b"n\n"[..],
        )
        .err()
        .unwrap();
        assert!(matches!(err, StepError::UserCanceled), "{err:?}");
        assert!(!store.path().exists(), "nothing must be written");
    }

    #[test]
    fn prompt_closed_input_cancels_rather_than_quits() {
        let (_dir, store, recorder) = setup();
        let err = Step::begin(Phase::Initialize, store, recorder, opts(false), &b""[..])
            .err()
            .unwrap();
        assert!(matches!(err, StepError::UserCanceled), "{err:?}");
        assert!(!matches!(err, StepError::Quit));
    }

    #[test]
    fn prompt_repeats_until_answered() {
        let (_dir, store, recorder) = setup();
        let err = Step::begin(
            Phase::Execute,
            store.clone(),
            recorder.clone(),
            opts(false),
            &b"maybe\n\nY\n"[..],
        )
        .err()
        .unwrap();
        // execute is out of order without initialize, so it never got to the prompt
        assert!(matches!(err, StepError::OutOfOrder { .. }), "{err:?}");
        assert!(!recorder.stdout_string().contains("Continue with"));

        store.write_phase(Phase::Initialize, Status::Complete).unwrap();
        Step::begin(
            Phase::Execute,
            store.clone(),
            recorder.clone(),
            opts(false),
            &b"maybe\n\nY\n"[..],
        )
        .unwrap();
        assert_eq!(
            recorder
                .stdout_string()
                .matches("Continue with gpupgrade execute? Yy|Nn: ")
                .count(),
            3
        );
    }

    #[test]
    fn non_interactive_skips_prompt() {
        let (_dir, store, recorder) = setup();
        Step::begin(
            Phase::Initialize,
            store.clone(),
            recorder.clone(),
            opts(true),
            std::io::empty(),
        )
        .unwrap();
        assert!(!recorder.stdout_string().contains("Continue with"));
        assert_eq!(store.read_phase(Phase::Initialize).unwrap(), Status::Running);
    }

    #[tokio::test]
    async fn completed_substep_is_not_rerun() {
        let (_dir, store, recorder) = setup();
        store
            .write(Phase::Initialize, Substep::CheckDiskSpace, Status::Complete)
            .unwrap();

        let mut step = Step::new(Phase::Initialize, store.clone(), recorder.clone());
        let calls = AtomicUsize::new(0);
        step.run(Substep::CheckDiskSpace, |_streams| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(())
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(step.err().is_none());
        assert_eq!(
            recorder.statuses(),
            vec![(Substep::CheckDiskSpace, Status::Skipped)]
        );

        step.always_run(Substep::CheckDiskSpace, |_streams| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(())
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn running_substep_is_fatal() {
        let (_dir, store, recorder) = setup();
        store
            .write(Phase::Initialize, Substep::CheckDiskSpace, Status::Running)
            .unwrap();

        let mut step = Step::new(Phase::Initialize, store.clone(), recorder.clone());
        step.run(Substep::CheckDiskSpace, unreachable_substep)
        .await;

        let err = step.err().unwrap();
        assert!(
            err.to_string()
                .contains("Found previous substep check_disk_space was running."),
            "{err}"
        );
        assert_eq!(
            store.read(Phase::Initialize, Substep::CheckDiskSpace).unwrap(),
            Status::Failed
        );
    }

    #[tokio::test]
    async fn first_failure_skips_the_rest() {
        let (_dir, store, recorder) = setup();
        let mut step = Step::new(Phase::Execute, store.clone(), recorder.clone());

        step.run(Substep::ShutdownSourceCluster, |_streams| async {
            Err::<(), _>(anyhow::anyhow!("gpstop failed"))
        })
        .await;
        step.run(Substep::UpgradeMaster, unreachable_substep)
        .await;

        assert_eq!(
            recorder.statuses(),
            vec![
                (Substep::ShutdownSourceCluster, Status::Running),
                (Substep::ShutdownSourceCluster, Status::Failed),
            ]
        );
        assert_eq!(
            store.read(Phase::Execute, Substep::UpgradeMaster).unwrap(),
            Status::Unknown
        );
        let err = step.finish().unwrap_err();
        assert_eq!(
            err.to_string(),
            "substep \"shutdown_source_cluster\": gpstop failed"
        );
    }

    #[tokio::test]
    async fn skip_is_stored_as_complete() {
        let (_dir, store, recorder) = setup();
        let mut step = Step::new(Phase::Finalize, store.clone(), recorder.clone());
        step.run(Substep::UpgradeStandby, |_streams| async {
            Err::<(), _>(SubstepError::Skip)
        })
        .await;

        assert!(step.err().is_none());
        assert_eq!(
            store.read(Phase::Finalize, Substep::UpgradeStandby).unwrap(),
            Status::Complete
        );
        assert_eq!(
            recorder.statuses().last(),
            Some(&(Substep::UpgradeStandby, Status::Skipped))
        );
    }

    #[tokio::test]
    async fn quit_ends_the_phase_without_next_action() {
        let (_dir, store, recorder) = setup();
        let mut step = Step::begin(
            Phase::Apply,
            store.clone(),
            recorder.clone(),
            opts(true),
            std::io::empty(),
        )
        .unwrap();
        step.run(Substep::ApplyDataMigrationScripts, |_streams| async {
            Err::<(), _>(SubstepError::Quit)
        })
        .await;

        let err = step.complete("done").unwrap_err();
        assert!(matches!(err.step_error(), Some(StepError::Quit)));
        assert!(err.next_action.is_empty());
        assert_eq!(store.read_phase(Phase::Apply).unwrap(), Status::Quit);
    }

    #[tokio::test]
    async fn conditional_substep_leaves_no_trace() {
        let (_dir, store, recorder) = setup();
        let mut step = Step::new(Phase::Revert, store.clone(), recorder.clone());
        step.run_conditionally(Substep::RestorePgcontrol, false, unreachable_substep)
        .await;
        assert!(recorder.statuses().is_empty());
        assert!(!store
            .has_substep_run(Phase::Revert, Substep::RestorePgcontrol)
            .unwrap());
    }

    #[tokio::test]
    async fn failed_phase_suggests_next_action() {
        let (_dir, store, recorder) = setup();
        let mut step = Step::begin(
            Phase::Initialize,
            store.clone(),
            recorder.clone(),
            opts(true),
            std::io::empty(),
        )
        .unwrap();
        step.run_hub_substep(|_streams| async { Err(anyhow::anyhow!("hub went away")) })
            .await;

        let err = step.complete("Initialize completed successfully.").unwrap_err();
        assert_eq!(err.to_string(), "hub went away");
        assert_eq!(err.next_action, generic_next_action(Phase::Initialize));
        assert!(err.next_action.contains("gpupgrade revert"));
        assert_eq!(store.read_phase(Phase::Initialize).unwrap(), Status::Failed);
        assert!(!recorder.stdout_string().contains("completed successfully"));
    }

    #[tokio::test]
    async fn disabled_store_is_not_written() {
        let (_dir, store, recorder) = setup();
        store.write_phase(Phase::Initialize, Status::Failed).unwrap();
        let mut step = Step::begin(
            Phase::Revert,
            store.clone(),
            recorder.clone(),
            opts(true),
            std::io::empty(),
        )
        .unwrap();
        step.disable_store();
        let path = store.path().to_owned();
        step.run(Substep::DeleteMasterStatedir, |_streams| async move {
            std::fs::remove_file(path).map_err(anyhow::Error::from)
        })
        .await;
        assert!(step.err().is_none());
        step.complete("Revert completed successfully.").unwrap();
        assert!(!store.path().exists());
        assert!(recorder.stdout_string().contains("Revert completed successfully."));
    }
}
