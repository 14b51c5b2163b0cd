//! Durable record of which phases and substeps have run, kept in `steps.json` under the
//! state directory.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use utils::crashsafe;

use crate::{Phase, Substep};

pub const STEPS_FILE_NAME: &str = "steps.json";

/// Key under which a phase's own status is stored next to its substeps.
const PHASE_STATUS_KEY: &str = "status";

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Status {
    /// Never run. Not stored.
    #[default]
    Unknown,
    Running,
    Complete,
    Failed,
    Skipped,
    Quit,
}

type Steps = BTreeMap<Phase, BTreeMap<String, Status>>;

pub struct StepStore {
    path: Utf8PathBuf,
    // Serializes read-modify-write cycles within the process.
    lock: Mutex<()>,
}

impl StepStore {
    pub fn new(state_dir: &Utf8Path) -> StepStore {
        StepStore::at(state_dir.join(STEPS_FILE_NAME))
    }

    pub fn at(path: Utf8PathBuf) -> StepStore {
        StepStore {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn load(&self) -> anyhow::Result<Steps> {
        match std::fs::read(&self.path) {
            Ok(contents) => serde_json::from_slice(&contents)
                .with_context(|| format!("parse step store {}", self.path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Steps::new()),
            Err(e) => Err(e).with_context(|| format!("read step store {}", self.path)),
        }
    }

    fn get(&self, phase: Phase, key: &str) -> anyhow::Result<Status> {
        let _guard = self.lock.lock().unwrap();
        let steps = self.load()?;
        Ok(steps
            .get(&phase)
            .and_then(|substeps| substeps.get(key))
            .copied()
            .unwrap_or_default())
    }

    fn set(&self, phase: Phase, key: &str, status: Status) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut steps = self.load()?;
        steps
            .entry(phase)
            .or_default()
            .insert(key.to_string(), status);

        let contents = serde_json::to_vec_pretty(&steps)?;
        if let Some(parent) = self.path.parent() {
            crashsafe::create_dir_all(parent)?;
        }
        crashsafe::overwrite(&self.path, &contents)
            .with_context(|| format!("write step store {}", self.path))
    }

    pub fn read(&self, phase: Phase, substep: Substep) -> anyhow::Result<Status> {
        self.get(phase, substep.into())
    }

    pub fn write(&self, phase: Phase, substep: Substep, status: Status) -> anyhow::Result<()> {
        self.set(phase, substep.into(), status)
    }

    pub fn read_phase(&self, phase: Phase) -> anyhow::Result<Status> {
        self.get(phase, PHASE_STATUS_KEY)
    }

    pub fn write_phase(&self, phase: Phase, status: Status) -> anyhow::Result<()> {
        self.set(phase, PHASE_STATUS_KEY, status)
    }

    pub fn has_phase_started(&self, phase: Phase) -> anyhow::Result<bool> {
        Ok(self.read_phase(phase)? != Status::Unknown)
    }

    pub fn has_phase_completed(&self, phase: Phase) -> anyhow::Result<bool> {
        Ok(self.read_phase(phase)? == Status::Complete)
    }

    /// True if the substep was ever entered, whatever its outcome.
    pub fn has_substep_run(&self, phase: Phase, substep: Substep) -> anyhow::Result<bool> {
        Ok(self.read(phase, substep)? != Status::Unknown)
    }

    pub fn has_substep_completed(&self, phase: Phase, substep: Substep) -> anyhow::Result<bool> {
        Ok(self.read(phase, substep)? == Status::Complete)
    }
}
