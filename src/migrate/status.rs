use std::sync::Mutex;

use serde::Serialize;

use crate::error::{MigrateError, StepKind};

/// Where start-up migration currently stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum MigrationPhase {
    Pending,
    WaitingForStore { required: u32, reported: Option<u32> },
    Migrating { bucket: String, step: StepKind },
    Ready,
    Failed { bucket: String, step: StepKind, message: String },
}

/// Shared migration state for the hosting service.
///
/// Domain traffic must be refused until [`MigrationStatus::is_ready`].
#[derive(Debug)]
pub struct MigrationStatus {
    phase: Mutex<MigrationPhase>,
}

impl Default for MigrationStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationStatus {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(MigrationPhase::Pending),
        }
    }

    pub fn snapshot(&self) -> MigrationPhase {
        self.phase.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.snapshot(), MigrationPhase::Ready)
    }

    pub(crate) fn set(&self, phase: MigrationPhase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    pub(crate) fn fail(&self, err: &MigrateError) {
        self.set(MigrationPhase::Failed {
            bucket: err.bucket.clone(),
            step: err.step,
            message: err.source.to_string(),
        });
    }
}
