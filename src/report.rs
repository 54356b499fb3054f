//! Structured per-subject, per-stage results.

use crate::codec::CodecError;
use crate::enums::StageKind;
use crate::pipeline::TimedOut;
use crate::subject_index::{ModalityId, SubjectId, VolumeRef};

use serde::Serialize;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Decode,
    Encode,
    ShapeMismatch,
    Registration,
    Timeout,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StageFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StageFailure {
    pub fn new(kind: FailureKind, message: impl fmt::Display) -> Self {
        Self {
            kind,
            message: message.to_string(),
        }
    }
}

impl From<CodecError> for StageFailure {
    fn from(err: CodecError) -> Self {
        let kind = match err {
            CodecError::Decode { .. } => FailureKind::Decode,
            CodecError::Encode { .. } => FailureKind::Encode,
        };
        Self::new(kind, err)
    }
}

impl From<TimedOut> for StageFailure {
    fn from(err: TimedOut) -> Self {
        Self::new(FailureKind::Timeout, err)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    Done { outputs: Vec<VolumeRef> },
    AlreadyDone { outputs: Vec<VolumeRef> },
    Skipped { missing: Vec<ModalityId> },
    Failed(StageFailure),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StageReport {
    pub stage: StageKind,
    pub subject: SubjectId,
    #[serde(flatten)]
    pub outcome: StageOutcome,
}

impl StageReport {
    pub fn new(stage: StageKind, subject: SubjectId, outcome: StageOutcome) -> Self {
        Self {
            stage,
            subject,
            outcome,
        }
    }

    /// Volumes this stage left on disk, whether written now or earlier
    pub fn outputs(&self) -> &[VolumeRef] {
        match &self.outcome {
            StageOutcome::Done { outputs } | StageOutcome::AlreadyDone { outputs } => {
                outputs.as_slice()
            }
            StageOutcome::Skipped { .. } | StageOutcome::Failed(_) => &[],
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, StageOutcome::Failed(_))
    }
}

fn modality_list(refs: &[VolumeRef]) -> String {
    refs.iter()
        .map(|r| r.modality.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for StageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = self.stage.verb();
        match &self.outcome {
            StageOutcome::Done { outputs } => write!(f, "-> {verb} {}", modality_list(outputs)),
            StageOutcome::AlreadyDone { outputs } => {
                write!(f, "-> already {verb} {}", modality_list(outputs))
            }
            StageOutcome::Skipped { missing } => {
                let missing: Vec<_> = missing.iter().map(ModalityId::as_str).collect();
                write!(f, "-> incomplete (missing {})", missing.join(", "))
            }
            StageOutcome::Failed(failure) => write!(
                f,
                "-> {:?} failed ({:?}): {}",
                self.stage, failure.kind, failure.message
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SubjectReport {
    pub subject: SubjectId,
    pub stages: Vec<StageReport>,
}

impl SubjectReport {
    pub fn has_failures(&self) -> bool {
        self.stages.iter().any(StageReport::is_failure)
    }
}

impl fmt::Display for SubjectReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.subject)?;
        for stage in &self.stages {
            write!(f, "\n{stage}")?;
        }
        Ok(())
    }
}

/// Totals over a whole run, for the closing log line
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub done: usize,
    pub already_done: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl RunSummary {
    pub fn from_reports(reports: &[SubjectReport]) -> Self {
        let mut summary = Self::default();
        for stage in reports.iter().flat_map(|r| &r.stages) {
            match stage.outcome {
                StageOutcome::Done { .. } => summary.done += 1,
                StageOutcome::AlreadyDone { .. } => summary.already_done += 1,
                StageOutcome::Skipped { .. } => summary.skipped += 1,
                StageOutcome::Failed(_) => summary.failed += 1,
            }
        }
        summary
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} done, {} already done, {} skipped, {} failed",
            self.done, self.already_done, self.skipped, self.failed
        )
    }
}
