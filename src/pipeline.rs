//! Running stages over every subject of an index.
//!
//! Subjects are independent: a stage failing for one subject is recorded
//! in that subject's report and the run carries on. Within a subject the
//! stages run in the order given, and each stage sees the outputs earlier
//! stages produced for that subject, so `mask` followed by `register` on
//! the masked modalities works within a single run.

use crate::enums::{DuplicatePolicy, StageKind};
use crate::fetch::FetchError;
use crate::pair_selector::{PairStatus, select_pair};
use crate::registrar::ConfigError;
use crate::report::{StageReport, SubjectReport};
use crate::subject_index::{
    IndexError, ModalityId, ModalityMap, NamingConvention, SubjectId, SubjectIndex, VolumeRef,
};

use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use web_time::Instant;

#[derive(Debug, Error)]
#[error("Subject exceeded its time budget")]
pub struct TimedOut;

/// Wall-clock budget for one subject, checked cooperatively by stages.
#[derive(Clone, Copy, Debug, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn after(budget: Duration) -> Self {
        Self(Some(Instant::now() + budget))
    }

    pub fn expired(&self) -> bool {
        self.0.is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn check(&self) -> Result<(), TimedOut> {
        if self.expired() { Err(TimedOut) } else { Ok(()) }
    }
}

/// Where a stage writes the result for an input volume.
#[derive(Clone)]
pub struct OutputNaming {
    naming: Arc<dyn NamingConvention>,
    postfix: Option<String>,
    directory: Option<PathBuf>,
}

impl OutputNaming {
    pub fn new(naming: Arc<dyn NamingConvention>, postfix: Option<String>) -> Self {
        Self {
            naming,
            postfix,
            directory: None,
        }
    }

    /// Write outputs to `directory` instead of next to the inputs
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn postfix(&self) -> Option<&str> {
        self.postfix.as_deref()
    }

    pub fn output_for(&self, input: &VolumeRef) -> VolumeRef {
        let directory = self.directory.clone().unwrap_or_else(|| {
            input
                .path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_default()
        });
        // Without a postfix the input file name is kept verbatim
        let file_name = match (self.postfix(), input.path.file_name()) {
            (None, Some(name)) => PathBuf::from(name),
            _ => PathBuf::from(self.naming.file_name(
                &input.subject,
                &input.modality,
                self.postfix(),
            )),
        };
        VolumeRef {
            subject: input.subject.clone(),
            modality: input.modality.with_postfix(self.postfix()),
            path: directory.join(file_name),
        }
    }

    /// An output counts as done when it exists and is not the input itself.
    ///
    /// Writing in place leaves nothing to tell a finished volume from an
    /// untouched one, so those are always reprocessed.
    pub fn is_done(&self, input: &VolumeRef, output: &VolumeRef) -> bool {
        if output.path == input.path {
            log::warn!(
                "{}: {} is written in place and will be reprocessed on every run",
                input.subject,
                input.path.display()
            );
            return false;
        }
        output.path.is_file()
    }
}

/// One configured processing step working on a pair of modalities.
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    /// The two modalities this stage pairs up, in role order
    fn roles(&self) -> (&ModalityId, &ModalityId);

    /// Process one subject. Never fails: problems are part of the report.
    fn process(&self, pair: &PairStatus, deadline: &Deadline) -> StageReport;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RunnerOptions {
    /// Worker threads for subjects; `None` runs on the calling thread
    pub jobs: Option<usize>,
    pub subject_timeout: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Cannot start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Problems that stop a run before any subject is processed
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Directory {} does not exist", .0.display())]
    MissingDirectory(PathBuf),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Runner(#[from] RunnerError),
}

pub struct PipelineRunner {
    stages: Vec<Box<dyn Stage>>,
    options: RunnerOptions,
}

impl PipelineRunner {
    pub fn new(stages: Vec<Box<dyn Stage>>, options: RunnerOptions) -> Self {
        Self { stages, options }
    }

    /// Run every stage on every subject of `index`.
    ///
    /// Reports come back in `index.subjects()` order regardless of how many
    /// workers were used.
    pub fn run(&self, index: &SubjectIndex) -> Result<Vec<SubjectReport>, RunnerError> {
        let subjects: Vec<&SubjectId> = index.subjects().collect();

        let reports: Vec<SubjectReport> = match self.options.jobs {
            None | Some(1) => subjects
                .into_iter()
                .map(|subject| self.run_subject(index, subject))
                .collect(),
            Some(jobs) => {
                let pool = rayon::ThreadPoolBuilder::new().num_threads(jobs).build()?;
                log::debug!("Processing subjects on {} threads", pool.current_num_threads());
                pool.install(|| {
                    subjects
                        .into_par_iter()
                        .map(|subject| self.run_subject(index, subject))
                        .collect()
                })
            }
        };

        Ok(reports)
    }

    /// Index `directory` and run every stage over it.
    pub fn run_directory(
        &self,
        directory: &Path,
        naming: &dyn NamingConvention,
        policy: DuplicatePolicy,
    ) -> Result<Vec<SubjectReport>, SetupError> {
        if !directory.is_dir() {
            return Err(SetupError::MissingDirectory(directory.to_path_buf()));
        }
        let index = SubjectIndex::scan(directory, naming, policy)?;
        log::info!(
            "Indexed {} subjects in {}",
            index.len(),
            directory.display()
        );
        Ok(self.run(&index)?)
    }

    fn run_subject(&self, index: &SubjectIndex, subject: &SubjectId) -> SubjectReport {
        let deadline = self
            .options
            .subject_timeout
            .map_or_else(Deadline::none, Deadline::after);

        // Outputs of earlier stages become inputs of later ones
        let mut modalities: ModalityMap = index.modalities(subject).cloned().unwrap_or_default();
        let mut stages = Vec::with_capacity(self.stages.len());

        for stage in &self.stages {
            let (role_a, role_b) = stage.roles();
            let pair = select_pair(subject, &modalities, role_a, role_b);
            let report = stage.process(&pair, &deadline);
            log::info!("{subject}: {report}");

            for output in report.outputs() {
                modalities.insert(output.modality.clone(), output.clone());
            }
            stages.push(report);
        }

        SubjectReport {
            subject: subject.clone(),
            stages,
        }
    }
}
