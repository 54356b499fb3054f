//! Flattening a staging tree into a work directory the index can scan.
//!
//! The staging tree holds one folder per subject and one folder per
//! modality below it (`<staging>/<subject>/<modality>/`), as left behind by
//! [`crate::fetch::fetch_subjects`]. Every modality folder containing a
//! MetaImage file or a DICOM series becomes
//! `<workdir>/<subject>_<modality>.<ext>`.

use crate::codec::VolumeCodec;
use crate::enums::{SortBy, StageKind};
use crate::pipeline::Deadline;
use crate::report::{FailureKind, StageFailure, StageOutcome, StageReport};
use crate::subject_index::{NamingConvention, SubjectId, VolumeRef};
use crate::volume::Volume;
use crate::volume_loader::VolumeLoader;

use rayon::prelude::*;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Input found in one modality folder
#[derive(Clone, Debug, PartialEq, Eq)]
enum Source {
    MetaImage(PathBuf),
    DicomSeries(PathBuf),
}

pub struct ConvertStage {
    codec: Arc<dyn VolumeCodec>,
    naming: Arc<dyn NamingConvention>,
    workdir: PathBuf,
}

impl ConvertStage {
    pub fn new(
        codec: Arc<dyn VolumeCodec>,
        naming: Arc<dyn NamingConvention>,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            codec,
            naming,
            workdir: workdir.into(),
        }
    }

    /// Convert every subject folder under `staging`, in name order.
    ///
    /// Only listing `staging` and creating the work directory can fail the
    /// call; problems with a subject end up in its report.
    pub fn run(&self, staging: &Path, deadline: &Deadline) -> io::Result<Vec<StageReport>> {
        fs::create_dir_all(&self.workdir)?;
        let subjects = sorted_dirs(staging)?;

        let reports: Vec<StageReport> = subjects
            .par_iter()
            .filter_map(|dir| self.convert_subject(dir, deadline))
            .collect();
        for report in &reports {
            log::info!("{}: {report}", report.subject);
        }
        Ok(reports)
    }

    /// `None` when the folder holds nothing that maps to a subject.
    pub fn convert_subject(&self, subject_dir: &Path, deadline: &Deadline) -> Option<StageReport> {
        let subject_name = subject_dir.file_name()?.to_str()?;
        let modality_dirs = match sorted_dirs(subject_dir) {
            Ok(dirs) => dirs,
            Err(err) => {
                log::warn!("Cannot list {}: {err}", subject_dir.display());
                return None;
            }
        };

        let mut subject: Option<SubjectId> = None;
        let mut pending = Vec::new();
        for dir in modality_dirs {
            let Some(modality_name) = dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            // Ids come from the naming convention so the output parses back
            let candidate = format!(
                "{subject_name}_{modality_name}.{}",
                self.naming.extension()
            );
            let Some((id, modality)) = self.naming.parse(&candidate) else {
                log::debug!("Ignoring {}", dir.display());
                continue;
            };
            let Some(source) = find_source(&dir, self.codec.extension()) else {
                log::debug!("No volume in {}", dir.display());
                continue;
            };

            let output = VolumeRef {
                path: self
                    .workdir
                    .join(self.naming.file_name(&id, &modality, None)),
                subject: id.clone(),
                modality,
            };
            subject = Some(id);
            pending.push((source, output));
        }

        let subject = subject?;
        let outputs: Vec<VolumeRef> = pending.iter().map(|(_, o)| o.clone()).collect();
        if outputs.iter().all(|o| o.path.is_file()) {
            return Some(StageReport::new(
                StageKind::Convert,
                subject,
                StageOutcome::AlreadyDone { outputs },
            ));
        }

        let result = pending
            .iter()
            .filter(|(_, output)| !output.path.is_file())
            .try_for_each(|(source, output)| {
                deadline.check()?;
                let volume = self.load(source)?;
                self.codec.encode(&volume, &output.path)?;
                Ok::<(), StageFailure>(())
            });

        let outcome = match result {
            Ok(()) => StageOutcome::Done { outputs },
            Err(failure) => StageOutcome::Failed(failure),
        };
        Some(StageReport::new(StageKind::Convert, subject, outcome))
    }

    fn load(&self, source: &Source) -> Result<Volume, StageFailure> {
        match source {
            Source::MetaImage(path) => Ok(self.codec.decode(path)?),
            Source::DicomSeries(dir) => {
                VolumeLoader::load_from_directory(dir, SortBy::ImagePositionPatient).map_err(|err| {
                    StageFailure::new(
                        FailureKind::Decode,
                        format!("Cannot load DICOM series {}: {err}", dir.display()),
                    )
                })
            }
        }
    }
}

/// Sub-directories of `dir`, sorted by name
fn sorted_dirs(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

/// A volume file with the codec's extension (or a detached `.mhd` header)
/// wins over a DICOM series in the same folder.
fn find_source(dir: &Path, extension: &str) -> Option<Source> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();

    let has_extension = |path: &Path, wanted: &str| {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(wanted))
    };

    files
        .iter()
        .find(|p| has_extension(p, extension) || has_extension(p, "mhd"))
        .map(|p| Source::MetaImage(p.clone()))
        .or_else(|| {
            files
                .iter()
                .any(|p| has_extension(p, "dcm"))
                .then(|| Source::DicomSeries(dir.to_path_buf()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MetaImageCodec;
    use crate::subject_index::{ModalityId, StandardNaming};
    use crate::volume::{Geometry, VolumeHeader};
    use ndarray::Array3;
    use tempfile::TempDir;

    fn staged(root: &Path) -> PathBuf {
        let staging = root.join("staging");
        let volume = Volume::new(
            Array3::from_shape_fn((2, 2, 3), |(z, y, x)| (x + y + z) as f32),
            Geometry {
                spacing: [0.5, 0.5, 4.0],
                ..Geometry::default()
            },
            VolumeHeader::default(),
        );
        for modality in ["ct", "mr_T1"] {
            let dir = staging.join("patient_001").join(modality);
            fs::create_dir_all(&dir).unwrap();
            MetaImageCodec
                .encode(&volume, &dir.join(format!("patient_001_{modality}.mhd")))
                .unwrap();
        }
        fs::create_dir_all(staging.join("patient_002/notes")).unwrap();
        fs::create_dir_all(staging.join("readme")).unwrap();
        staging
    }

    fn stage(workdir: &Path) -> ConvertStage {
        ConvertStage::new(
            Arc::new(MetaImageCodec),
            Arc::new(StandardNaming::default()),
            workdir,
        )
    }

    #[test]
    fn flattens_modality_folders() {
        let dir = TempDir::new().unwrap();
        let staging = staged(dir.path());
        let workdir = dir.path().join("work");

        let reports = stage(&workdir).run(&staging, &Deadline::none()).unwrap();
        assert_eq!(reports.len(), 1);
        let modalities: Vec<_> = reports[0].outputs().iter().map(|o| o.modality.clone()).collect();
        assert_eq!(modalities, [ModalityId::new("ct"), ModalityId::new("mr_t1")]);
        assert!(matches!(reports[0].outcome, StageOutcome::Done { .. }));

        let converted = MetaImageCodec
            .decode(&workdir.join("patient_001_mr_t1.mha"))
            .unwrap();
        assert_eq!(converted.geometry.spacing, [0.5, 0.5, 4.0]);
        assert_eq!(converted.data[[1, 1, 2]], 4.0);
    }

    #[test]
    fn second_run_is_already_done() {
        let dir = TempDir::new().unwrap();
        let staging = staged(dir.path());
        let workdir = dir.path().join("work");
        let stage = stage(&workdir);

        stage.run(&staging, &Deadline::none()).unwrap();
        let before = fs::metadata(workdir.join("patient_001_ct.mha"))
            .unwrap()
            .modified()
            .unwrap();
        let reports = stage.run(&staging, &Deadline::none()).unwrap();
        assert!(matches!(reports[0].outcome, StageOutcome::AlreadyDone { .. }));
        assert_eq!(
            fs::metadata(workdir.join("patient_001_ct.mha"))
                .unwrap()
                .modified()
                .unwrap(),
            before
        );
    }

    #[test]
    fn broken_series_fails_the_subject() {
        let dir = TempDir::new().unwrap();
        let staging = dir.path().join("staging");
        let series = staging.join("patient_003").join("ct");
        fs::create_dir_all(&series).unwrap();
        fs::write(series.join("0001.dcm"), b"not dicom").unwrap();

        let reports = stage(&dir.path().join("work"))
            .run(&staging, &Deadline::none())
            .unwrap();
        match &reports[0].outcome {
            StageOutcome::Failed(failure) => assert_eq!(failure.kind, FailureKind::Decode),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn metaimage_wins_over_dicom() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.dcm"), b"").unwrap();
        assert_eq!(
            find_source(dir.path(), "mha"),
            Some(Source::DicomSeries(dir.path().to_path_buf()))
        );
        fs::write(dir.path().join("b.mha"), b"").unwrap();
        assert_eq!(
            find_source(dir.path(), "mha"),
            Some(Source::MetaImage(dir.path().join("b.mha")))
        );
    }
}
