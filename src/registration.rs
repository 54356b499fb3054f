//! Rigid alignment of a moving modality onto a fixed one.

use crate::codec::VolumeCodec;
use crate::enums::{ElementType, Interpolation, StageKind};
use crate::pair_selector::PairStatus;
use crate::pipeline::{Deadline, OutputNaming, Stage};
use crate::registrar::{RegistrationConfig, RegistrationError, Registrar};
use crate::report::{FailureKind, StageFailure, StageOutcome, StageReport};
use crate::resample::resample;
use crate::subject_index::{ModalityId, VolumeRef};
use crate::transform::RigidTransform;

use std::sync::Arc;

impl From<RegistrationError> for StageFailure {
    fn from(err: RegistrationError) -> Self {
        let kind = match err {
            RegistrationError::Timeout(_) => FailureKind::Timeout,
            RegistrationError::NonConvergence { .. }
            | RegistrationError::InsufficientOverlap { .. }
            | RegistrationError::Config(_) => FailureKind::Registration,
        };
        Self::new(kind, err)
    }
}

/// Value given to output voxels with no counterpart in the moving volume
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FillValue {
    MovingMinimum,
    Constant(f32),
}

pub struct RegistrationStage {
    fixed: ModalityId,
    moving: ModalityId,
    registrar: Arc<dyn Registrar>,
    codec: Arc<dyn VolumeCodec>,
    output: OutputNaming,
    config: RegistrationConfig,
    interpolation: Interpolation,
    fill: FillValue,
    cast: Option<ElementType>,
}

impl RegistrationStage {
    /// Resamples linearly, fills with the moving minimum and stores 16-bit
    /// integers unless configured otherwise.
    pub fn new(
        fixed: ModalityId,
        moving: ModalityId,
        registrar: Arc<dyn Registrar>,
        codec: Arc<dyn VolumeCodec>,
        output: OutputNaming,
        config: RegistrationConfig,
    ) -> Self {
        Self {
            fixed,
            moving,
            registrar,
            codec,
            output,
            config,
            interpolation: Interpolation::Linear,
            fill: FillValue::MovingMinimum,
            cast: Some(ElementType::Short),
        }
    }

    pub fn with_interpolation(mut self, interpolation: Interpolation) -> Self {
        self.interpolation = interpolation;
        self
    }

    pub fn with_fill(mut self, fill: FillValue) -> Self {
        self.fill = fill;
        self
    }

    /// `None` keeps the moving volume's own element type
    pub fn with_cast(mut self, cast: Option<ElementType>) -> Self {
        self.cast = cast;
        self
    }

    fn register(
        &self,
        fixed_ref: &VolumeRef,
        moving_ref: &VolumeRef,
        output: &VolumeRef,
        deadline: &Deadline,
    ) -> Result<(), StageFailure> {
        let fixed = self.codec.decode(&fixed_ref.path)?;
        let moving = self.codec.decode(&moving_ref.path)?;

        let initial = RigidTransform::centered(&fixed, &moving);
        let transform = self
            .registrar
            .align(&fixed, &moving, &initial, &self.config, deadline)?;
        log::debug!(
            "{}: angles {:?} rad, translation {:?} mm",
            fixed_ref.subject,
            transform.angles,
            transform.translation
        );

        let fill = match self.fill {
            FillValue::MovingMinimum => moving.min_value(),
            FillValue::Constant(value) => value,
        };
        let mut registered = resample(&moving, &fixed, &transform, self.interpolation, fill);
        if let Some(element_type) = self.cast {
            registered.cast_to(element_type);
        }
        deadline.check()?;

        self.codec.encode(&registered, &output.path)?;
        Ok(())
    }
}

impl Stage for RegistrationStage {
    fn kind(&self) -> StageKind {
        StageKind::Register
    }

    fn roles(&self) -> (&ModalityId, &ModalityId) {
        (&self.fixed, &self.moving)
    }

    fn process(&self, pair: &PairStatus, deadline: &Deadline) -> StageReport {
        let subject = pair.subject().clone();
        let (fixed, moving) = match pair {
            PairStatus::Incomplete { missing, .. } => {
                return StageReport::new(
                    self.kind(),
                    subject,
                    StageOutcome::Skipped {
                        missing: missing.clone(),
                    },
                );
            }
            PairStatus::Complete { a, b } => (a, b),
        };

        let output = self.output.output_for(moving);
        if self.output.is_done(moving, &output) {
            return StageReport::new(
                self.kind(),
                subject,
                StageOutcome::AlreadyDone {
                    outputs: vec![output],
                },
            );
        }

        let outcome = match self.register(fixed, moving, &output, deadline) {
            Ok(()) => StageOutcome::Done {
                outputs: vec![output],
            },
            Err(failure) => StageOutcome::Failed(failure),
        };
        StageReport::new(self.kind(), subject, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MetaImageCodec;
    use crate::subject_index::{StandardNaming, SubjectId};
    use crate::volume::{Geometry, Volume, VolumeHeader};
    use ndarray::Array3;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Returns a fixed transform and counts how often it was asked.
    struct FixedRegistrar {
        transform: Option<RigidTransform>,
        calls: AtomicUsize,
    }

    impl FixedRegistrar {
        fn new(transform: Option<RigidTransform>) -> Self {
            Self {
                transform,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Registrar for FixedRegistrar {
        fn align(
            &self,
            _fixed: &Volume,
            _moving: &Volume,
            initial: &RigidTransform,
            _config: &RegistrationConfig,
            _deadline: &Deadline,
        ) -> Result<RigidTransform, RegistrationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.transform
                .ok_or(RegistrationError::InsufficientOverlap { valid: 0, total: 10 })
                .map(|t| RigidTransform {
                    center: initial.center,
                    ..t
                })
        }
    }

    fn write_pair(dir: &Path) -> PairStatus {
        let codec = MetaImageCodec;
        let fixed = Volume::new(
            Array3::from_elem((2, 3, 4), -1000.0),
            Geometry::default(),
            VolumeHeader::default(),
        );
        let moving = Volume::new(
            Array3::from_shape_fn((2, 3, 4), |(z, y, x)| (x + 10 * y + 100 * z) as f32 + 0.4),
            Geometry::default(),
            VolumeHeader {
                element_type: ElementType::Float,
                ..VolumeHeader::default()
            },
        );

        let mut refs = Vec::new();
        for (modality, volume) in [("ct", &fixed), ("mr_t1_dn", &moving)] {
            let path = dir.join(format!("p_001_{modality}.mha"));
            codec.encode(volume, &path).unwrap();
            refs.push(VolumeRef {
                subject: SubjectId::new("p_001"),
                modality: ModalityId::new(modality),
                path,
            });
        }
        let b = refs.pop().unwrap();
        let a = refs.pop().unwrap();
        PairStatus::Complete { a, b }
    }

    fn stage(registrar: Arc<FixedRegistrar>) -> RegistrationStage {
        RegistrationStage::new(
            ModalityId::new("ct"),
            ModalityId::new("mr_t1_dn"),
            registrar,
            Arc::new(MetaImageCodec),
            OutputNaming::new(Arc::new(StandardNaming::default()), Some("reg".to_string())),
            RegistrationConfig::default(),
        )
    }

    #[test]
    fn registers_once_then_reports_already_done() {
        let dir = TempDir::new().unwrap();
        let pair = write_pair(dir.path());
        let registrar = Arc::new(FixedRegistrar::new(Some(RigidTransform {
            translation: [1.0, 0.0, 0.0],
            ..RigidTransform::default()
        })));
        let stage = stage(registrar.clone());

        let first = stage.process(&pair, &Deadline::none());
        assert!(matches!(first.outcome, StageOutcome::Done { .. }));
        let output = &first.outputs()[0];
        assert_eq!(output.modality, ModalityId::new("mr_t1_dn_reg"));
        assert_eq!(output.path, dir.path().join("p_001_mr_t1_dn_reg.mha"));

        let registered = MetaImageCodec.decode(&output.path).unwrap();
        assert_eq!(registered.header.element_type, ElementType::Short);
        assert_eq!(registered.dim(), (2, 3, 4));
        // Shifted by one voxel along x, rounded to integers
        assert_eq!(registered.data[[1, 2, 0]], 121.0);
        // Last column has no source and takes the moving minimum, rounded
        assert_eq!(registered.data[[1, 2, 3]], 0.0);

        let second = stage.process(&pair, &Deadline::none());
        assert!(matches!(second.outcome, StageOutcome::AlreadyDone { .. }));
        assert_eq!(second.outputs(), first.outputs());
        assert_eq!(registrar.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registrar_errors_fail_without_output() {
        let dir = TempDir::new().unwrap();
        let pair = write_pair(dir.path());
        let report = stage(Arc::new(FixedRegistrar::new(None))).process(&pair, &Deadline::none());

        match report.outcome {
            StageOutcome::Failed(failure) => assert_eq!(failure.kind, FailureKind::Registration),
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(!dir.path().join("p_001_mr_t1_dn_reg.mha").exists());
    }

    #[test]
    fn constant_fill_without_cast_keeps_floats() {
        let dir = TempDir::new().unwrap();
        let pair = write_pair(dir.path());
        let registrar = Arc::new(FixedRegistrar::new(Some(RigidTransform {
            translation: [1.0, 0.0, 0.0],
            ..RigidTransform::default()
        })));
        let report = stage(registrar)
            .with_fill(FillValue::Constant(-7.5))
            .with_cast(None)
            .with_interpolation(Interpolation::NearestNeighbor)
            .process(&pair, &Deadline::none());

        let registered = MetaImageCodec.decode(&report.outputs()[0].path).unwrap();
        assert_eq!(registered.header.element_type, ElementType::Float);
        assert!((registered.data[[0, 0, 0]] - 1.4).abs() < 1e-6);
        assert_eq!(registered.data[[0, 0, 3]], -7.5);
    }

    #[test]
    fn missing_moving_volume_is_skipped() {
        let pair = PairStatus::Incomplete {
            subject: SubjectId::new("p_002"),
            missing: vec![ModalityId::new("mr_t1_dn")],
        };
        let registrar = Arc::new(FixedRegistrar::new(None));
        let report = stage(registrar.clone()).process(&pair, &Deadline::none());
        assert_eq!(
            report.to_string(),
            "-> incomplete (missing mr_t1_dn)"
        );
        assert_eq!(registrar.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn registration_failures_map_to_kinds() {
        let timeout: StageFailure = RegistrationError::Timeout(crate::pipeline::TimedOut).into();
        assert_eq!(timeout.kind, FailureKind::Timeout);
        let stalled: StageFailure = RegistrationError::NonConvergence {
            iterations: 200,
            metric: -0.4,
        }
        .into();
        assert_eq!(stalled.kind, FailureKind::Registration);
        let invalid: StageFailure = RegistrationError::Config(
            crate::registrar::ConfigError::Invalid("empty schedule".to_string()),
        )
        .into();
        assert_eq!(invalid.kind, FailureKind::Registration);
    }
}
