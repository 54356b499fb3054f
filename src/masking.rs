//! Background removal shared by a pair of co-located volumes.
//!
//! The mask is computed on the first volume of the pair, one slice at a
//! time along the through-plane axis, and applied to both volumes.

use crate::codec::VolumeCodec;
use crate::enums::StageKind;
use crate::pair_selector::PairStatus;
use crate::pipeline::{Deadline, OutputNaming, Stage, TimedOut};
use crate::report::{FailureKind, StageFailure, StageOutcome, StageReport};
use crate::subject_index::{ModalityId, VolumeRef};
use crate::threshold::{Thresholder, fill_holes};
use crate::volume::Volume;

use ndarray::{Array2, Array3, Axis, Zip};
use rayon::prelude::*;
use std::sync::Arc;

/// Foreground mask of `volume`, one slice per index of axis 0.
///
/// Constant slices carry no contrast and are left entirely background.
/// Every other slice is thresholded (`value > threshold`) and its enclosed
/// background pockets are filled.
pub fn compute_mask(
    volume: &Volume,
    thresholder: &dyn Thresholder,
    deadline: &Deadline,
) -> Result<Array3<bool>, TimedOut> {
    let data = volume.data();
    let (depth, height, width) = data.dim();

    let slices: Option<Vec<Array2<bool>>> = (0..depth)
        .into_par_iter()
        .map(|i| {
            if deadline.expired() {
                return None;
            }
            let slice = data.index_axis(Axis(0), i);
            let (min, max) = slice
                .iter()
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                    (lo.min(v), hi.max(v))
                });
            if min == max {
                return Some(Array2::from_elem((height, width), false));
            }

            let threshold = thresholder.compute_threshold(slice);
            let foreground = slice.mapv(|v| v > threshold);
            Some(fill_holes(foreground.view()))
        })
        .collect();
    let slices = slices.ok_or(TimedOut)?;

    let mut mask = Array3::from_elem((depth, height, width), false);
    for (mut target, slice) in mask.outer_iter_mut().zip(&slices) {
        target.assign(slice);
    }
    Ok(mask)
}

/// Replace every voxel outside `mask` with the volume's own minimum.
///
/// The floor is taken before masking, so it is the minimum of the
/// original intensities.
pub fn apply_mask(volume: &mut Volume, mask: &Array3<bool>) {
    let floor = volume.min_value();
    Zip::from(volume.data_mut())
        .and(mask)
        .par_for_each(|value, &keep| {
            if !keep {
                *value = floor;
            }
        });
}

pub struct MaskingStage {
    source: ModalityId,
    target: ModalityId,
    thresholder: Arc<dyn Thresholder>,
    codec: Arc<dyn VolumeCodec>,
    output: OutputNaming,
}

impl MaskingStage {
    /// `source` is the modality the mask is computed on, `target` the one it
    /// is copied to.
    pub fn new(
        source: ModalityId,
        target: ModalityId,
        thresholder: Arc<dyn Thresholder>,
        codec: Arc<dyn VolumeCodec>,
        output: OutputNaming,
    ) -> Self {
        Self {
            source,
            target,
            thresholder,
            codec,
            output,
        }
    }

    fn mask_pair(
        &self,
        inputs: [&VolumeRef; 2],
        outputs: &[VolumeRef],
        deadline: &Deadline,
    ) -> Result<(), StageFailure> {
        let mut source = self.codec.decode(&inputs[0].path)?;
        let mut target = self.codec.decode(&inputs[1].path)?;
        if source.dim() != target.dim() {
            return Err(StageFailure::new(
                FailureKind::ShapeMismatch,
                format!(
                    "{} is {:?} but {} is {:?}",
                    inputs[0].modality,
                    source.dim(),
                    inputs[1].modality,
                    target.dim()
                ),
            ));
        }

        let mask = compute_mask(&source, self.thresholder.as_ref(), deadline)?;
        let kept = mask.iter().filter(|&&v| v).count();
        log::debug!(
            "{}: mask keeps {kept} of {} voxels",
            inputs[0].subject,
            mask.len()
        );

        apply_mask(&mut source, &mask);
        apply_mask(&mut target, &mask);
        deadline.check()?;

        self.codec.encode(&source, &outputs[0].path)?;
        self.codec.encode(&target, &outputs[1].path)?;
        Ok(())
    }
}

impl Stage for MaskingStage {
    fn kind(&self) -> StageKind {
        StageKind::Mask
    }

    fn roles(&self) -> (&ModalityId, &ModalityId) {
        (&self.source, &self.target)
    }

    fn process(&self, pair: &PairStatus, deadline: &Deadline) -> StageReport {
        let subject = pair.subject().clone();
        let (source, target) = match pair {
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

        let outputs = vec![
            self.output.output_for(source),
            self.output.output_for(target),
        ];
        let done = self.output.is_done(source, &outputs[0])
            && self.output.is_done(target, &outputs[1]);
        if done {
            return StageReport::new(self.kind(), subject, StageOutcome::AlreadyDone { outputs });
        }

        let outcome = match self.mask_pair([source, target], &outputs, deadline) {
            Ok(()) => StageOutcome::Done { outputs },
            Err(failure) => StageOutcome::Failed(failure),
        };
        StageReport::new(self.kind(), subject, outcome)
    }
}
