use crate::subject_index::{ModalityId, ModalityMap, SubjectId, SubjectIndex, VolumeRef};

use serde::Serialize;

/// Whether a subject has both volumes a stage works on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PairStatus {
    Complete {
        a: VolumeRef,
        b: VolumeRef,
    },
    Incomplete {
        subject: SubjectId,
        missing: Vec<ModalityId>,
    },
}

impl PairStatus {
    pub fn subject(&self) -> &SubjectId {
        match self {
            Self::Complete { a, .. } => &a.subject,
            Self::Incomplete { subject, .. } => subject,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }
}

/// Pair up `role_a` and `role_b` for one subject.
///
/// Missing roles are listed in role order.
pub fn select_pair(
    subject: &SubjectId,
    modalities: &ModalityMap,
    role_a: &ModalityId,
    role_b: &ModalityId,
) -> PairStatus {
    match (modalities.get(role_a), modalities.get(role_b)) {
        (Some(a), Some(b)) => PairStatus::Complete {
            a: a.clone(),
            b: b.clone(),
        },
        (a, b) => {
            let missing = [(a, role_a), (b, role_b)]
                .into_iter()
                .filter(|(found, _)| found.is_none())
                .map(|(_, role)| role.clone())
                .collect();
            PairStatus::Incomplete {
                subject: subject.clone(),
                missing,
            }
        }
    }
}

/// One [`PairStatus`] per subject of `index`, in index order.
///
/// The iterator holds no state besides its position; calling this again
/// starts over.
pub fn select_pairs<'a>(
    index: &'a SubjectIndex,
    role_a: &'a ModalityId,
    role_b: &'a ModalityId,
) -> impl Iterator<Item = PairStatus> + 'a {
    index.subjects().map(move |subject| {
        let empty = ModalityMap::new();
        let modalities = index.modalities(subject).unwrap_or(&empty);
        select_pair(subject, modalities, role_a, role_b)
    })
}
