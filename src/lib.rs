//! # Volume preparation library
//!
//! This crate turns a folder of per-subject medical volumes into a
//! co-registered, background-suppressed training set. Input files follow a
//! `<prefix>_<number>_<modality>.<ext>` naming scheme, e.g.
//! `patient_001_ct.mha` and `patient_001_mr_T1.mha`. They are grouped into a
//! [`SubjectIndex`] and processed pairwise:
//!  - Masking: a per-slice Li threshold computed on one modality removes the
//!    background of both (`p_001_ct_dn.mha`, `p_001_mr_t1_dn.mha`)
//!  - Registration: a rigid transform aligns a moving modality onto a fixed
//!    one and the moving volume is resampled onto the fixed grid
//!    (`p_001_mr_t1_dn_reg.mha`)
//!
//! Every stage skips work whose output already exists, so an interrupted
//! run picks up where it stopped. Subjects missing a modality are reported
//! and skipped. A failing subject never stops the others. If requested,
//! subjects are processed in parallel using rayon.
//!
//! Before indexing, archives can be unpacked into a staging tree
//! ([`fetch_subjects`]) and flattened into the work directory
//! ([`ConvertStage`]), from MetaImage files or DICOM series.
//!
//! Volumes are read and written through [`VolumeCodec`]; the default
//! [`MetaImageCodec`] handles `.mha` and `.mhd` files.
//!
//! # Examples
//!
//! ## Masking and registering every subject of a directory
//!
//! ```no_run
//! # use volume_prep::*;
//! # use std::path::Path;
//! # use std::sync::Arc;
//! let naming: Arc<dyn NamingConvention> = Arc::new(StandardNaming::default());
//! let codec: Arc<dyn VolumeCodec> = Arc::new(MetaImageCodec);
//! let mask = MaskingStage::new(
//!     ModalityId::new("mr_t1"),
//!     ModalityId::new("ct"),
//!     Arc::new(LiThresholder),
//!     codec.clone(),
//!     OutputNaming::new(naming.clone(), Some("dn".to_string())),
//! );
//! let register = RegistrationStage::new(
//!     ModalityId::new("ct_dn"),
//!     ModalityId::new("mr_t1_dn"),
//!     Arc::new(GradientDescentRegistrar),
//!     codec,
//!     OutputNaming::new(naming.clone(), Some("reg".to_string())),
//!     RegistrationConfig::default(),
//! );
//! let runner = PipelineRunner::new(
//!     vec![Box::new(mask), Box::new(register)],
//!     RunnerOptions::default(),
//! );
//! let reports = runner
//!     .run_directory(Path::new("data"), naming.as_ref(), DuplicatePolicy::Fail)
//!     .expect("should have indexed the data directory");
//! println!("{}", RunSummary::from_reports(&reports));
//! ```

pub mod codec;
pub mod convert;
pub mod enums;
pub mod fetch;
mod interpolator;
pub mod masking;
pub mod pair_selector;
pub mod pipeline;
pub mod registrar;
pub mod registration;
pub mod report;
pub mod resample;
pub mod subject_index;
pub mod threshold;
pub mod transform;
pub mod volume;
pub mod volume_loader;

pub use codec::{CodecError, MetaImageCodec, VolumeCodec};
pub use convert::ConvertStage;
pub use enums::{DuplicatePolicy, ElementType, Interpolation, Orientation, SortBy, StageKind};
pub use fetch::{ArchiveCatalog, FetchError, Fetcher, LocalArchiveFetcher, fetch_subjects};
pub use masking::MaskingStage;
pub use pair_selector::{PairStatus, select_pairs};
pub use pipeline::{Deadline, OutputNaming, PipelineRunner, RunnerOptions, SetupError, Stage};
pub use registrar::{
    GradientDescentRegistrar, RegistrationConfig, RegistrationError, Registrar, SimilarityMetric,
};
pub use registration::{FillValue, RegistrationStage};
pub use report::{RunSummary, StageOutcome, StageReport, SubjectReport};
pub use subject_index::{ModalityId, NamingConvention, StandardNaming, SubjectId, SubjectIndex};
pub use threshold::{LiThresholder, Thresholder};
pub use transform::RigidTransform;
pub use volume::Volume;
pub use volume_loader::VolumeLoader;
