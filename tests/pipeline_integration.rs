use ndarray::Array3;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use volume_prep::{
    Deadline, DuplicatePolicy, GradientDescentRegistrar, LiThresholder, MaskingStage,
    MetaImageCodec, ModalityId, NamingConvention, OutputNaming, PairStatus, PipelineRunner,
    RegistrationConfig, RegistrationError, RegistrationStage, Registrar, RigidTransform,
    RunSummary, RunnerOptions, SimilarityMetric, Stage, StageOutcome, StandardNaming, SubjectId,
    SubjectIndex, Volume, VolumeCodec, select_pairs,
    volume::{Geometry, VolumeHeader},
};

/// Keeps the centred starting transform
struct InitialRegistrar;

impl Registrar for InitialRegistrar {
    fn align(
        &self,
        _fixed: &Volume,
        _moving: &Volume,
        initial: &RigidTransform,
        _config: &RegistrationConfig,
        _deadline: &Deadline,
    ) -> Result<RigidTransform, RegistrationError> {
        Ok(*initial)
    }
}

/// Bright ball on a flat background, 8 slices of 16 x 16
fn phantom(background: f32, foreground: f32) -> Volume {
    let data = Array3::from_shape_fn((8, 16, 16), |(z, y, x)| {
        let d2 = (x as f32 - 7.5).powi(2) + (y as f32 - 7.5).powi(2) + (z as f32 - 3.5).powi(2);
        background + (foreground - background) * (-d2 / 18.0).exp()
    });
    Volume::new(
        data,
        Geometry {
            spacing: [1.0, 1.0, 2.0],
            ..Geometry::default()
        },
        VolumeHeader::default(),
    )
}

fn write_dataset(dir: &Path) {
    let codec = MetaImageCodec;
    codec
        .encode(&phantom(-1000.0, 400.0), &dir.join("p_001_ct.mha"))
        .unwrap();
    codec
        .encode(&phantom(0.0, 800.0), &dir.join("p_001_mr_T1.mha"))
        .unwrap();
    codec
        .encode(&phantom(-1000.0, 300.0), &dir.join("p_002_ct.mha"))
        .unwrap();
    fs::write(dir.join("notes.txt"), "not a volume").unwrap();
}

fn stages(registrar: Arc<dyn Registrar>, config: RegistrationConfig) -> Vec<Box<dyn Stage>> {
    let naming: Arc<dyn NamingConvention> = Arc::new(StandardNaming::default());
    let codec: Arc<dyn VolumeCodec> = Arc::new(MetaImageCodec);
    vec![
        Box::new(MaskingStage::new(
            ModalityId::new("mr_t1"),
            ModalityId::new("ct"),
            Arc::new(LiThresholder),
            codec.clone(),
            OutputNaming::new(naming.clone(), Some("dn".to_string())),
        )),
        Box::new(RegistrationStage::new(
            ModalityId::new("ct_dn"),
            ModalityId::new("mr_t1_dn"),
            registrar,
            codec,
            OutputNaming::new(naming, Some("reg".to_string())),
            config,
        )),
    ]
}

#[test]
fn pairs_follow_the_index() {
    let dir = TempDir::new().unwrap();
    write_dataset(dir.path());

    let index = SubjectIndex::scan(
        dir.path(),
        &StandardNaming::default(),
        DuplicatePolicy::Fail,
    )
    .unwrap();
    let (ct, mr) = (ModalityId::new("ct"), ModalityId::new("mr_T1"));
    let pairs: Vec<PairStatus> = select_pairs(&index, &ct, &mr).collect();

    assert_eq!(pairs.len(), 2);
    match &pairs[0] {
        PairStatus::Complete { a, b } => {
            assert_eq!(a.subject, SubjectId::new("p_001"));
            assert_eq!(a.path, dir.path().join("p_001_ct.mha"));
            assert_eq!(b.path, dir.path().join("p_001_mr_T1.mha"));
        }
        other => panic!("expected a complete pair, got {other:?}"),
    }
    assert_eq!(
        pairs[1],
        PairStatus::Incomplete {
            subject: SubjectId::new("p_002"),
            missing: vec![ModalityId::new("mr_t1")],
        }
    );
}

#[test]
fn full_pipeline_only_touches_complete_subjects_and_resumes() {
    let dir = TempDir::new().unwrap();
    write_dataset(dir.path());
    let naming = StandardNaming::default();

    let runner = PipelineRunner::new(
        stages(Arc::new(InitialRegistrar), RegistrationConfig::default()),
        RunnerOptions {
            jobs: Some(2),
            subject_timeout: None,
        },
    );
    let reports = runner
        .run_directory(dir.path(), &naming, DuplicatePolicy::Fail)
        .unwrap();

    assert_eq!(reports.len(), 2);
    assert!(
        reports[0]
            .stages
            .iter()
            .all(|s| matches!(s.outcome, StageOutcome::Done { .. })),
        "{}",
        reports[0]
    );
    assert_eq!(
        reports[1].to_string(),
        "p_002:\n-> incomplete (missing mr_t1)\n-> incomplete (missing ct_dn, mr_t1_dn)"
    );

    for name in ["p_001_ct_dn.mha", "p_001_mr_t1_dn.mha", "p_001_mr_t1_dn_reg.mha"] {
        assert!(dir.path().join(name).is_file(), "missing {name}");
    }
    let p002_outputs = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            name.starts_with("p_002") && name != "p_002_ct.mha"
        })
        .count();
    assert_eq!(p002_outputs, 0);

    // Masked background takes each volume's own minimum
    let ct = MetaImageCodec
        .decode(&dir.path().join("p_001_ct_dn.mha"))
        .unwrap();
    let original = MetaImageCodec
        .decode(&dir.path().join("p_001_ct.mha"))
        .unwrap();
    assert_eq!(ct.data[[0, 0, 0]], original.min_value());
    assert_eq!(ct.data[[3, 7, 7]], original.data[[3, 7, 7]]);

    // Registered volume lives on the fixed grid
    let registered = MetaImageCodec
        .decode(&dir.path().join("p_001_mr_t1_dn_reg.mha"))
        .unwrap();
    assert_eq!(registered.dim(), ct.dim());
    assert_eq!(registered.geometry, ct.geometry);

    let again = runner
        .run_directory(dir.path(), &naming, DuplicatePolicy::Fail)
        .unwrap();
    let summary = RunSummary::from_reports(&again);
    assert_eq!(summary.done, 0);
    assert_eq!(summary.already_done, 2);
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.failed, 0);

    let json = serde_json::to_value(&again).unwrap();
    assert_eq!(json[0]["stages"][1]["outcome"], "already_done");
    assert_eq!(json[1]["stages"][0]["missing"][0], "mr_t1");
}

#[test]
fn in_place_masking_overwrites_mixed_case_inputs_and_reruns() {
    let dir = TempDir::new().unwrap();
    write_dataset(dir.path());
    let naming = StandardNaming::default();
    let runner = PipelineRunner::new(
        vec![Box::new(MaskingStage::new(
            ModalityId::new("mr_t1"),
            ModalityId::new("ct"),
            Arc::new(LiThresholder),
            Arc::new(MetaImageCodec),
            OutputNaming::new(Arc::new(StandardNaming::default()), None),
        ))],
        RunnerOptions::default(),
    );

    let list = || {
        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    };
    let before = list();

    for _ in 0..2 {
        let reports = runner
            .run_directory(dir.path(), &naming, DuplicatePolicy::Fail)
            .unwrap();
        assert!(
            matches!(reports[0].stages[0].outcome, StageOutcome::Done { .. }),
            "{}",
            reports[0]
        );
        assert_eq!(list(), before);
    }
    assert!(dir.path().join("p_001_mr_T1.mha").is_file());
}

#[test]
fn gradient_descent_registrar_runs_end_to_end() {
    let dir = TempDir::new().unwrap();
    write_dataset(dir.path());

    let config = RegistrationConfig {
        metric: SimilarityMetric::MeanSquares,
        sampling_fraction: 1.0,
        max_iterations: 20,
        shrink_factors: vec![2, 1],
        smoothing_sigmas: vec![1.0, 0.0],
        ..RegistrationConfig::default()
    };
    let runner = PipelineRunner::new(
        stages(Arc::new(GradientDescentRegistrar), config),
        RunnerOptions::default(),
    );
    let reports = runner
        .run_directory(dir.path(), &StandardNaming::default(), DuplicatePolicy::Fail)
        .unwrap();

    assert!(!reports[0].has_failures(), "{}", reports[0]);
    assert!(dir.path().join("p_001_mr_t1_dn_reg.mha").is_file());
}

#[test]
fn subject_timeout_is_reported_per_subject() {
    let dir = TempDir::new().unwrap();
    write_dataset(dir.path());

    let runner = PipelineRunner::new(
        stages(Arc::new(InitialRegistrar), RegistrationConfig::default()),
        RunnerOptions {
            jobs: None,
            subject_timeout: Some(std::time::Duration::ZERO),
        },
    );
    let reports = runner
        .run_directory(dir.path(), &StandardNaming::default(), DuplicatePolicy::Fail)
        .unwrap();

    match &reports[0].stages[0].outcome {
        StageOutcome::Failed(failure) => {
            assert_eq!(failure.kind, volume_prep::report::FailureKind::Timeout)
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert!(!dir.path().join("p_001_ct_dn.mha").exists());
    assert!(matches!(
        reports[1].stages[0].outcome,
        StageOutcome::Skipped { .. }
    ));
}

#[test]
fn duplicate_modalities_stop_the_run() {
    let dir = TempDir::new().unwrap();
    write_dataset(dir.path());
    fs::copy(
        dir.path().join("p_001_ct.mha"),
        dir.path().join("P_001_CT.mha"),
    )
    .unwrap();

    let runner = PipelineRunner::new(
        stages(Arc::new(InitialRegistrar), RegistrationConfig::default()),
        RunnerOptions::default(),
    );
    let naming = StandardNaming::default();
    assert!(
        runner
            .run_directory(dir.path(), &naming, DuplicatePolicy::Fail)
            .is_err()
    );
    let reports = runner
        .run_directory(dir.path(), &naming, DuplicatePolicy::KeepFirst)
        .unwrap();
    assert_eq!(reports.len(), 2);
}
