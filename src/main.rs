use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use volume_prep::{
    ArchiveCatalog, ConvertStage, Deadline, DuplicatePolicy, ElementType, GradientDescentRegistrar,
    LiThresholder, LocalArchiveFetcher, MaskingStage, MetaImageCodec, ModalityId,
    NamingConvention, Orientation, OutputNaming, PipelineRunner, RegistrationConfig,
    RegistrationStage, RunSummary, RunnerOptions, Stage, StandardNaming, SubjectReport,
    VolumeCodec, fetch::DEFAULT_ARCHIVES, fetch_subjects,
};

#[derive(Parser)]
#[command(name = "volume-prep")]
#[command(
    about = "Prepare paired CT/MR volumes: fetch, convert, mask and register",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Subjects processed in parallel (0 = all cores); sequential when absent
    #[arg(short = 'j', long, value_name = "INT", global = true)]
    jobs: Option<usize>,

    /// Wall-clock budget per subject
    #[arg(long, value_name = "SECS", global = true)]
    timeout_secs: Option<u64>,

    /// Write the structured per-subject report to this JSON file
    #[arg(long, value_name = "JSON", global = true)]
    report: Option<PathBuf>,

    /// What to do when two files map to the same subject and modality
    #[arg(long, value_enum, default_value = "fail", global = true)]
    on_duplicate: DuplicateArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Unpack per-subject archives listed in a catalog into a staging tree
    Fetch {
        /// JSON catalog: subject -> archive name -> resource
        #[arg(value_name = "CATALOG.JSON")]
        catalog: PathBuf,

        /// Directory resources are resolved against
        #[arg(long, value_name = "DIR")]
        archives_dir: PathBuf,

        /// Staging directory receiving one folder per subject
        #[arg(long, value_name = "DIR", default_value = "staging")]
        staging: PathBuf,

        /// Archive to fetch per subject (repeatable; default ct and mr_T1)
        #[arg(long = "archive", value_name = "NAME")]
        archives: Vec<String>,

        /// Confirm the dataset licence agreement has been read and accepted
        #[arg(long)]
        accept_license: bool,
    },

    /// Flatten a staging tree into <WORKDIR>/<subject>_<modality>.mha
    Convert {
        #[arg(value_name = "STAGING")]
        staging: PathBuf,

        #[arg(value_name = "WORKDIR")]
        workdir: PathBuf,
    },

    /// Remove the background of a modality pair
    Mask {
        #[arg(value_name = "WORKDIR")]
        workdir: PathBuf,

        /// Modality the mask is computed on
        #[arg(long, default_value = "mr_t1")]
        source: String,

        /// Modality the mask is also applied to
        #[arg(long, default_value = "ct")]
        target: String,

        /// Appended to output names; empty overwrites the inputs
        #[arg(long, default_value = "dn")]
        postfix: String,
    },

    /// Rigidly align a moving modality onto a fixed one
    Register {
        #[arg(value_name = "WORKDIR")]
        workdir: PathBuf,

        #[arg(long, default_value = "ct")]
        fixed: String,

        #[arg(long, default_value = "mr_t1")]
        moving: String,

        /// Appended to output names; empty overwrites the inputs
        #[arg(long, default_value = "reg")]
        postfix: String,

        #[command(flatten)]
        registration: RegistrationArgs,
    },

    /// Mask, then register the masked volumes
    Run {
        #[arg(value_name = "WORKDIR")]
        workdir: PathBuf,

        #[arg(long, default_value = "mr_t1")]
        source: String,

        #[arg(long, default_value = "ct")]
        target: String,

        #[arg(long, default_value = "dn")]
        mask_postfix: String,

        /// Fixed modality before masking
        #[arg(long, default_value = "ct")]
        fixed: String,

        /// Moving modality before masking
        #[arg(long, default_value = "mr_t1")]
        moving: String,

        #[arg(long, default_value = "reg")]
        register_postfix: String,

        #[command(flatten)]
        registration: RegistrationArgs,
    },

    /// Render one slice of a volume to an 8-bit PNG
    Preview {
        #[arg(value_name = "VOLUME")]
        volume: PathBuf,

        #[arg(value_name = "OUT.PNG")]
        output: PathBuf,

        #[arg(long, value_enum, default_value = "axial")]
        orientation: OrientationArg,

        /// Slice index (default: centre slice)
        #[arg(long, value_name = "INT")]
        index: Option<usize>,
    },
}

#[derive(clap::Args)]
struct RegistrationArgs {
    /// Registration settings as JSON; unspecified fields keep their defaults
    #[arg(long, value_name = "JSON")]
    config: Option<PathBuf>,

    /// Storage type of registered volumes, or `none` to keep the input's
    #[arg(long, value_name = "TYPE", default_value = "short", value_parser = parse_cast)]
    cast: Cast,
}

#[derive(Clone, Copy)]
struct Cast(Option<ElementType>);

fn parse_cast(value: &str) -> Result<Cast, String> {
    let element_type = match value.to_ascii_lowercase().as_str() {
        "none" => return Ok(Cast(None)),
        "uchar" => ElementType::UChar,
        "char" => ElementType::Char,
        "ushort" => ElementType::UShort,
        "short" => ElementType::Short,
        "float" => ElementType::Float,
        other => return Err(format!("unknown element type {other:?}")),
    };
    Ok(Cast(Some(element_type)))
}

#[derive(Clone, Copy, ValueEnum)]
enum DuplicateArg {
    Fail,
    KeepFirst,
}

impl From<DuplicateArg> for DuplicatePolicy {
    fn from(arg: DuplicateArg) -> Self {
        match arg {
            DuplicateArg::Fail => Self::Fail,
            DuplicateArg::KeepFirst => Self::KeepFirst,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum OrientationArg {
    Axial,
    Coronal,
    Sagittal,
}

impl From<OrientationArg> for Orientation {
    fn from(arg: OrientationArg) -> Self {
        match arg {
            OrientationArg::Axial => Self::Axial,
            OrientationArg::Coronal => Self::Coronal,
            OrientationArg::Sagittal => Self::Sagittal,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp(None)
        .format_target(false)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let naming: Arc<dyn NamingConvention> = Arc::new(StandardNaming::default());
    let codec: Arc<dyn VolumeCodec> = Arc::new(MetaImageCodec);
    let options = RunnerOptions {
        jobs: cli.jobs.map(|jobs| {
            if jobs == 0 {
                std::thread::available_parallelism().map_or(1, |n| n.get())
            } else {
                jobs
            }
        }),
        subject_timeout: cli.timeout_secs.map(Duration::from_secs),
    };
    let policy = DuplicatePolicy::from(cli.on_duplicate);

    match cli.command {
        Commands::Fetch {
            catalog,
            archives_dir,
            staging,
            archives,
            accept_license,
        } => {
            let catalog = ArchiveCatalog::from_json_file(&catalog)
                .with_context(|| format!("Failed to read catalog {}", catalog.display()))?;
            let fetcher = LocalArchiveFetcher::new(archives_dir);
            let archives: Vec<String> = if archives.is_empty() {
                DEFAULT_ARCHIVES.iter().map(|a| a.to_string()).collect()
            } else {
                archives
            };
            let records = fetch_subjects(&catalog, &fetcher, &staging, &archives, accept_license)?;
            write_report(cli.report.as_deref(), &records)?;
        }

        Commands::Convert { staging, workdir } => {
            if !staging.is_dir() {
                bail!("Staging directory {} does not exist", staging.display());
            }
            let stage = ConvertStage::new(codec, naming, workdir);
            let deadline = options
                .subject_timeout
                .map_or_else(Deadline::none, Deadline::after);
            let reports: Vec<SubjectReport> = stage
                .run(&staging, &deadline)
                .with_context(|| format!("Failed to convert {}", staging.display()))?
                .into_iter()
                .map(|report| SubjectReport {
                    subject: report.subject.clone(),
                    stages: vec![report],
                })
                .collect();
            finish(cli.report.as_deref(), &reports)?;
        }

        Commands::Mask {
            workdir,
            source,
            target,
            postfix,
        } => {
            let stages: Vec<Box<dyn Stage>> = vec![Box::new(MaskingStage::new(
                ModalityId::new(&source),
                ModalityId::new(&target),
                Arc::new(LiThresholder),
                codec,
                OutputNaming::new(naming.clone(), non_empty(postfix)),
            ))];
            let runner = PipelineRunner::new(stages, options);
            let reports = runner.run_directory(&workdir, naming.as_ref(), policy)?;
            finish(cli.report.as_deref(), &reports)?;
        }

        Commands::Register {
            workdir,
            fixed,
            moving,
            postfix,
            registration,
        } => {
            let stage = registration_stage(
                ModalityId::new(&fixed),
                ModalityId::new(&moving),
                &registration,
                codec,
                OutputNaming::new(naming.clone(), non_empty(postfix)),
            )?;
            let runner = PipelineRunner::new(vec![Box::new(stage)], options);
            let reports = runner.run_directory(&workdir, naming.as_ref(), policy)?;
            finish(cli.report.as_deref(), &reports)?;
        }

        Commands::Run {
            workdir,
            source,
            target,
            mask_postfix,
            fixed,
            moving,
            register_postfix,
            registration,
        } => {
            let (source, target) = (ModalityId::new(&source), ModalityId::new(&target));
            let mask_postfix = non_empty(mask_postfix);
            // Register whatever masking produced for the chosen modalities
            let after_mask = |modality: ModalityId| {
                if modality == source || modality == target {
                    modality.with_postfix(mask_postfix.as_deref())
                } else {
                    modality
                }
            };
            let fixed = after_mask(ModalityId::new(&fixed));
            let moving = after_mask(ModalityId::new(&moving));

            let mask = MaskingStage::new(
                source.clone(),
                target.clone(),
                Arc::new(LiThresholder),
                codec.clone(),
                OutputNaming::new(naming.clone(), mask_postfix.clone()),
            );
            let register = registration_stage(
                fixed,
                moving,
                &registration,
                codec,
                OutputNaming::new(naming.clone(), non_empty(register_postfix)),
            )?;
            let runner = PipelineRunner::new(vec![Box::new(mask), Box::new(register)], options);
            let reports = runner.run_directory(&workdir, naming.as_ref(), policy)?;
            finish(cli.report.as_deref(), &reports)?;
        }

        Commands::Preview {
            volume,
            output,
            orientation,
            index,
        } => preview(codec.as_ref(), &volume, &output, orientation.into(), index)?,
    }

    Ok(())
}

fn non_empty(postfix: String) -> Option<String> {
    (!postfix.is_empty()).then_some(postfix)
}

fn registration_stage(
    fixed: ModalityId,
    moving: ModalityId,
    args: &RegistrationArgs,
    codec: Arc<dyn VolumeCodec>,
    output: OutputNaming,
) -> Result<RegistrationStage> {
    let config = match &args.config {
        Some(path) => RegistrationConfig::from_json_file(path)
            .with_context(|| format!("Failed to load registration config {}", path.display()))?,
        None => RegistrationConfig::default(),
    };
    log::debug!("Registration config: {config:?}");

    Ok(RegistrationStage::new(
        fixed,
        moving,
        Arc::new(GradientDescentRegistrar),
        codec,
        output,
        config,
    )
    .with_cast(args.cast.0))
}

fn finish(report: Option<&Path>, reports: &[SubjectReport]) -> Result<()> {
    log::info!("{}", RunSummary::from_reports(reports));
    write_report(report, reports)
}

fn write_report<T: Serialize + ?Sized>(path: Option<&Path>, value: &T) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let file = File::create(path)
        .with_context(|| format!("Failed to create report {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)
        .with_context(|| format!("Failed to write report {}", path.display()))?;
    Ok(())
}

fn preview(
    codec: &dyn VolumeCodec,
    path: &Path,
    output: &Path,
    orientation: Orientation,
    index: Option<usize>,
) -> Result<()> {
    let volume = codec.decode(path)?;
    let (depth, height, width) = volume.dim();
    let extent = match orientation {
        Orientation::Axial => depth,
        Orientation::Coronal => height,
        Orientation::Sagittal => width,
    };
    let index = index.unwrap_or(extent / 2);
    let image = volume
        .get_image_from_axis(index, orientation)
        .with_context(|| format!("Slice {index} is outside 0..{extent}"))?;
    image
        .save(output)
        .with_context(|| format!("Failed to save {}", output.display()))?;
    log::info!("Wrote {orientation:?} slice {index} to {}", output.display());
    Ok(())
}
