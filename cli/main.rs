#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;

use noduscope::config::RunConfig;
use noduscope::files::PatientSource;
use noduscope::pipeline::{FeaturePipeline, PipelineError, ScoringProgressObserver};

const DEFAULT_OUTPUT_NAME: &str = "weighted_ensemble_features.csv";

#[derive(Parser)]
#[command(
    name = "noduscope",
    version,
    about = "Patient-level nodule features from a test-time-augmented model ensemble"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Score every patient in a directory of segmentation arrays
    #[command(about = "Score patients (outputs: weighted_ensemble_features.csv)")]
    Score(ScoreArgs),

    /// Write the default run configuration
    #[command(about = "Write the default run configuration (outputs: config TOML)")]
    InitConfig {
        /// Destination of the TOML file
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
}

#[derive(Args)]
struct ScoreArgs {
    /// Directory holding vox_<id>.npy, cents_<id>.npy and shapes_<id>.npy per patient
    #[arg(value_name = "INPUT_DIR")]
    input_dir: PathBuf,

    /// Run configuration TOML (defaults apply when omitted)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Output CSV; defaults to INPUT_DIR/weighted_ensemble_features.csv
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Seed for the augmentation RNG, overriding the configuration
    #[arg(long, value_name = "N")]
    seed: Option<u64>,

    /// Number of TTA repetitions, overriding the configuration
    #[arg(long, value_name = "T")]
    repetitions: Option<usize>,

    /// Enable small random rotations during augmentation
    #[arg(long)]
    rotate: bool,

    /// Skip patients that fail to load or score instead of aborting
    #[arg(long)]
    continue_on_error: bool,
}

/// Per-patient progress bar, drawn only when stderr is a terminal.
struct ProgressBarObserver {
    bar: ProgressBar,
}

impl ProgressBarObserver {
    fn new() -> Self {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(None, draw_target);
        if let Ok(style) = ProgressStyle::with_template(
            "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} patients ({eta}) {msg}",
        ) {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        Self { bar }
    }
}

impl ScoringProgressObserver for ProgressBarObserver {
    fn on_start(&mut self, total_patients: usize) {
        self.bar.set_length(total_patients as u64);
    }

    fn on_patient_scored(&mut self, patient_id: &str, n_nodules: usize) {
        self.bar.set_message(format!("{patient_id} ({n_nodules} nodules)"));
        self.bar.inc(1);
    }

    fn on_patient_skipped(&mut self, error: &PipelineError) {
        self.bar.println(format!("Skipped: {error}"));
        self.bar.inc(1);
    }

    fn on_finish(&mut self) {
        self.bar.finish_and_clear();
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::Score(args)) => run_score(args),
        Some(Commands::InitConfig { path }) => run_init_config(path),
        None => match Cli::command().print_help() {
            Ok(()) => {
                println!();
                Ok(())
            }
            Err(e) => Err(e.into()),
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_init_config(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    RunConfig::default().save(&path)?;
    println!("Default configuration written to {}", path.display());
    Ok(())
}

fn run_score(args: ScoreArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => RunConfig::load(path)?,
        None => {
            log::warn!("No --config given; using the default slot registry");
            RunConfig::default()
        }
    };
    if let Some(seed) = args.seed {
        config.seed = Some(seed);
    }
    if let Some(repetitions) = args.repetitions {
        config.tta.repetitions = repetitions;
    }
    if args.rotate {
        config.augmentation.rotate = true;
    }
    if args.continue_on_error {
        config.continue_on_error = true;
    }

    let pipeline = FeaturePipeline::from_config(&config)?;
    let source = PatientSource::open(&args.input_dir)?;
    if source.len() == 0 {
        return Err(format!(
            "No vox_<id>.npy files found in {}",
            args.input_dir.display()
        )
        .into());
    }
    log::info!(
        "Scoring {} patients from {} with {} TTA repetitions",
        source.len(),
        args.input_dir.display(),
        config.tta.repetitions
    );

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut observer = ProgressBarObserver::new();
    let table = pipeline.run(source, &mut rng, &mut observer, config.continue_on_error)?;

    let output = args
        .output
        .unwrap_or_else(|| args.input_dir.join(DEFAULT_OUTPUT_NAME));
    table.save(&output)?;
    println!(
        "Features for {} patients written to {}",
        table.len(),
        output.display()
    );
    Ok(())
}
