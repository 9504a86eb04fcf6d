// ========================================================================================
//
//                              THE COMMAND LINE: TIMEFLAT
//
// ========================================================================================
//
// A thin shell over the library. `flatten` runs one configured flattening job end to
// end; `evaluate` turns a file of predictions into a performance-by-bucket table.
// All policy lives in the library; this file parses arguments, wires up logging and
// progress reporting, and maps failures to a non-zero exit status.

use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::error::Error;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;
use std::sync::Mutex;
use timeflat::binning::Binned;
use timeflat::config::RunConfig;
use timeflat::evaluate::bucket::{
    DEFAULT_MIN_N_IN_BIN, DEFAULT_RESAMPLES, bucket_by_age, bucket_by_days_to_event, bucket_by_month,
    bucket_by_sex, bucket_by_weekday, write_performance_tsv,
};
use timeflat::evaluate::metrics::DEFAULT_THRESHOLD;
use timeflat::evaluate::{
    BootstrapConfig, BucketOptions, EvaluationColumns, EvaluationDataset, Metric, performance_by_bucket,
};
use timeflat::pipeline;
use timeflat::progress::{FlattenProgressObserver, FlattenStage};

// ========================================================================================
//                         COMMAND-LINE INTERFACE DEFINITION
// ========================================================================================

#[derive(Parser)]
#[command(
    name = "timeflat",
    about = "Time-windowed feature flattening for clinical prediction research",
    long_about = "Builds one-row-per-prediction-time feature tables from longitudinal event data \
                 and evaluates model predictions by bucket."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a flattening job described by a TOML configuration
    #[command(about = "Flatten event tables (outputs: {train,val,test}.parquet and reports)")]
    Flatten {
        /// Path to the run configuration (.toml)
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },

    /// Compute a metric per bucket over a file of predictions
    #[command(about = "Evaluate predictions by bucket (outputs: a performance TSV)")]
    Evaluate(EvaluateArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BucketBy {
    Age,
    Sex,
    DaysToEvent,
    Weekday,
    Month,
}

impl BucketBy {
    fn as_str(self) -> &'static str {
        match self {
            Self::Age => "age",
            Self::Sex => "sex",
            Self::DaysToEvent => "days_to_event",
            Self::Weekday => "weekday",
            Self::Month => "month",
        }
    }
}

#[derive(Args)]
struct EvaluateArgs {
    /// Evaluation dataset (parquet, CSV or TSV)
    #[arg(value_name = "DATASET")]
    dataset: PathBuf,

    #[arg(long, value_enum)]
    by: BucketBy,

    /// auc, brier, sensitivity, specificity, ppv or prevalence
    #[arg(long, default_value = "auc")]
    metric: String,

    /// Decision threshold for thresholded metrics
    #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
    threshold: f64,

    /// Bin edges for continuous bucketing, comma separated
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    edges: Vec<f64>,

    /// Print bucket labels as "7-13" instead of "[7, 14)"
    #[arg(long)]
    prettify: bool,

    /// Confidence level of a bootstrap interval, e.g. 0.95
    #[arg(long)]
    ci: Option<f64>,

    #[arg(long, default_value_t = DEFAULT_RESAMPLES)]
    resamples: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, default_value_t = DEFAULT_MIN_N_IN_BIN)]
    min_n_in_bin: usize,

    #[arg(long, default_value = "entity_id")]
    entity_col: String,

    #[arg(long, default_value = "pred_timestamp")]
    pred_timestamp_col: String,

    #[arg(long, default_value = "outcome_timestamp")]
    outcome_timestamp_col: String,

    #[arg(long, default_value = "y")]
    y_col: String,

    #[arg(long, default_value = "y_hat_probs")]
    prob_col: String,

    #[arg(long, default_value = "age")]
    age_col: String,

    #[arg(long, default_value = "sex")]
    sex_col: String,

    /// Output TSV; defaults to performance_by_<bucket>.tsv next to the dataset
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Flatten { config } => run_flatten(config),
        Commands::Evaluate(args) => run_evaluate(args),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

// ========================================================================================
//                                  SUBCOMMANDS
// ========================================================================================

fn run_flatten(config_path: PathBuf) -> Result<(), Box<dyn Error>> {
    let config = RunConfig::load(&config_path)?;
    let progress = BarProgress::default();
    let report = pipeline::run(&config, &progress)?;
    println!(
        "Flattened {} prediction times into {} predictor and {} outcome columns.",
        report.n_rows, report.n_predictor_columns, report.n_outcome_columns
    );
    for split in &report.splits {
        println!(
            "  {:<5} {:>9} rows {:>8} entities",
            split.split, split.n_rows, split.n_entities
        );
    }
    Ok(())
}

fn run_evaluate(args: EvaluateArgs) -> Result<(), Box<dyn Error>> {
    let metric = Metric::parse(&args.metric, args.threshold)?;
    let mut columns = EvaluationColumns {
        entity_id: args.entity_col.clone(),
        pred_timestamp: args.pred_timestamp_col.clone(),
        y: args.y_col.clone(),
        y_hat_probs: args.prob_col.clone(),
        ..EvaluationColumns::default()
    };
    match args.by {
        BucketBy::Age => columns.age = Some(args.age_col.clone()),
        BucketBy::Sex => columns.sex = Some(args.sex_col.clone()),
        BucketBy::DaysToEvent => columns.outcome_timestamp = Some(args.outcome_timestamp_col.clone()),
        BucketBy::Weekday | BucketBy::Month => {}
    }
    let dataset = EvaluationDataset::load(&args.dataset, &columns)?;

    let binned: Binned = match args.by {
        BucketBy::Age => bucket_by_age(&dataset, &args.edges, args.prettify)?,
        BucketBy::DaysToEvent => bucket_by_days_to_event(&dataset, &args.edges, args.prettify)?,
        BucketBy::Sex => bucket_by_sex(&dataset)?,
        BucketBy::Weekday => bucket_by_weekday(&dataset),
        BucketBy::Month => bucket_by_month(&dataset),
    };
    let options = BucketOptions {
        min_n_in_bin: args.min_n_in_bin,
        bootstrap: args.ci.map(|confidence_interval| BootstrapConfig {
            confidence_interval,
            resamples: args.resamples,
            seed: args.seed,
        }),
    };
    let table = performance_by_bucket(
        dataset.y.view(),
        dataset.y_hat_probs.view(),
        metric,
        &binned,
        &options,
    )?;

    let output = args.output.unwrap_or_else(|| {
        args.dataset
            .with_file_name(format!("performance_by_{}.tsv", args.by.as_str()))
    });
    write_performance_tsv(&table, &output)?;
    for row in &table {
        println!("{:<20} {:>8.4} (n={})", row.bucket, row.metric, row.n_in_bin);
    }
    println!("Wrote {} buckets to {}", table.len(), output.display());
    Ok(())
}

// ========================================================================================
//                                PROGRESS REPORTING
// ========================================================================================

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    pb.set_style(
        ProgressStyle::with_template("\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  "),
    );
    pb.set_message(message.to_string());
    pb
}

/// One bar per stage; units finish concurrently, so the bar sits behind a mutex.
#[derive(Default)]
struct BarProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl FlattenProgressObserver for BarProgress {
    fn on_stage_start(&self, stage: FlattenStage, total_units: usize) {
        if let Ok(mut slot) = self.bar.lock() {
            *slot = Some(create_progress_bar(total_units as u64, stage.describe()));
        }
    }

    fn on_unit_finish(&self, _stage: FlattenStage, unit: &str) {
        if let Ok(slot) = self.bar.lock() {
            if let Some(pb) = slot.as_ref() {
                pb.set_message(unit.to_string());
                pb.inc(1);
            }
        }
    }

    fn on_stage_finish(&self, stage: FlattenStage) {
        if let Ok(mut slot) = self.bar.lock() {
            if let Some(pb) = slot.take() {
                pb.finish_with_message(format!("{stage} done"));
            }
        }
    }
}
