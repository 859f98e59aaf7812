//! captionsieve CLI - Confidence-gated dataset filtering with local language models.

use anyhow::{Context, Result, bail};
use captionsieve::provider::llama::load_text_backend;
use captionsieve::{
    CheckpointManager, Config, ConfigError, Dataset, FilterPipeline, FilterSettings, TableFormat,
    required_logit_diff,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "captionsieve")]
#[command(author = "Infernet <dev@infernet.org>")]
#[command(version)]
#[command(about = "Confidence-gated dataset filtering with local language models")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Filter a dataset, keeping rows the model confidently answers "1" for
    Filter {
        /// Dataset to filter (overrides dataset.path)
        #[arg(short, long)]
        dataset: Option<PathBuf>,

        /// Filtered dataset path (overrides output.path)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Continue from the run state next to the output file
        #[arg(long)]
        resume: bool,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")
}

fn print_example_config() {
    let example = r#"# captionsieve configuration file

[model]
# Local export with config.json, tokenizer.json and *.safetensors
dir = "${HOME}/models/Llama-3.2-3B-Instruct"
dtype = "bf16"          # f32 | f16 | bf16
cpu = false
system_prompt = "You are an AI assistant that follows the user's directions."

[dataset]
path = "data/metadata.tsv"
delimiter = "\t"
has_header = true
caption_column = "caption"
# image_column = "image"   # selects vision mode (library API only)
# image_root = "data/images"

[filter]
prompt = """Does the following caption describe a photograph? \
Answer 1 for yes or 0 for no.

Caption: {caption}"""
threshold = 0.5
early_stop = true
max_attempts = 10
top_k = 1
keep_on_corrupted = false

[output]
path = "output/filtered.tsv"
checkpoint_every = 1000
"#;
    println!("{example}");
}

fn load_config(path: &Path) -> Result<Config> {
    Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Example => {
            print_example_config();
            return Ok(());
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;
            config.validate().context("Invalid configuration")?;

            info!("Configuration is valid");
            info!("  Model:       {:?} ({:?})", config.model.dir, config.model.dtype);
            info!("  Dataset:     {:?}", config.dataset.path);
            info!(
                "  Mode:        {}",
                if config.is_vision() { "vision" } else { "text" }
            );
            info!(
                "  Threshold:   {:.2} (logit diff {:.3})",
                config.filter.threshold,
                required_logit_diff(config.filter.threshold)
            );
            info!(
                "  Early stop:  {} (top-{}, max {} attempts)",
                config.filter.early_stop, config.filter.top_k, config.filter.max_attempts
            );
            match config.output.checkpoint_every {
                Some(every) => info!("  Checkpoints: every {every} rows"),
                None => info!("  Checkpoints: disabled"),
            }
            return Ok(());
        }

        Commands::Filter {
            dataset,
            output,
            resume,
        } => {
            let mut config = load_config(&cli.config)?;

            // Override paths from CLI
            if let Some(dataset) = dataset {
                config.dataset.path = dataset;
            }
            if let Some(output) = output {
                config.output.path = output;
            }

            config.validate().context("Invalid configuration")?;
            if config.is_vision() {
                bail!(ConfigError::VisionUnsupported);
            }

            let format = TableFormat::from_config(&config.dataset)?;
            let data = Dataset::load(&config.dataset.path, format)
                .with_context(|| format!("Failed to load dataset {:?}", config.dataset.path))?;
            let settings = FilterSettings::from_config(&config)?;

            let (model, processor) =
                load_text_backend(&config.model).context("Failed to load model")?;
            let mut pipeline = FilterPipeline::new(settings, model, processor);

            let mut checkpoint = CheckpointManager::new(
                &config.output.path,
                format,
                config.output.checkpoint_every,
            )
            .resuming(resume);

            let outcome = pipeline.run(&data, Some(&mut checkpoint))?;
            let written = checkpoint
                .save(&data, &outcome.state)
                .context("Failed to write filtered dataset")?;
            let stats = outcome.stats;

            println!("\n=== Filtering Complete ===");
            println!("Rows:        {}", stats.total_rows);
            println!("Processed:   {}", stats.processed);
            println!("Resumed:     {}", stats.resumed);
            println!("Kept:        {}", stats.kept);
            println!("Discarded:   {}", stats.discarded);
            println!("Corrupted:   {}", stats.corrupted);
            println!("Exhausted:   {}", stats.exhausted);
            println!("Keep rate:   {:.1}%", stats.keep_rate * 100.0);
            println!("Throughput:  {:.0}/hr", stats.throughput_per_hour);
            println!("Checkpoints: {}", stats.checkpoints_written);
            println!("Runtime:     {:.1}s", stats.runtime_secs);
            println!("Output:      {:?} ({written} rows)", config.output.path);
        }
    }

    Ok(())
}
