// nullsim CLI
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use nullsim::aggregate::compute_error_rates;
use nullsim::compare::{BayesianComparison, ComparisonEngine, FrequentistComparison, Method};
use nullsim::config::StudyConfig;
use nullsim::datagen::{generate, write_csv, Regime};
use nullsim::driver::{run_study, StudyOptions};
use nullsim::store::ResultsStore;

#[derive(Parser)]
#[command(name = "nullsim")]
#[command(version = "0.1.0")]
#[command(
    about = "Null-model selection study for fixed and random effects in mixed models",
    long_about = None
)]
struct Cli {
    /// Verbose logging (repeat for trace level); RUST_LOG overrides
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum MethodArg {
    Bayesian,
    Frequentist,
    Both,
}

impl MethodArg {
    fn methods(self) -> Vec<Method> {
        match self {
            MethodArg::Bayesian => vec![Method::Bayesian],
            MethodArg::Frequentist => vec![Method::Frequentist],
            MethodArg::Both => Method::ALL.to_vec(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run (or resume) the simulation study and report error rates
    Run {
        /// Study configuration (JSON); defaults apply when omitted
        #[arg(short, long, value_name = "CONFIG")]
        config: Option<PathBuf>,

        /// Results directory
        #[arg(short, long, default_value = "results")]
        output: PathBuf,

        /// Inference method(s) to run
        #[arg(short, long, value_enum, default_value = "both")]
        method: MethodArg,

        /// Override the number of replications per regime
        #[arg(short = 'n', long)]
        replications: Option<usize>,

        /// Override the worker pool size
        #[arg(short, long)]
        workers: Option<usize>,

        /// Discard existing results instead of resuming
        #[arg(long)]
        fresh: bool,
    },

    /// Compute error rates from an existing results directory
    Aggregate {
        /// Study configuration (JSON), for the decision thresholds
        #[arg(short, long, value_name = "CONFIG")]
        config: Option<PathBuf>,

        /// Results directory
        #[arg(short, long, default_value = "results")]
        output: PathBuf,

        /// Inference method(s) to aggregate
        #[arg(short, long, value_enum, default_value = "both")]
        method: MethodArg,

        /// Also write the tables as JSON
        #[arg(long, value_name = "JSON")]
        json: Option<PathBuf>,
    },

    /// Write one synthetic dataset to CSV for inspection
    GenerateData {
        /// Data-generating regime (null_both, null_re, null_fe, null_none)
        #[arg(short, long, default_value = "null_none")]
        regime: String,

        /// Replication seed
        #[arg(short, long, default_value = "1")]
        seed: u64,

        /// Study configuration (JSON) for the data settings
        #[arg(short, long, value_name = "CONFIG")]
        config: Option<PathBuf>,

        /// Output CSV file
        #[arg(short, long, default_value = "dataset.csv")]
        output: PathBuf,
    },

    /// Write the default configuration as JSON
    InitConfig {
        /// Output file
        #[arg(short, long, default_value = "study.json")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "nullsim=info",
        1 => "nullsim=debug",
        _ => "nullsim=trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<StudyConfig> {
    match path {
        Some(path) => StudyConfig::load(path)
            .with_context(|| format!("Failed to load configuration {}", path.display())),
        None => Ok(StudyConfig::default()),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run {
            config,
            output,
            method,
            replications,
            workers,
            fresh,
        } => run_command(
            config.as_deref(),
            &output,
            method,
            replications,
            workers,
            fresh,
        ),
        Commands::Aggregate {
            config,
            output,
            method,
            json,
        } => {
            let config = load_config(config.as_deref())?;
            aggregate_command(&config, &output, method, json.as_deref())
        }
        Commands::GenerateData {
            regime,
            seed,
            config,
            output,
        } => generate_data_command(&regime, seed, config.as_deref(), &output),
        Commands::InitConfig { output, force } => init_config_command(&output, force),
    }
}

fn run_command(
    config_path: Option<&Path>,
    output: &Path,
    method: MethodArg,
    replications: Option<usize>,
    workers: Option<usize>,
    fresh: bool,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(n) = replications {
        config.n_replications = n;
    }
    if let Some(w) = workers {
        config.workers = w;
    }
    config.validate().context("Invalid configuration")?;

    let store = ResultsStore::new(output);
    if config.skip_generation {
        eprintln!("skip_generation is set; aggregating existing results only");
        return aggregate_command(&config, output, method, None);
    }

    let generator = config
        .generator_config()
        .context("Failed to build the lab effect vector")?;

    for method in method.methods() {
        if fresh {
            store
                .clear(method)
                .with_context(|| format!("Failed to clear {} results", method))?;
        }

        let (engine, threads_per_replication): (Box<dyn ComparisonEngine>, usize) = match method
        {
            Method::Bayesian => (
                Box::new(BayesianComparison::new(
                    config.priors.clone(),
                    config.sampler.clone(),
                    config.fit_timeout(),
                )),
                config.sampler.chains,
            ),
            Method::Frequentist => (
                Box::new(FrequentistComparison::new(
                    config.frequentist.clone(),
                    config.fit_timeout(),
                )),
                1,
            ),
        };

        let options = StudyOptions {
            workers: config.workers,
            generator: generator.clone(),
            threads_per_replication,
        };

        eprintln!(
            "Running {} study: {} regimes × {} replications on {} workers",
            method,
            config.regimes.len(),
            config.n_replications,
            config.workers
        );
        let summary = run_study(
            engine.as_ref(),
            &store,
            &config.regimes,
            config.n_replications as u64,
            &options,
        )
        .with_context(|| format!("{} study failed", method))?;
        println!("{}", summary);
    }

    aggregate_command(&config, output, method, None)
}

fn aggregate_command(
    config: &StudyConfig,
    output: &Path,
    method: MethodArg,
    json: Option<&Path>,
) -> Result<()> {
    let store = ResultsStore::new(output);
    let mut tables = Vec::new();

    for method in method.methods() {
        let rows = store
            .read_rows(method)
            .with_context(|| format!("Failed to read {} results", method))?;
        if rows.is_empty() {
            eprintln!(
                "No {} results in {}",
                method,
                store.path(method).display()
            );
            continue;
        }
        let table = compute_error_rates(&rows, method, &config.thresholds);
        println!("{}", table);
        tables.push(table);
    }

    if let Some(json_path) = json {
        let text = serde_json::to_string_pretty(&tables).context("Failed to serialise tables")?;
        fs::write(json_path, text)
            .with_context(|| format!("Failed to write {}", json_path.display()))?;
        eprintln!("✓ Error rates written to {}", json_path.display());
    }
    Ok(())
}

fn generate_data_command(
    regime: &str,
    seed: u64,
    config_path: Option<&Path>,
    output: &Path,
) -> Result<()> {
    let config = load_config(config_path)?;
    let regime: Regime = regime.parse()?;
    let generator = config
        .generator_config()
        .context("Failed to build the lab effect vector")?;
    let data = generate(regime, seed, &generator).context("Failed to generate dataset")?;

    write_csv(output, &data).with_context(|| format!("Failed to write {}", output.display()))?;
    println!("✓ Generated: {}", output.display());
    println!("  Regime: {}", regime);
    println!("  Seed: {}", seed);
    println!("  Labs: {} × {} records", data.n_labs, data.n_per_lab);
    println!("  Total rows: {}", data.len());
    Ok(())
}

fn init_config_command(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!(
            "{} already exists (pass --force to overwrite)",
            output.display()
        );
    }
    let text = StudyConfig::default().to_json()?;
    fs::write(output, text).with_context(|| format!("Failed to write {}", output.display()))?;
    println!("✓ Default configuration written to {}", output.display());
    Ok(())
}
