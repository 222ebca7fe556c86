#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{CommandFactory, Parser, Subcommand};
use itertools::Itertools;
use std::fs;
use std::path::PathBuf;
use std::process;

use rvsplit::history::History;
use rvsplit::{FitConfig, FitSession, Spectra};

#[derive(Parser)]
#[command(
    name = "rvsplit",
    about = "Precise radial velocities by joint stellar and telluric template fitting",
    long_about = "Decomposes time series of echelle spectra into a moving stellar component \
                 and a static telluric component, recovering per-epoch radial velocities."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Mask, log-transform and continuum-normalize a raw dataset
    #[command(about = "Preprocess a raw dataset (outputs: a log-space spectra file)")]
    Prepare {
        /// Raw spectra file
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Where to write the prepared spectra
        #[arg(value_name = "OUTPUT")]
        output: PathBuf,

        /// Run configuration; only its [preprocess] table is used
        #[arg(long, value_name = "TOML")]
        config: Option<PathBuf>,
    },

    /// Fit the configured components to every order of a dataset
    #[command(about = "Fit templates and velocities (outputs: model and history TOML files)")]
    Fit {
        /// Spectra file, raw or prepared
        #[arg(long, value_name = "PATH")]
        data: PathBuf,

        /// Run configuration; built-in defaults when omitted
        #[arg(long, value_name = "TOML")]
        config: Option<PathBuf>,

        /// Directory receiving checkpoints, histories and the final model
        #[arg(long, value_name = "DIR")]
        output_dir: PathBuf,

        /// Do not draw a progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// Summarize a recorded optimization history
    #[command(about = "Print a summary of a history file")]
    History {
        #[arg(value_name = "HISTORY_PATH")]
        file: PathBuf,
    },

    /// Display version information
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Prepare {
            input,
            output,
            config,
        }) => run_prepare(input, output, config),
        Some(Commands::Fit {
            data,
            config,
            output_dir,
            no_progress,
        }) => run_fit(data, config, output_dir, no_progress),
        Some(Commands::History { file }) => run_history(file),
        Some(Commands::Version) => {
            println!("rvsplit {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => Cli::command().print_help().map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn load_config(path: Option<PathBuf>) -> Result<FitConfig, Box<dyn std::error::Error>> {
    Ok(match path {
        Some(path) => {
            log::info!("Loading configuration from {}", path.display());
            FitConfig::load(path)?
        }
        None => FitConfig::default(),
    })
}

fn run_prepare(
    input: PathBuf,
    output: PathBuf,
    config: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config)?;
    let mut data = Spectra::read(&input, None, None)?;
    data.prepare(&config.preprocess);
    data.write(&output)?;
    println!(
        "Prepared {} orders x {} epochs -> {}",
        data.n_orders(),
        data.n_epochs(),
        output.display()
    );
    Ok(())
}

fn run_fit(
    data_path: PathBuf,
    config: Option<PathBuf>,
    output_dir: PathBuf,
    no_progress: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config)?;

    // --- 1. Data ---
    let mut data = Spectra::read(&data_path, config.orders.as_deref(), None)?;
    if !data.log_flux {
        log::info!("Dataset is not in log units; preprocessing with the configured settings.");
        data.prepare(&config.preprocess);
    }

    // --- 2. Model and session ---
    fs::create_dir_all(&output_dir)?;
    let mut model = config.build_model(&data)?;
    let session = FitSession::new(config.session_options(Some(&output_dir), no_progress))?;

    // --- 3. Fit ---
    let report = session.optimize_all(&mut model, &data)?;
    if let Some(path) = session.finish(&model)? {
        println!("Model written to {}", path.display());
    }

    for order in &report.completed {
        let id = data.orders[order.order];
        let velocities = model
            .components
            .iter()
            .enumerate()
            .filter(|(index, _)| !model.is_rvs_fixed(*index))
            .filter_map(|(_, c)| c.orders.get(order.order).map(|s| (c, s)))
            .map(|(c, s)| {
                format!(
                    "{} [{}] m/s",
                    c.name,
                    s.rvs.iter().map(|v| format!("{v:.3}")).join(", ")
                )
            })
            .join("; ");
        println!(
            "Order {id}: NLL {:.6e} after {} iterations; {velocities}",
            order.final_nll, order.iterations
        );
    }
    for (r, e) in &report.failed {
        eprintln!("Order {} failed: {e}", data.orders[*r]);
    }
    if report.stopped() {
        eprintln!("Optimization was stopped early; results are partial.");
    }
    Ok(())
}

fn run_history(file: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let history = History::read(&file)?;
    println!(
        "Order {}: {} of {} iterations recorded",
        history.order, history.recorded, history.niter
    );
    if let Some(nll) = history.final_nll() {
        let first = history.nll_history[0];
        println!("NLL {first:.6e} -> {nll:.6e}");
    }
    for component in &history.components {
        let Some(trace) = history.rv_trace(&component.name) else {
            continue;
        };
        let Some(last) = trace.rows().into_iter().last() else {
            continue;
        };
        println!(
            "{} (#{}): final RVs [{}] m/s",
            component.name,
            component.index,
            last.iter().map(|v| format!("{v:.3}")).join(", ")
        );
    }
    Ok(())
}
