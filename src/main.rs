// SPDX-License-Identifier: PMPL-1.0-or-later

//! qleval: evaluate compiled query plans against an extracted fact store

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use qleval::plan::Program;
use qleval::results::formatter::ResultFormatter;
use qleval::results::output::ResultFormat;
use qleval::results::QueryOutcome;
use qleval::store::loader;
use qleval::{EvalConfig, Executor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "qleval")]
#[command(version)]
#[command(about = "Stratified query evaluation over extracted program facts")]
#[command(long_about = None)]
struct Cli {
    /// Log evaluation progress (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate one query or every query of a plan
    Run {
        /// Fact store: JSON document or database directory
        #[arg(value_name = "STORE")]
        store: PathBuf,

        /// Compiled plan (JSON)
        #[arg(value_name = "PLAN")]
        plan: PathBuf,

        /// Run only the named query
        #[arg(short, long)]
        query: Option<String>,

        /// Serialize results instead of printing a summary
        #[arg(short, long, value_enum)]
        format: Option<ResultFormat>,

        /// Write results to a file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Evaluation config (YAML or JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Worker threads
        #[arg(short = 'j', long)]
        threads: Option<usize>,

        /// Per-query deadline in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Expand entity values to label, kind and location
        #[arg(long)]
        resolve: bool,
    },

    /// Validate a plan and print its strata
    Check {
        #[arg(value_name = "STORE")]
        store: PathBuf,

        #[arg(value_name = "PLAN")]
        plan: PathBuf,
    },

    /// Describe a fact store
    Stats {
        #[arg(value_name = "STORE")]
        store: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "qleval=debug" } else { "qleval=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>, threads: Option<usize>, timeout_ms: Option<u64>) -> Result<EvalConfig> {
    let mut config = match path {
        Some(path) => EvalConfig::from_file(path)?,
        None => EvalConfig::default(),
    }
    .apply_env()?;
    if let Some(threads) = threads {
        config = config.with_threads(threads);
    }
    if let Some(ms) = timeout_ms {
        config = config.with_timeout(Duration::from_millis(ms));
    }
    Ok(config)
}

fn build_executor(store: &Path, plan: &Path, config: EvalConfig) -> Result<Executor> {
    let store = loader::load(store)?;
    let program = Program::from_file(plan)?;
    Executor::new(Arc::new(store), program, config).context("building executor")
}

/// Serialized output goes to `output` when given, else stdout
fn emit<T: serde::Serialize>(value: &T, format: Option<ResultFormat>, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            let format = format
                .or_else(|| ResultFormat::from_path(path))
                .unwrap_or(ResultFormat::Json);
            format.write(value, path)?;
            println!("Results saved to: {}", path.display());
        }
        None => {
            let format = format.unwrap_or(ResultFormat::Json);
            println!("{}", format.serialize(value)?);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run {
            store,
            plan,
            query,
            format,
            output,
            config,
            threads,
            timeout_ms,
            resolve,
        } => {
            let config = load_config(config.as_deref(), threads, timeout_ms)?;
            let exec = build_executor(&store, &plan, config)?;
            let serialized = format.is_some() || output.is_some();
            let formatter = ResultFormatter::new();

            match query {
                Some(name) => {
                    let started = Instant::now();
                    let result = exec.run_query(&name);
                    if serialized {
                        let result = result.map_err(|e| anyhow!("query `{}` failed: {}", name, e))?;
                        if resolve {
                            emit(&result.resolve(exec.store()), format, output.as_deref())?;
                        } else {
                            emit(&result, format, output.as_deref())?;
                        }
                    } else {
                        let outcome = QueryOutcome {
                            query: name.clone(),
                            elapsed_ms: started.elapsed().as_millis() as u64,
                            result,
                        };
                        println!("{}", formatter.outcome_line(&outcome));
                        match &outcome.result {
                            Ok(result) => formatter.print_rows(result, exec.store()),
                            Err(err) => bail!("query `{}` failed: {}", name, err),
                        }
                    }
                }
                None => {
                    let report = exec.run_all();
                    if serialized {
                        if resolve {
                            let resolved: Vec<_> = report
                                .outcomes
                                .iter()
                                .filter_map(|o| o.rows())
                                .map(|r| r.resolve(exec.store()))
                                .collect();
                            emit(&resolved, format, output.as_deref())?;
                        } else {
                            emit(&report, format, output.as_deref())?;
                        }
                    } else {
                        formatter.print_batch(&report, exec.store());
                    }
                    if report.failed() > 0 {
                        bail!("{} of {} queries failed", report.failed(), report.outcomes.len());
                    }
                }
            }
        }

        Commands::Check { store, plan } => {
            let exec = build_executor(&store, &plan, EvalConfig::default())?;
            let formatter = ResultFormatter::new();
            formatter.print_strata(exec.strata());
            println!();

            let mut failures = 0;
            for pred in &exec.program().predicates {
                if let Some(err) = exec.predicate_error(&pred.name) {
                    failures += 1;
                    println!("  {} {} {}", "INVALID".red(), pred.name.bold(), err);
                }
            }
            for query in &exec.program().queries {
                match exec.prepare(query) {
                    Ok(prepared) => println!(
                        "  {} {} ({} column(s), {} strata)",
                        "OK".green(),
                        query.name.bold(),
                        prepared.schema.arity(),
                        prepared.strata.len()
                    ),
                    Err(err) => {
                        failures += 1;
                        println!("  {} {} [{}] {}", "FAILED".red(), query.name.bold(), err.kind(), err);
                    }
                }
            }
            if failures > 0 {
                bail!("{} problem(s) found in {}", failures, plan.display());
            }
        }

        Commands::Stats { store } => {
            let store = loader::load(&store)?;
            ResultFormatter::new().print_store(&store);
        }
    }

    Ok(())
}
