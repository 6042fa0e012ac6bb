use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use plimit::config::JobFile;
use plimit::{runner, trace, Concurrency};

/// plimit: run a batch of jobs with at most N in flight.
#[derive(Parser, Debug)]
#[command(name = "plimit")]
#[command(about = "Bounded-concurrency job runner", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every job of a YAML job file through a limiter
    Run {
        /// Path to the job YAML file
        path: PathBuf,

        /// Override the file's concurrency (a positive integer or `unbounded`)
        #[arg(long)]
        concurrency: Option<Concurrency>,

        /// Print the admission trace after the summary
        #[arg(long)]
        trace: bool,

        /// Print the run report as JSON instead of text
        #[arg(long)]
        json: bool,

        /// Drop every job still waiting for a slot once any job fails
        #[arg(long)]
        fail_fast: bool,
    },

    /// Validate a job file and print its plan without running anything
    Check {
        /// Path to the job YAML file
        path: PathBuf,
    },
}

fn print_error_chain(err: &anyhow::Error) {
    eprintln!("Error: {err}");

    // Print the cause chain, if any, indented.
    let mut n = 0;
    let mut cur = err.source();
    while let Some(cause) = cur {
        eprintln!("  {n}: {cause}");
        n += 1;
        cur = cause.source();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = real_main(cli).await {
        print_error_chain(&err);
        std::process::exit(1);
    }
}

async fn real_main(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            path,
            concurrency,
            trace: do_trace,
            json,
            fail_fast,
        } => {
            let file = JobFile::load_from_file(&path)
                .with_context(|| format!("failed to load job file: {}", path.display()))?;
            let concurrency = concurrency.unwrap_or(file.concurrency);
            let run_id = run_id_for(&path);

            let opts = runner::RunOptions { fail_fast };
            let report = runner::execute_jobs(&run_id, &file, concurrency, opts).await?;

            if json {
                let text = serde_json::to_string_pretty(&report).context("serialize run report")?;
                println!("{text}");
            } else {
                println!(
                    "RUN SUMMARY: {} job(s) concurrency={}",
                    report.outcomes.len(),
                    report.concurrency
                );
                for o in &report.outcomes {
                    match (&o.value, &o.error) {
                        (Some(v), _) => println!("  job={} status={} value={v}", o.id, o.status),
                        (None, Some(e)) => println!("  job={} status={} error={e}", o.id, o.status),
                        (None, None) => println!("  job={} status={}", o.id, o.status),
                    }
                }
                println!("PEAK ACTIVE: {}", report.peak_active);
                println!(
                    "SUCCEEDED: {}/{}",
                    report.succeeded(),
                    report.outcomes.len()
                );
            }

            if do_trace {
                if let Some(tr) = report.trace.as_ref() {
                    trace::print_trace(tr);
                }
            }
            Ok(())
        }
        Command::Check { path } => {
            let file = JobFile::load_from_file(&path)
                .with_context(|| format!("failed to load job file: {}", path.display()))?;

            println!("Job file:     {}", path.display());
            println!("Version:      {}", file.version);
            println!("Concurrency:  {}", file.concurrency);
            println!("Jobs:         {}", file.jobs.len());
            for (idx, job) in file.jobs.iter().enumerate() {
                println!(
                    "  {idx}. {}  delay_ms={} behavior={:?}",
                    job.id,
                    job.delay_ms,
                    job.behavior()
                );
            }
            Ok(())
        }
    }
}

fn run_id_for(path: &std::path::Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("run")
        .to_string()
}
