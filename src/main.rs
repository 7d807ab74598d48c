//! tlib CLI - Iteration/loop test runner with HTML reports.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use tlib::case::TestCase;
use tlib::case::shell::ShellCase;
use tlib::config::{self, Config};
use tlib::notify::SendmailNotifier;
use tlib::orchestrator::Orchestrator;
use tlib::report::{ConsoleReporter, LogReporter, MultiReporter};

#[derive(Parser)]
#[command(name = "tlib")]
#[command(about = "Run test cases under an iteration/loop schedule and report the results", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "tlib.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured test cases
    Run {
        /// Override the number of workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// Override the number of iterations
        #[arg(short, long)]
        iterations: Option<usize>,

        /// Override the number of loops per case
        #[arg(short = 'l', long = "loop")]
        loops: Option<usize>,

        /// Only run the cases with these IDs (repeatable)
        #[arg(short = 'k', long = "case")]
        cases: Vec<String>,

        /// Override the report output directory
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Also write a JUnit XML report
        #[arg(long)]
        junit: bool,

        /// Do not mail the report even if recipients are configured
        #[arg(long)]
        no_notify: bool,

        /// Log events instead of drawing a progress bar
        #[arg(long)]
        plain: bool,
    },

    /// List the configured test cases
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            workers,
            iterations,
            loops,
            cases,
            output_dir,
            junit,
            no_notify,
            plain,
        } => {
            let overrides = Overrides {
                workers,
                iterations,
                loops,
                cases,
                output_dir,
                junit,
                no_notify,
            };
            run_tests(&cli.config, overrides, plain, cli.verbose).await
        }
        Commands::List { format } => list_cases(&cli.config, &format),
        Commands::Validate => validate_config(&cli.config),
        Commands::Init => init_config(&cli.config),
    }
}

/// Command-line settings that take precedence over the config file.
struct Overrides {
    workers: Option<usize>,
    iterations: Option<usize>,
    loops: Option<usize>,
    cases: Vec<String>,
    output_dir: Option<PathBuf>,
    junit: bool,
    no_notify: bool,
}

impl Overrides {
    fn apply(self, config: &mut Config) -> Result<()> {
        if let Some(workers) = self.workers {
            config.run.workers = workers;
        }
        if let Some(iterations) = self.iterations {
            config.run.iterations = iterations;
        }
        if let Some(loops) = self.loops {
            config.run.loops = loops;
        }
        if let Some(dir) = self.output_dir {
            config.report.output_dir = dir;
        }
        if self.junit {
            config.report.junit = true;
        }
        if self.no_notify {
            config.notify.recipients.clear();
        }

        if !self.cases.is_empty() {
            if let Some(unknown) = self
                .cases
                .iter()
                .find(|id| !config.cases.iter().any(|c| &c.id == *id))
            {
                bail!("Unknown case: {}", unknown);
            }
            config.cases.retain(|c| self.cases.contains(&c.id));
        }

        Ok(())
    }
}

async fn run_tests(
    config_path: &Path,
    overrides: Overrides,
    plain: bool,
    verbose: bool,
) -> Result<()> {
    // Load configuration
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    overrides.apply(&mut config)?;
    config.validate()?;

    info!("Loaded configuration from {}", config_path.display());

    let cases: Vec<std::sync::Arc<dyn TestCase>> = config
        .cases
        .iter()
        .map(|c| ShellCase::from_config(c).into_shared())
        .collect();

    let reporter = create_reporter(plain, verbose);
    let notifier = SendmailNotifier::from_config(&config.notify);
    let mut orchestrator = Orchestrator::new(config, reporter).with_notifier(notifier);

    tokio::spawn(watch_interrupts(orchestrator.stop_token()));

    let report = orchestrator.run(cases).await?;
    std::process::exit(report.exit_code());
}

/// First Ctrl-C stops dispatching and lets running tests finish; a second
/// one exits at once with status 130.
async fn watch_interrupts(stop: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    warn!("Interrupted, waiting for running tests to finish (press Ctrl-C again to exit now)");
    stop.cancel();

    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("Interrupted again, exiting without a report");
        std::process::exit(130);
    }
}

fn list_cases(config_path: &Path, format: &str) -> Result<()> {
    let config = config::load_config(config_path)?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&config.cases)?;
            println!("{}", json);
        }
        _ => {
            println!("Configured {} cases:", config.cases.len());
            for case in &config.cases {
                let mut flags = Vec::new();
                if case.serial {
                    flags.push("serial".to_string());
                }
                if let Some(secs) = case.timeout_secs {
                    flags.push(format!("timeout {}s", secs));
                }
                if let Some(reason) = &case.skip {
                    flags.push(format!("skip: {}", reason));
                }
                let flags = if flags.is_empty() {
                    String::new()
                } else {
                    format!(" [{}]", flags.join(", "))
                };
                println!("  {}{}", case.id, flags);
            }
        }
    }

    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    let checked = config::load_config(config_path).and_then(|config| {
        config.validate()?;
        Ok(config)
    });

    match checked {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Title:      {}", config.run.title);
            println!("  Iterations: {}", config.run.iterations);
            println!("  Loop:       {}", config.run.loops);
            println!("  Workers:    {}", config.run.workers);
            match config.run.timeout_secs {
                Some(secs) => println!("  Timeout:    {}s", secs),
                None => println!("  Timeout:    none"),
            }
            println!("  Cases:      {}", config.cases.len());
            println!(
                "  Report:     {}",
                config.report.resolved_output_dir().display()
            );
            if !config.notify.recipients.is_empty() {
                println!("  Notify:     {}", config.notify.recipients.join(", "));
            }

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

const CONFIG_TEMPLATE: &str = r#"# tlib configuration file

[run]
title = "tlib test report"
description = ""
iterations = 1
loop = 1
workers = 1
# timeout_secs = 300

[report]
output_dir = "test-results"
html = true
junit = false

[notify]
# recipients = ["qa@example.com"]
# sendmail = "/usr/sbin/sendmail -t -oi"

[[cases]]
id = "smoke"
command = "echo hello from tlib"

# [[cases]]
# id = "disk_write"
# setup = "mkdir -p /tmp/tlib-disk"
# command = "dd if=/dev/zero of=/tmp/tlib-disk/blob bs=1M count=16"
# teardown = "rm -rf /tmp/tlib-disk"
# serial = true
"#;

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
        std::process::exit(1);
    }

    std::fs::write(path, CONFIG_TEMPLATE)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  tlib run");

    Ok(())
}

fn create_reporter(plain: bool, verbose: bool) -> MultiReporter {
    let multi = MultiReporter::new();

    if plain {
        multi.with_reporter(LogReporter)
    } else {
        multi.with_reporter(ConsoleReporter::new(verbose))
    }
}
