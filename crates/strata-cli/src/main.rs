use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use colored::Colorize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use strata_adapter::{DryRunExecutor, Executor};
use strata_artifacts::{ArtifactError, ArtifactWriter, Invocation, RunResultsArtifact, WritableManifest};
use strata_core::{Config, Diagnostic, ResourceType, RunConfig, Severity};
use strata_engine::{BuildError, DeclarationsFile, Project, RunOutcome, RunStatus, Scheduler, SchedulerOptions};
use strata_jinja::{CompileContext, CompileOutput};

/// strata - build-graph compiler and runner for declarative data transformations
#[derive(Parser)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: strata.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Path to the declarations document
    #[arg(short, long, global = true, default_value = "declarations.json")]
    declarations: PathBuf,

    /// Log filter (e.g. "info", "strata_engine=debug")
    #[arg(long, global = true, env = "STRATA_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the project and write the manifest
    Parse {
        #[command(flatten)]
        options: RunArgs,
    },

    /// Compile the selected nodes and write the manifest
    Compile {
        #[command(flatten)]
        options: RunArgs,
    },

    /// Compile and execute the selected nodes
    Run {
        #[command(flatten)]
        options: RunArgs,
    },

    /// List the selected nodes in dependency order
    Ls {
        #[command(flatten)]
        options: RunArgs,
    },
}

/// Options shared by every command
#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Nodes to include: name, unique id, tag:<tag> or package:<package>
    #[arg(short, long, num_args = 1..)]
    select: Vec<String>,

    /// Nodes to exclude, same syntax as --select
    #[arg(long, num_args = 1..)]
    exclude: Vec<String>,

    /// Restrict the selection to these resource types
    #[arg(long = "resource-type", num_args = 1.., value_parser = parse_resource_type)]
    resource_types: Vec<ResourceType>,

    /// Worker thread budget (overrides target.threads)
    #[arg(long, env = "STRATA_THREADS")]
    threads: Option<usize>,

    /// Run with a single worker
    #[arg(long, env = "STRATA_SINGLE_THREADED")]
    single_threaded: bool,

    /// Stop dispatching after the first failure
    #[arg(short = 'x', long, env = "STRATA_FAIL_FAST")]
    fail_fast: bool,

    /// Rebuild incremental models from scratch
    #[arg(long, env = "STRATA_FULL_REFRESH")]
    full_refresh: bool,

    /// Directory artifacts are written to
    #[arg(long, env = "STRATA_TARGET_PATH")]
    target_path: Option<PathBuf>,

    /// Project variables as a JSON object, e.g. '{"start_date": "2024-01-01"}'
    #[arg(long)]
    vars: Option<String>,

    /// Invocation timeout in seconds
    #[arg(long, env = "STRATA_TIMEOUT")]
    timeout: Option<u64>,

    /// Whether to write artifacts
    #[arg(long, env = "STRATA_WRITE_JSON", action = ArgAction::Set, default_value_t = true, value_name = "BOOL")]
    write_json: bool,

    /// Do not write artifacts
    #[arg(long)]
    no_write_json: bool,

    /// Record usage-stats consent in artifact metadata
    #[arg(long, env = "STRATA_SEND_ANONYMOUS_USAGE_STATS", action = ArgAction::Set, value_name = "BOOL")]
    send_anonymous_usage_stats: Option<bool>,
}

fn parse_resource_type(value: &str) -> Result<ResourceType, String> {
    value.parse()
}

impl RunArgs {
    /// Effective run options: config defaults overridden by flags
    fn to_run_config(&self, config: &Config) -> Result<RunConfig> {
        let mut run = RunConfig::from_config(config);

        if let Some(threads) = self.threads {
            if threads == 0 {
                anyhow::bail!("--threads must be at least 1");
            }
            run.threads = threads;
        }

        run.single_threaded = self.single_threaded;
        run.fail_fast = self.fail_fast;
        run.full_refresh = self.full_refresh;
        run.select = self.select.clone();
        run.exclude = self.exclude.clone();
        run.resource_types = self.resource_types.clone();
        run.write_json = self.write_json && !self.no_write_json;

        if let Some(target_path) = &self.target_path {
            run.target_path = target_path.clone();
        }

        if let Some(vars) = &self.vars {
            let overrides: BTreeMap<String, serde_json::Value> =
                serde_json::from_str(vars).context("--vars must be a JSON object")?;
            run.vars.extend(overrides);
        }

        if let Some(timeout) = self.timeout {
            run.timeout_secs = Some(timeout);
        }

        if let Some(send) = self.send_anonymous_usage_stats {
            run.send_anonymous_usage_stats = send;
        }

        Ok(run)
    }
}

fn init_tracing(log_level: Option<&str>, verbose: bool) {
    let filter = match log_level {
        Some(level) => EnvFilter::new(level),
        None if verbose => EnvFilter::new("info"),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env is fine
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref(), cli.verbose);

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            report_fatal(&e);
            ExitCode::from(2)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let config = load_config(cli.config.as_deref(), cli.verbose)?;

    match cli.command {
        Commands::Parse { options } => {
            let run = options.to_run_config(&config)?;
            parse_command(&config, &run, &cli.declarations)
        }
        Commands::Compile { options } => {
            let run = options.to_run_config(&config)?;
            compile_command(&config, &run, &cli.declarations)
        }
        Commands::Run { options } => {
            let run = options.to_run_config(&config)?;
            run_command(&config, &run, &cli.declarations, cli.verbose).await
        }
        Commands::Ls { options } => {
            let run = options.to_run_config(&config)?;
            ls_command(&config, &run, &cli.declarations)
        }
    }
}

fn load_config(path: Option<&Path>, verbose: bool) -> Result<Config> {
    let config = if let Some(config_path) = path {
        Config::from_file(config_path)?
    } else if Path::new("strata.toml").exists() {
        Config::from_file(Path::new("strata.toml"))?
    } else {
        if verbose {
            eprintln!("{}", "No config file found, using defaults".yellow());
        }
        Config::default()
    };

    if verbose {
        eprintln!(
            "{} target {} ({}, {} threads)",
            "Using".cyan(),
            config.target.name,
            config.target.target_type,
            config.target.threads
        );
    }

    Ok(config)
}

/// Print a fatal error, as a diagnostic when it has a stable code
fn report_fatal(error: &anyhow::Error) {
    let diagnostic = if let Some(e) = error.downcast_ref::<BuildError>() {
        Some(e.to_diagnostic())
    } else {
        error.downcast_ref::<ArtifactError>().map(ArtifactError::to_diagnostic)
    };

    match diagnostic {
        Some(diagnostic) => print_diagnostic(&diagnostic),
        None => eprintln!("{} {:#}", "error:".red().bold(), error),
    }
}

fn print_diagnostic(diagnostic: &Diagnostic) {
    let label = match diagnostic.severity {
        Severity::Error => "error".red().bold(),
        Severity::Warn => "warn".yellow().bold(),
        Severity::Info => "info".blue().bold(),
    };

    eprintln!("{}: {}", label, diagnostic);
    if let Some(location) = &diagnostic.location {
        match location.line {
            Some(line) => eprintln!("  {} {}:{}", "-->".blue(), location.file, line),
            None => eprintln!("  {} {}", "-->".blue(), location.file),
        }
    }
}

fn load_project(config: &Config, declarations: &Path) -> Result<Project> {
    info!(declarations = %declarations.display(), "loading project");
    let file = DeclarationsFile::from_file(declarations)?;
    let project = Project::from_declarations(file, &config.project.name)?;

    for diagnostic in project.diagnostics() {
        print_diagnostic(&diagnostic);
    }

    Ok(project)
}

/// Executor sized to the invocation's thread budget
fn executor(run: &RunConfig) -> Arc<dyn Executor> {
    Arc::new(DryRunExecutor::new(run.effective_threads()))
}

fn scheduler(run: &RunConfig, executor: &Arc<dyn Executor>) -> Scheduler {
    Scheduler::new(Arc::clone(executor), SchedulerOptions::from_run(run))
}

fn write_manifest(
    config: &Config,
    run: &RunConfig,
    project: &Project,
    compiled: Option<&CompileOutput>,
    invocation: &Invocation,
) -> Result<()> {
    if !run.write_json {
        return Ok(());
    }

    let mut config = config.clone();
    config.send_anonymous_usage_stats = run.send_anonymous_usage_stats;

    let manifest = WritableManifest::build(project, compiled, &config, invocation, &config.target.target_type);
    let path = ArtifactWriter::new(&run.target_path).write_manifest(&manifest)?;
    info!(path = %path.display(), "manifest written");
    eprintln!("{} {}", "Wrote".green(), path.display());
    Ok(())
}

fn compile_project(config: &Config, run: &RunConfig, project: &Project, executor: &dyn Executor) -> CompileOutput {
    let selection = project.select(run);
    let output = project.compile(&selection, CompileContext::from_run(config, run), executor);

    for error in &output.errors {
        print_diagnostic(&error.to_diagnostic());
    }

    output
}

/// Parse command - resolve the graph and write the manifest
fn parse_command(config: &Config, run: &RunConfig, declarations: &Path) -> Result<ExitCode> {
    let invocation = Invocation::new();
    let project = load_project(config, declarations)?;

    write_manifest(config, run, &project, None, &invocation)?;

    println!(
        "{} {} nodes, {} edges resolved",
        "Parsed".green().bold(),
        project.symbols.len(),
        project.graph.parent_map().values().map(Vec::len).sum::<usize>()
    );

    Ok(exit_code(project.resolution_errors.is_empty()))
}

/// Compile command - render the selected templates
fn compile_command(config: &Config, run: &RunConfig, declarations: &Path) -> Result<ExitCode> {
    let invocation = Invocation::new();
    let project = load_project(config, declarations)?;
    let executor = executor(run);

    let compiled = compile_project(config, run, &project, executor.as_ref());
    write_manifest(config, run, &project, Some(&compiled), &invocation)?;

    println!(
        "{} {} nodes, {} errors",
        "Compiled".green().bold(),
        compiled.compiled.len(),
        compiled.errors.len()
    );

    Ok(exit_code(compiled.errors.is_empty()))
}

/// Run command - compile, then execute in dependency order
async fn run_command(config: &Config, run: &RunConfig, declarations: &Path, verbose: bool) -> Result<ExitCode> {
    let invocation = Invocation::new();
    let project = load_project(config, declarations)?;
    let executor = executor(run);

    let selection = project.select(run);
    let compiled = compile_project(config, run, &project, executor.as_ref());

    let scheduler = scheduler(run, &executor);
    if verbose {
        eprintln!(
            "{} {} nodes with {} workers",
            "Running".cyan(),
            selection.len(),
            scheduler.worker_count()
        );
    }

    let interrupt = scheduler.interrupt();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.trigger();
        }
    });

    let outcome = scheduler.run(&project, &selection, &compiled).await;
    ctrl_c.abort();

    write_manifest(config, run, &project, Some(&compiled), &invocation)?;
    if run.write_json {
        let artifact = RunResultsArtifact::build(&outcome, &compiled, run, &invocation);
        let path = ArtifactWriter::new(&run.target_path).write_run_results(&artifact)?;
        info!(path = %path.display(), results = artifact.results.len(), "run results written");
        eprintln!("{} {}", "Wrote".green(), path.display());
    }

    print_summary(&outcome);
    Ok(exit_code(!outcome.has_failures()))
}

/// Ls command - print selected unique ids in topological order
fn ls_command(config: &Config, run: &RunConfig, declarations: &Path) -> Result<ExitCode> {
    let file = DeclarationsFile::from_file(declarations)?;
    let project = Project::from_declarations(file, &config.project.name)?;

    for unique_id in project.select(run).ids() {
        println!("{}", unique_id);
    }

    Ok(ExitCode::SUCCESS)
}

fn print_summary(outcome: &RunOutcome) {
    for result in outcome.sorted_results() {
        let status = match result.status {
            RunStatus::Success | RunStatus::Pass => result.status.as_str().green(),
            RunStatus::Warn | RunStatus::Skipped => result.status.as_str().yellow(),
            RunStatus::Error | RunStatus::Fail => result.status.as_str().red(),
        };
        let message = result.message.as_deref().unwrap_or("");
        println!("  {:<8} {} {}", status, result.unique_id, message.dimmed());
    }

    let headline = if outcome.interrupted {
        "Interrupted".red().bold()
    } else if outcome.timed_out {
        "Timed out".red().bold()
    } else if outcome.has_failures() {
        "Completed with errors".red().bold()
    } else {
        "Completed successfully".green().bold()
    };

    println!(
        "\n{} in {:.2}s: {} ok, {} warn, {} error, {} skipped",
        headline,
        outcome.elapsed.as_secs_f64(),
        outcome.count(RunStatus::Success) + outcome.count(RunStatus::Pass),
        outcome.count(RunStatus::Warn),
        outcome.count(RunStatus::Error) + outcome.count(RunStatus::Fail),
        outcome.count(RunStatus::Skipped)
    );
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}
