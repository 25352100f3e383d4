//! Kiln CLI
//!
//! A command-line front-end for compiling and running code with kiln.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kiln::{CompilationRequest, CompilationResult, Config, EXAMPLE_CONFIG, Language, ResourceLimits, RunMode, Runner};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{Level, debug, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "A tool for compiling and running untrusted code under resource limits")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path (default: kiln.toml)
        #[arg(short, long, default_value = "kiln.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Compile source code without running it
    Compile {
        /// Source file to compile
        #[arg(value_name = "FILE")]
        source: PathBuf,

        /// Language ID (cpp, c, java); inferred from the extension if omitted
        #[arg(short, long)]
        language: Option<String>,
    },

    /// Compile and run a program
    Run {
        /// Source file to run
        #[arg(value_name = "FILE")]
        source: PathBuf,

        /// Language ID (cpp, c, java); inferred from the extension if omitted
        #[arg(short, long)]
        language: Option<String>,

        /// Input file fed to the program in batch mode
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Always run interactively, bridging this terminal to the program
        #[arg(long, conflicts_with_all = ["batch", "input"])]
        interactive: bool,

        /// Never run interactively
        #[arg(long)]
        batch: bool,

        /// Execution time limit in seconds
        #[arg(short, long)]
        time_limit: Option<f64>,

        /// Memory limit in MB
        #[arg(short, long)]
        memory_limit: Option<u64>,
    },

    /// List supported languages and whether their toolchains are installed
    Languages,

    /// Print the starter template for a language
    Template {
        /// Language ID (cpp, c, java)
        language: String,
    },

    /// Show the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = if let Some(ref path) = cli.config {
        info!(?path, "loading configuration");
        Config::from_file(path).context("failed to load configuration")?
    } else {
        debug!("using default configuration with environment overrides");
        Config::from_env().context("failed to load configuration")?
    };

    match cli.command {
        Commands::Init { output, force } => init_config(&output, force).await,
        Commands::Compile { source, language } => {
            let language = resolve_language(&source, language.as_deref())?;
            run_compile(config, &source, language, cli.json).await
        }
        Commands::Run {
            source,
            language,
            input,
            interactive,
            batch,
            time_limit,
            memory_limit,
        } => {
            let language = resolve_language(&source, language.as_deref())?;
            let mode = if interactive {
                RunMode::Interactive
            } else if batch || input.is_some() {
                RunMode::Batch
            } else {
                RunMode::Auto
            };
            let limits = ResourceLimits {
                execution_timeout: time_limit,
                memory_limit_mb: memory_limit,
                ..ResourceLimits::empty()
            };
            run_program(config, &source, language, input.as_deref(), mode, limits, cli.json).await
        }
        Commands::Languages => {
            list_languages(config)?;
            Ok(())
        }
        Commands::Template { language } => {
            let language: Language = language.parse()?;
            print!("{}", language.template());
            Ok(())
        }
        Commands::ShowConfig => show_config(&config, cli.json),
    }
}

/// Language from the flag, else from the file extension
fn resolve_language(source: &Path, language: Option<&str>) -> Result<Language> {
    if let Some(id) = language {
        return Ok(id.parse()?);
    }
    let extension = source.extension().and_then(|ext| ext.to_str()).unwrap_or_default();
    match extension {
        "cpp" | "cc" | "cxx" => Ok(Language::Cpp),
        "c" => Ok(Language::C),
        "java" => Ok(Language::Java),
        _ => anyhow::bail!(
            "cannot infer the language of '{}', pass --language",
            source.display()
        ),
    }
}

async fn run_compile(config: Config, source: &Path, language: Language, json: bool) -> Result<()> {
    let source_text = tokio::fs::read_to_string(source)
        .await
        .context("failed to read source file")?;
    let runner = Runner::new(config).context("failed to initialize runner")?;

    match runner.compile(&source_text, language, None).await {
        Ok(compiled) => {
            if json {
                let summary = serde_json::json!({
                    "success": true,
                    "hash": compiled.hash.as_str(),
                    "cached": compiled.cached,
                    "compilation_time": compiled.compilation_time.as_secs_f64(),
                    "diagnostics": compiled.diagnostics,
                });
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                if !compiled.diagnostics.is_empty() {
                    eprintln!("{}", compiled.diagnostics);
                }
                info!(
                    hash = compiled.hash.short(),
                    cached = compiled.cached,
                    time = format_args!("{:.3}s", compiled.compilation_time.as_secs_f64()),
                    "compilation succeeded"
                );
            }
            Ok(())
        }
        Err(error) => {
            if json {
                let summary = serde_json::json!({
                    "success": false,
                    "error": error.to_string(),
                    "error_kind": error.kind(),
                });
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                eprintln!("Compilation failed: {error}");
            }
            std::process::exit(1);
        }
    }
}

async fn run_program(
    config: Config,
    source: &Path,
    language: Language,
    input: Option<&Path>,
    mode: RunMode,
    limits: ResourceLimits,
    json: bool,
) -> Result<()> {
    let source_text = tokio::fs::read_to_string(source)
        .await
        .context("failed to read source file")?;
    let stdin = match input {
        Some(path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .context("failed to read input file")?,
        ),
        None => None,
    };

    let runner = Runner::new(config).context("failed to initialize runner")?;
    let mut request = CompilationRequest::new(source_text, language)
        .with_mode(mode)
        .with_limits(limits);
    request.stdin = stdin;

    info!(%language, "running program");
    let result = runner.compile_and_run(request).await;

    if let Some(session_id) = result.session_id {
        if json {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        let exit_code = bridge_session(&runner, session_id).await?;
        std::process::exit(exit_code.unwrap_or(0));
    }

    report(&result, json)?;
    if result.success {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

fn report(result: &CompilationResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    print!("{}", result.stdout);
    if !result.stderr.is_empty() {
        eprint!("{}", result.stderr);
    }
    if result.output_truncated {
        warn!("output was truncated");
    }
    if let Some(ref error) = result.error {
        eprintln!("{}: {error}", error.kind());
    }

    // Log metrics via tracing (stderr), keeping stdout clean for piping
    info!(
        success = result.success,
        cached = result.metrics.cached,
        compile = format_args!("{:.3}s", result.metrics.compilation_time.as_secs_f64()),
        execute = format_args!("{:.3}s", result.metrics.execution_time.as_secs_f64()),
        peak_memory = format_args!("{} KB", result.metrics.peak_memory_bytes / 1024),
        "execution result"
    );
    Ok(())
}

/// Relay this terminal to an interactive session until the program exits.
///
/// Returns the program's exit code.
async fn bridge_session(runner: &Runner, session_id: Uuid) -> Result<Option<i32>> {
    let sessions = runner.sessions();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut ticker = tokio::time::interval(Duration::from_millis(50));

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line.context("failed to read terminal input")? {
                    Some(line) => {
                        if let Err(e) = sessions.send(session_id, &line).await {
                            warn!(error = %e, "failed to send input");
                        }
                    }
                    None => {
                        stdin_open = false;
                        sessions.close_input(session_id).await.ok();
                    }
                }
            }
            _ = ticker.tick() => {
                let output = sessions
                    .drain(session_id)
                    .await
                    .context("session disappeared")?;
                print!("{}", output.stdout);
                eprint!("{}", output.stderr);
                std::io::stdout().flush().context("failed to flush stdout")?;
                if output.session_ended {
                    return Ok(output.exit_code);
                }
            }
        }
    }
}

fn list_languages(config: Config) -> Result<()> {
    let runner = Runner::new(config).context("failed to initialize runner")?;
    println!("Available languages:\n");
    for language in Language::ALL {
        let kind = if language.is_managed() { "managed" } else { "native" };
        let status = match runner.toolchains().check_available(language) {
            Ok(()) => "installed".to_owned(),
            Err(e) => format!("unavailable: {e}"),
        };
        println!("  {:<8} {:<6} ({kind}, {status})", language.id(), language.name());
    }
    Ok(())
}

fn show_config(config: &Config, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
        return Ok(());
    }

    let limits = &config.limits;
    println!("Resource limits:");
    println!("  Compile timeout: {:?}", limits.compile_timeout());
    println!("  Execution timeout: {:?}", limits.execution_timeout());
    println!("  Session timeout: {:?}", limits.session_timeout());
    println!("  Memory limit: {} MB", limits.memory_limit_mb());
    println!("  Max output: {} bytes", limits.max_output_bytes());
    println!();
    println!("Workspace root: {}", config.workspace_root().display());
    println!(
        "Build cache: {} (max {} entries, {} bytes)",
        config.cache_dir().display(),
        config.cache.max_entries,
        config.cache.max_bytes
    );
    println!(
        "Sessions: idle timeout {:?}, reaped every {:?}",
        config.sessions.idle_timeout(),
        config.sessions.reap_interval()
    );
    println!(
        "Scheduler: load thresholds {}/{}%, throttle at {}% CPU or {}% memory",
        config.scheduler.medium_threshold,
        config.scheduler.high_threshold,
        config.scheduler.throttle_cpu_percent,
        config.scheduler.throttle_memory_percent
    );
    Ok(())
}

async fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}
