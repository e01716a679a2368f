//! xpbuild - build and test driver for XP SIEM detection content
//!
//! The `xpbuild` command drives the external `siemj` toolchain:
//!
//! ## Commands
//!
//! - `build-schema`: build the tabular-list schema for one content root
//! - `normalize`: run raw events through the normalization graph
//! - `normalize-and-enrich`: normalize and enrich raw events
//! - `build-all-graphs`: compile every graph of every content root
//! - `build-localizations`: build event localizations for one rule
//! - `run-integration-tests`: run one rule's integration tests

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use xpbuild_core::{
    publish_all, BuildConfig, CompilationScope, ContentPipeline, Diagnostic, DiagnosticsSink,
    InterpretedOutput, Outcome, Rule, Severity, TestStatus, TokioProcessRunner,
};

#[derive(Parser)]
#[command(name = "xpbuild")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build and test driver for XP SIEM detection content", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Path to the build configuration file
    #[arg(short, long, global = true, env = "XPBUILD_CONFIG", default_value = "xpbuild.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the tabular-list schema for one content root
    BuildSchema {
        /// Content root directory
        root: PathBuf,
    },

    /// Run raw events through the normalization graph of the rule's root
    Normalize {
        /// Rule directory
        rule: PathBuf,

        /// Raw events file (JSON envelope)
        #[arg(short, long)]
        raw_events: PathBuf,

        /// Write the normalized events here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Normalize raw events and enrich the result
    NormalizeAndEnrich {
        /// Rule directory
        rule: PathBuf,

        /// Raw events file (JSON envelope)
        #[arg(short, long)]
        raw_events: PathBuf,

        /// Write the enriched events here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Compile every graph of every configured content root
    BuildAllGraphs,

    /// Build event localizations for one rule
    BuildLocalizations {
        /// Rule directory
        rule: PathBuf,
    },

    /// Run one rule's integration tests
    RunIntegrationTests {
        /// Rule directory
        rule: PathBuf,

        /// How much correlation content to compile for the run
        #[arg(short, long, value_enum, default_value_t = ScopeArg::Auto)]
        scope: ScopeArg,

        /// Write a JSON report of per-test statuses here
        #[arg(long)]
        report: Option<PathBuf>,
    },
}

/// Correlation-compilation scope for a test run.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScopeArg {
    /// Skip correlation compilation (enrichment-only rules)
    DontCompile,
    /// Compile only the rule under test
    CurrentRule,
    /// Compile the rule's package
    CurrentPackage,
    /// Compile every package of the content root
    AllPackages,
    /// Resolve subrule dependencies and compile just those
    Auto,
}

impl From<ScopeArg> for CompilationScope {
    fn from(value: ScopeArg) -> Self {
        match value {
            ScopeArg::DontCompile => CompilationScope::DontCompile,
            ScopeArg::CurrentRule => CompilationScope::CurrentRule,
            ScopeArg::CurrentPackage => CompilationScope::CurrentPackage,
            ScopeArg::AllPackages => CompilationScope::AllPackages,
            ScopeArg::Auto => CompilationScope::Auto,
        }
    }
}

/// Prints diagnostics to stderr, one line per record.
struct ConsoleSink;

impl DiagnosticsSink for ConsoleSink {
    fn publish(&mut self, file_path: &str, diagnostics: &[Diagnostic]) {
        for diag in diagnostics {
            let severity = match diag.severity {
                Severity::Error => "error",
                Severity::Warning => "warning",
            };
            eprintln!(
                "{file_path}:{}:{}: {severity}: {}",
                diag.range.start_line + 1,
                diag.range.start_col + 1,
                diag.message
            );
        }
    }
}

/// Set up the global tracing subscriber.
///
/// `--verbose` raises this workspace's crates to debug while leaving
/// dependencies at info; `RUST_LOG` overrides the default filter entirely.
/// Safe to call more than once; only the first call takes effect.
fn init_tracing(verbose: bool, json: bool) {
    let default_filter = if verbose {
        "info,xpbuild=debug,xpbuild_core=debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.json().try_init().ok();
    } else {
        builder.try_init().ok();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.json);

    let config = BuildConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    config
        .validate_toolchain()
        .context("toolchain validation failed")?;

    // Ctrl-C cancels the current toolchain run; statuses stay unverified.
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling the current run");
            signal_token.cancel();
        }
    });

    let runner = TokioProcessRunner;
    let pipeline = ContentPipeline::new(&config, &runner);

    match cli.command {
        Commands::BuildSchema { root } => cmd_build_schema(&pipeline, &root, &cancel).await,
        Commands::Normalize {
            rule,
            raw_events,
            output,
        } => cmd_normalize(&pipeline, &rule, &raw_events, output.as_deref(), false, &cancel).await,
        Commands::NormalizeAndEnrich {
            rule,
            raw_events,
            output,
        } => cmd_normalize(&pipeline, &rule, &raw_events, output.as_deref(), true, &cancel).await,
        Commands::BuildAllGraphs => cmd_build_all_graphs(&pipeline, &cancel).await,
        Commands::BuildLocalizations { rule } => {
            cmd_build_localizations(&pipeline, &rule, &cancel).await
        }
        Commands::RunIntegrationTests {
            rule,
            scope,
            report,
        } => cmd_run_tests(&pipeline, &rule, scope.into(), report.as_deref(), &cancel).await,
    }
}

async fn cmd_build_schema(
    pipeline: &ContentPipeline<'_>,
    root: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let outcome = pipeline.build_schema(root, cancel).await?;
    let Outcome::Completed(output) = outcome else {
        println!("Schema build cancelled");
        return Ok(());
    };
    report_diagnostics(&output);
    if output.has_errors() {
        bail!("schema build reported errors");
    }
    println!("Schema built for {}", root.display());
    Ok(())
}

async fn cmd_normalize(
    pipeline: &ContentPipeline<'_>,
    rule_dir: &Path,
    raw_events: &Path,
    output_path: Option<&Path>,
    enrich: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let rule = Rule::from_directory(rule_dir)?;
    let outcome = if enrich {
        pipeline.normalize_and_enrich(&rule, raw_events, cancel).await?
    } else {
        pipeline.normalize(&rule, raw_events, cancel).await?
    };
    let Outcome::Completed(events) = outcome else {
        println!("Run cancelled");
        return Ok(());
    };

    match output_path {
        Some(path) => {
            std::fs::write(path, &events)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Events written to {}", path.display());
        }
        None => print!("{events}"),
    }
    Ok(())
}

async fn cmd_build_localizations(
    pipeline: &ContentPipeline<'_>,
    rule_dir: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let rule = Rule::from_directory(rule_dir)?;
    let outcome = pipeline.build_localizations(&rule, cancel).await?;
    let Outcome::Completed(output) = outcome else {
        println!("Localization build cancelled");
        return Ok(());
    };
    report_diagnostics(&output);
    if output.has_errors() {
        bail!("localization build reported errors");
    }
    println!("Localizations built for {}", rule.name());
    Ok(())
}

async fn cmd_build_all_graphs(
    pipeline: &ContentPipeline<'_>,
    cancel: &CancellationToken,
) -> Result<()> {
    let outcome = pipeline.build_all_graphs(cancel).await?;
    let Outcome::Completed(results) = outcome else {
        println!("Graph build cancelled");
        return Ok(());
    };

    let mut failed = 0usize;
    for output in &results {
        report_diagnostics(output);
        if output.has_errors() {
            failed += 1;
        }
    }
    if failed > 0 {
        bail!("{failed} of {} content roots failed to build", results.len());
    }
    println!("All graphs built ({} content roots)", results.len());
    Ok(())
}

/// One line of the per-test JSON report.
#[derive(Serialize)]
struct TestReportEntry {
    number: u32,
    status: TestStatus,
}

async fn cmd_run_tests(
    pipeline: &ContentPipeline<'_>,
    rule_dir: &Path,
    scope: CompilationScope,
    report: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<()> {
    let rule = Rule::from_directory(rule_dir)?;
    let outcome = pipeline.run_integration_tests(&rule, scope, cancel).await?;
    let Outcome::Completed(result) = outcome else {
        println!("Test run cancelled, statuses left unverified");
        return Ok(());
    };

    report_diagnostics(&result.output);
    if let Some(path) = report {
        let entries: Vec<_> = result
            .tests
            .iter()
            .map(|t| TestReportEntry {
                number: t.number,
                status: t.status,
            })
            .collect();
        std::fs::write(path, serde_json::to_string_pretty(&entries)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    if let Some(message) = &result.output.status_message {
        bail!("{message}");
    }

    let mut failed = 0usize;
    let mut unverified = 0usize;
    for test in &result.tests {
        let verdict = match test.status {
            TestStatus::Success => "ok",
            TestStatus::Failed => {
                failed += 1;
                "FAILED"
            }
            TestStatus::Unknown => {
                unverified += 1;
                "not verified"
            }
        };
        println!("test {} ... {verdict}", test.number);
    }
    if failed > 0 {
        bail!("{failed} of {} tests failed", result.tests.len());
    }
    if unverified > 0 {
        bail!("{unverified} of {} tests were not verified", result.tests.len());
    }
    println!("All {} tests passed", result.tests.len());
    Ok(())
}

fn report_diagnostics(output: &InterpretedOutput) {
    let mut sink = ConsoleSink;
    publish_all(&mut sink, &output.file_diagnostics);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_tracing_init_is_idempotent() {
        init_tracing(true, false);
        init_tracing(false, true);
    }

    #[test]
    fn test_scope_arg_maps_onto_compilation_scope() {
        assert!(matches!(
            CompilationScope::from(ScopeArg::Auto),
            CompilationScope::Auto
        ));
        assert!(matches!(
            CompilationScope::from(ScopeArg::DontCompile),
            CompilationScope::DontCompile
        ));
    }
}
