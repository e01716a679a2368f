//! High-level content operations composed from the lower layers.
//!
//! Each operation builds a descriptor for one content root, runs it through
//! the executor and interprets the captured output. Stale artifacts that the
//! upcoming stages regenerate are deleted first, so a failed run can never be
//! masked by leftovers from a previous one.

use crate::builder::PipelineBuilder;
use crate::config::BuildConfig;
use crate::error::{Result, XpBuildError};
use crate::executor::{ExecutionResult, PipelineExecutor};
use crate::output::{InterpretedOutput, OutputInterpreter};
use crate::rule::Rule;
use crate::runner::ProcessRunner;
use crate::stage::PipelineDocument;
use crate::subrule::{CompilationScope, SubruleDependencyResolver};
use crate::testing::{IntegrationTest, TestStatusTracker};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Terminal state of an operation. Cancellation is an expected outcome,
/// carried separately from the error channel.
#[derive(Debug)]
pub enum Outcome<T> {
    Completed(T),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }
}

/// Result of one integration-test run: the tests with their updated
/// statuses plus the interpreted toolchain output.
#[derive(Debug)]
pub struct TestRunResult {
    pub tests: Vec<IntegrationTest>,
    pub output: InterpretedOutput,
}

/// Drives the named content operations against one toolchain installation.
pub struct ContentPipeline<'a> {
    config: &'a BuildConfig,
    runner: &'a dyn ProcessRunner,
    interpreter: OutputInterpreter,
    resolver: SubruleDependencyResolver,
}

impl<'a> ContentPipeline<'a> {
    pub fn new(config: &'a BuildConfig, runner: &'a dyn ProcessRunner) -> Self {
        Self {
            config,
            runner,
            interpreter: OutputInterpreter::new(),
            resolver: SubruleDependencyResolver::new(),
        }
    }

    /// Build the tabular-list schema for one content root.
    pub async fn build_schema(
        &self,
        content_root: &Path,
        cancel: &CancellationToken,
    ) -> Result<Outcome<InterpretedOutput>> {
        let root_name = Self::root_name(content_root)?;
        tokio::fs::create_dir_all(self.config.output_folder(&root_name)).await?;

        let mut builder = PipelineBuilder::new(self.config, content_root);
        builder.add_tables_schema();
        let execution = self.execute(builder.build()?, cancel).await?;
        if execution.interrupted {
            return Ok(Outcome::Cancelled);
        }

        let output = self.interpreter.parse(&execution.raw_output);
        info!(root = %root_name, errors = output.has_errors(), "schema build finished");
        Ok(Outcome::Completed(output))
    }

    /// Normalize raw events through the content root that owns `rule` and
    /// return the normalized events.
    pub async fn normalize(
        &self,
        rule: &Rule,
        raw_events_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Outcome<String>> {
        self.validate_raw_events(raw_events_path)?;
        let (root, root_name) = self.root_of(rule)?;
        self.prepare_output(&root_name).await?;

        let mut builder = PipelineBuilder::new(self.config, &root);
        builder.add_normalization_graph();
        builder.add_events_normalize(raw_events_path);
        let execution = self.execute(builder.build()?, cancel).await?;
        if execution.interrupted {
            return Ok(Outcome::Cancelled);
        }

        let events = self
            .read_produced_events(
                &self.config.norm_events_path(&root_name),
                "normalization produced no events",
                &execution,
            )
            .await?;
        Ok(Outcome::Completed(events))
    }

    /// Normalize and then enrich raw events, returning the enriched events.
    pub async fn normalize_and_enrich(
        &self,
        rule: &Rule,
        raw_events_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Outcome<String>> {
        self.validate_raw_events(raw_events_path)?;
        let (root, root_name) = self.root_of(rule)?;
        self.prepare_output(&root_name).await?;

        let mut builder = PipelineBuilder::new(self.config, &root);
        builder.add_normalization_graph();
        builder.add_tables_schema();
        builder.add_tables_db();
        builder.add_enrichment_graph();
        builder.add_events_normalize(raw_events_path);
        builder.add_events_enrich();
        let execution = self.execute(builder.build()?, cancel).await?;
        if execution.interrupted {
            return Ok(Outcome::Cancelled);
        }

        let events = self
            .read_produced_events(
                &self.config.enrich_events_path(&root_name),
                "enrichment produced no events",
                &execution,
            )
            .await?;
        Ok(Outcome::Completed(events))
    }

    /// Build event localizations for one rule directory.
    pub async fn build_localizations(
        &self,
        rule: &Rule,
        cancel: &CancellationToken,
    ) -> Result<Outcome<InterpretedOutput>> {
        let (root, root_name) = self.root_of(rule)?;
        tokio::fs::create_dir_all(self.config.output_folder(&root_name)).await?;

        let rule_dir = rule.directory().to_string_lossy().into_owned();
        let mut builder = PipelineBuilder::new(self.config, &root);
        builder.add_localization_build(Some(&rule_dir));
        let execution = self.execute(builder.build()?, cancel).await?;
        if execution.interrupted {
            return Ok(Outcome::Cancelled);
        }

        let output = self.interpreter.parse(&execution.raw_output);
        info!(rule = rule.name(), errors = output.has_errors(), "localization build finished");
        Ok(Outcome::Completed(output))
    }

    /// Compile every graph of every configured content root, sequentially.
    /// Roots after a failed one are still built; the caller inspects each
    /// interpreted output for diagnostics.
    pub async fn build_all_graphs(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Outcome<Vec<InterpretedOutput>>> {
        let mut results = Vec::new();
        for root in &self.config.content_roots {
            let root_name = Self::root_name(root)?;
            self.prepare_output(&root_name).await?;

            let mut builder = PipelineBuilder::new(self.config, root);
            builder.add_normalization_graph();
            builder.add_tables_schema();
            builder.add_tables_db();
            builder.add_correlation_graph(None);
            builder.add_enrichment_graph();
            let execution = self.execute(builder.build()?, cancel).await?;
            if execution.interrupted {
                return Ok(Outcome::Cancelled);
            }

            let output = self.interpreter.parse(&execution.raw_output);
            if output.has_errors() {
                warn!(root = %root_name, "graph build reported errors");
            }
            results.push(output);
        }
        Ok(Outcome::Completed(results))
    }

    /// Run a rule's integration tests with the given correlation-compilation
    /// scope and return the updated statuses.
    ///
    /// A cancelled run leaves every status unverified.
    pub async fn run_integration_tests(
        &self,
        rule: &Rule,
        scope: CompilationScope,
        cancel: &CancellationToken,
    ) -> Result<Outcome<TestRunResult>> {
        let mut tests = rule.integration_tests()?;
        if tests.is_empty() {
            return Err(XpBuildError::Validation(format!(
                "rule '{}' has no integration tests",
                rule.name()
            )));
        }
        if !tests.iter().any(IntegrationTest::is_complete) {
            return Err(XpBuildError::Validation(format!(
                "rule '{}' has no complete integration test",
                rule.name()
            )));
        }

        let (root, root_name) = self.root_of(rule)?;
        let correlation_src = self.correlation_src(rule, &root, scope)?;
        self.prepare_output(&root_name).await?;

        let mut builder = PipelineBuilder::new(self.config, &root);
        builder.add_normalization_graph();
        builder.add_tables_schema();
        builder.add_tables_db();
        builder.add_enrichment_graph();
        if let Some(src) = &correlation_src {
            builder.add_correlation_graph(Some(src));
        }
        builder.add_tests_run(rule.directory());
        let execution = self.execute(builder.build()?, cancel).await?;
        if execution.interrupted {
            info!(rule = rule.name(), "test run cancelled, statuses left unverified");
            return Ok(Outcome::Cancelled);
        }

        let output = self.interpreter.parse(&execution.raw_output);
        TestStatusTracker::apply(&mut tests, &output);
        Ok(Outcome::Completed(TestRunResult { tests, output }))
    }

    /// The `rules_src` for the correlation-graph stage, or `None` when the
    /// scope skips correlation compilation.
    fn correlation_src(
        &self,
        rule: &Rule,
        root: &Path,
        scope: CompilationScope,
    ) -> Result<Option<String>> {
        let src = match scope {
            CompilationScope::DontCompile => return Ok(None),
            CompilationScope::CurrentRule => rule.directory().to_string_lossy().into_owned(),
            CompilationScope::CurrentPackage => {
                rule.package_path(root)?.to_string_lossy().into_owned()
            }
            CompilationScope::AllPackages => root.to_string_lossy().into_owned(),
            CompilationScope::Auto => {
                let dirs = self.resolver.resolve(
                    &rule.code()?,
                    rule.directory(),
                    &rule.package_path(root)?,
                    root,
                )?;
                if dirs.is_empty() {
                    return Err(XpBuildError::Configuration(format!(
                        "dependency resolution for rule '{}' produced no directories",
                        rule.name()
                    )));
                }
                dirs.iter()
                    .map(|d| d.to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join(",")
            }
        };
        Ok(Some(src))
    }

    fn root_of(&self, rule: &Rule) -> Result<(PathBuf, String)> {
        let root = self
            .config
            .root_containing(rule.directory())
            .ok_or_else(|| {
                XpBuildError::Configuration(format!(
                    "rule '{}' is outside every configured content root",
                    rule.name()
                ))
            })?
            .to_path_buf();
        let root_name = Self::root_name(&root)?;
        Ok((root, root_name))
    }

    fn root_name(root: &Path) -> Result<String> {
        root.file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                XpBuildError::Configuration(format!(
                    "content root has no usable name: {}",
                    root.display()
                ))
            })
    }

    /// Create the root's output folder and delete the artifacts the next run
    /// regenerates.
    async fn prepare_output(&self, root_name: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.config.output_folder(root_name)).await?;
        for stale in [
            self.config.fpta_db_path(root_name),
            self.config.norm_events_path(root_name),
            self.config.enrich_events_path(root_name),
            self.config.corr_events_path(root_name),
        ] {
            match tokio::fs::remove_file(&stale).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn validate_raw_events(&self, raw_events_path: &Path) -> Result<()> {
        if !raw_events_path.is_file() {
            return Err(XpBuildError::Validation(format!(
                "raw events file not found: {}",
                raw_events_path.display()
            )));
        }
        Ok(())
    }

    async fn execute(
        &self,
        doc: PipelineDocument,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let executor = PipelineExecutor::new(self.config, self.runner);
        executor.execute(&doc, &self.config.temp_path, cancel).await
    }

    async fn read_produced_events(
        &self,
        path: &Path,
        missing_message: &str,
        execution: &ExecutionResult,
    ) -> Result<String> {
        let events = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        if events.trim().is_empty() {
            return Err(XpBuildError::Execution {
                message: missing_message.to_string(),
                raw_output: execution.raw_output.clone(),
            });
        }
        Ok(events)
    }
}
