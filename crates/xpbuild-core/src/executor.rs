//! Serializes pipeline documents and drives the external toolchain.

use crate::config::BuildConfig;
use crate::error::{Result, XpBuildError};
use crate::runner::ProcessRunner;
use crate::stage::PipelineDocument;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Raw result of one pipeline run, consumed exactly once by the interpreter.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Captured toolchain output (possibly truncated on cancellation).
    pub raw_output: String,

    /// Exit code, absent when the process was killed.
    pub exit_code: Option<i32>,

    /// Whether the run was cancelled. Cancellation is a terminal outcome,
    /// not a failure.
    pub interrupted: bool,
}

/// Writes a descriptor to disk and invokes the toolchain on it.
pub struct PipelineExecutor<'a> {
    config: &'a BuildConfig,
    runner: &'a dyn ProcessRunner,
}

impl<'a> PipelineExecutor<'a> {
    pub fn new(config: &'a BuildConfig, runner: &'a dyn ProcessRunner) -> Self {
        Self { config, runner }
    }

    /// Render `doc` under a fresh subdirectory of `work_dir` and run
    /// `siemj -c <config> main`.
    ///
    /// The binary is checked before spawning: a missing toolchain is a
    /// configuration error, not an execution error. On cancellation the
    /// child is killed and partial output is still returned for
    /// interpretation.
    pub async fn execute(
        &self,
        doc: &PipelineDocument,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        if !self.config.siemj_path.is_file() {
            return Err(XpBuildError::Configuration(format!(
                "toolchain binary not found: {}",
                self.config.siemj_path.display()
            )));
        }

        let run_dir = work_dir.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&run_dir).await?;
        let config_path = run_dir.join("siemj.conf");
        tokio::fs::write(&config_path, doc.render()).await?;

        info!(
            config = %config_path.display(),
            scenario = %doc.scenario.join(" "),
            "executing pipeline"
        );

        let args = vec![
            "-c".to_string(),
            config_path.to_string_lossy().into_owned(),
            "main".to_string(),
        ];
        let process = self
            .runner
            .run(&self.config.siemj_path, &args, cancel)
            .await?;

        if process.interrupted {
            info!("pipeline run interrupted");
        }

        // Successful runs clean up their scratch directory; failed and
        // interrupted runs keep the descriptor for diagnosis.
        if process.succeeded() {
            if let Err(err) = tokio::fs::remove_dir_all(&run_dir).await {
                warn!(dir = %run_dir.display(), %err, "could not remove run directory");
            }
        }

        Ok(ExecutionResult {
            raw_output: process.output,
            exit_code: process.exit_code,
            interrupted: process.interrupted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ProcessOutput;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Runner double that records its invocation. The descriptor is read
    /// back while the "process" runs, before the executor can clean it up.
    struct RecordingRunner {
        calls: Mutex<Vec<(PathBuf, Vec<String>)>>,
        descriptors: Mutex<Vec<String>>,
        output: String,
        exit_code: Option<i32>,
    }

    impl RecordingRunner {
        fn with_exit_code(exit_code: Option<i32>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                descriptors: Mutex::new(Vec::new()),
                output: String::new(),
                exit_code,
            }
        }
    }

    #[async_trait]
    impl ProcessRunner for RecordingRunner {
        async fn run(
            &self,
            command: &Path,
            args: &[String],
            _cancel: &CancellationToken,
        ) -> Result<ProcessOutput> {
            self.calls
                .lock()
                .unwrap()
                .push((command.to_path_buf(), args.to_vec()));
            self.descriptors
                .lock()
                .unwrap()
                .push(std::fs::read_to_string(&args[1]).unwrap_or_default());
            Ok(ProcessOutput {
                output: self.output.clone(),
                exit_code: self.exit_code,
                interrupted: false,
            })
        }
    }

    fn test_config(dir: &Path) -> BuildConfig {
        BuildConfig {
            siemj_path: dir.join("siemj"),
            sdk_path: dir.to_path_buf(),
            build_tools_path: dir.to_path_buf(),
            taxonomy_path: dir.join("taxonomy.json"),
            appendix_path: dir.join("appendix.xp"),
            tables_contract_path: dir.join("tables_contract.yaml"),
            rules_filters_path: dir.join("filters"),
            content_roots: vec![dir.join("content")],
            output_root: dir.join("out"),
            temp_path: dir.join("tmp"),
            correlator_timeout_secs: 45,
        }
    }

    fn test_doc(config: &BuildConfig, root: &Path) -> PipelineDocument {
        let mut builder = crate::builder::PipelineBuilder::new(config, root);
        builder.add_tables_schema();
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn test_missing_binary_fails_before_spawn() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let runner = RecordingRunner::with_exit_code(Some(0));
        let executor = PipelineExecutor::new(&config, &runner);
        let doc = test_doc(&config, &tmp.path().join("content"));

        let err = executor
            .execute(&doc, tmp.path(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, XpBuildError::Configuration(_)));
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_writes_config_and_invokes_toolchain() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        std::fs::write(&config.siemj_path, "").unwrap();

        let runner = RecordingRunner::with_exit_code(Some(0));
        let executor = PipelineExecutor::new(&config, &runner);
        let doc = test_doc(&config, &tmp.path().join("content"));

        let result = executor
            .execute(&doc, tmp.path(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.exit_code, Some(0));
        assert!(!result.interrupted);

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (command, args) = &calls[0];
        assert_eq!(command, &config.siemj_path);
        assert_eq!(args[0], "-c");
        assert_eq!(args[2], "main");

        // The descriptor was on disk at the path handed to the runner.
        let written = &runner.descriptors.lock().unwrap()[0];
        assert!(written.starts_with("[DEFAULT]"));
        assert!(written.contains("[make-tables-schema]"));

        // A successful run leaves no scratch directory behind.
        assert!(!Path::new(&args[1]).exists());
    }

    #[tokio::test]
    async fn test_failed_run_keeps_its_descriptor() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        std::fs::write(&config.siemj_path, "").unwrap();

        let runner = RecordingRunner::with_exit_code(Some(2));
        let executor = PipelineExecutor::new(&config, &runner);
        let doc = test_doc(&config, &tmp.path().join("content"));

        executor
            .execute(&doc, tmp.path(), &CancellationToken::new())
            .await
            .unwrap();

        let calls = runner.calls.lock().unwrap();
        let (_, args) = &calls[0];
        assert!(Path::new(&args[1]).is_file());
    }
}
