//! xpbuild-core - Build and test driver for SIEM detection content
//!
//! Drives the external `siemj` toolchain through generated pipeline
//! descriptors:
//! - Compiles flat section-based descriptors from typed build stages
//! - Resolves subrule dependencies to narrow correlation compilation
//! - Executes the toolchain with cancellation and output capture
//! - Interprets free-text output into diagnostics and test outcomes

pub mod builder;
pub mod config;
pub mod error;
pub mod executor;
pub mod output;
pub mod pipeline;
pub mod rule;
pub mod runner;
pub mod stage;
pub mod subrule;
pub mod testing;

// Re-export key types
pub use builder::PipelineBuilder;
pub use config::BuildConfig;
pub use error::{Result, XpBuildError};
pub use executor::{ExecutionResult, PipelineExecutor};
pub use output::{
    publish_all, Diagnostic, DiagnosticsSink, FileDiagnostics, InterpretedOutput,
    OutputInterpreter, Range, Severity,
};
pub use pipeline::{ContentPipeline, Outcome, TestRunResult};
pub use rule::Rule;
pub use runner::{ProcessOutput, ProcessRunner, TokioProcessRunner};
pub use stage::{PipelineDocument, Stage, StageKind};
pub use subrule::{CompilationScope, SubruleDependencyResolver, SubruleScanner};
pub use testing::{IntegrationTest, TestStatus, TestStatusTracker};
