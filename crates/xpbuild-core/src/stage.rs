//! Pipeline stage definitions and the descriptor wire format.

use serde::{Deserialize, Serialize};

/// Kinds of work the external toolchain can run as a pipeline stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    BuildNormalizationGraph,
    BuildTablesSchema,
    BuildTablesDatabase,
    BuildEnrichmentGraph,
    BuildCorrelationGraph,
    Normalize,
    Enrich,
    Correlate,
    BuildLocalization,
    RunTests,
    /// Synthetic final stage listing the execution order.
    Scenario,
}

impl StageKind {
    /// The `type=` value the toolchain expects for this stage.
    pub fn wire_type(&self) -> &'static str {
        match self {
            StageKind::BuildNormalizationGraph
            | StageKind::BuildEnrichmentGraph
            | StageKind::BuildCorrelationGraph => "BUILD_RULES",
            StageKind::BuildTablesSchema => "BUILD_TABLES_SCHEMA",
            StageKind::BuildTablesDatabase => "BUILD_TABLES_DATABASE",
            StageKind::Normalize => "NORMALIZE",
            StageKind::Enrich => "ENRICH",
            StageKind::Correlate => "CORRELATE",
            StageKind::BuildLocalization => "BUILD_EVENT_LOCALIZATION",
            StageKind::RunTests => "TEST_RULES",
            StageKind::Scenario => "SCENARIO",
        }
    }
}

/// One named unit of work in the pipeline descriptor.
///
/// Parameter order is preserved; values may contain `${stage:key}` or
/// `${output_folder}` placeholders which are emitted verbatim and resolved by
/// the external tool, never by this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Section name, unique within a document.
    pub name: String,

    /// What the stage does.
    pub kind: StageKind,

    /// Ordered key=value parameters (excluding `type`).
    pub params: Vec<(String, String)>,
}

impl Stage {
    pub fn new(name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            kind,
            params: Vec::new(),
        }
    }

    /// Append a parameter, keeping insertion order.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }
}

/// A fully compiled pipeline descriptor.
///
/// Built fresh per operation, rendered once, then discarded. The `scenario`
/// list always equals the stage declaration order (this system never
/// reorders); the final `[main]` stage is appended by the builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDocument {
    /// The `[DEFAULT]` parameter block.
    pub defaults: Vec<(String, String)>,

    /// Declared stages, `[main]` last.
    pub stages: Vec<Stage>,

    /// Names of the stages the scenario executes, in declaration order.
    pub scenario: Vec<String>,
}

impl PipelineDocument {
    /// Render the section-based key=value text the toolchain consumes.
    ///
    /// Section order equals stage declaration order followed by `[main]`.
    pub fn render(&self) -> String {
        let mut out = String::from("[DEFAULT]\n");
        for (key, value) in &self.defaults {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }

        for stage in &self.stages {
            out.push('\n');
            out.push('[');
            out.push_str(&stage.name);
            out.push_str("]\n");
            out.push_str("type=");
            out.push_str(stage.kind.wire_type());
            out.push('\n');
            for (key, value) in &stage.params {
                out.push_str(key);
                out.push('=');
                out.push_str(value);
                out.push('\n');
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_types() {
        assert_eq!(StageKind::BuildNormalizationGraph.wire_type(), "BUILD_RULES");
        assert_eq!(StageKind::BuildCorrelationGraph.wire_type(), "BUILD_RULES");
        assert_eq!(StageKind::BuildTablesSchema.wire_type(), "BUILD_TABLES_SCHEMA");
        assert_eq!(StageKind::RunTests.wire_type(), "TEST_RULES");
        assert_eq!(StageKind::Scenario.wire_type(), "SCENARIO");
    }

    #[test]
    fn test_render_section_order_and_placeholders() {
        let doc = PipelineDocument {
            defaults: vec![("output_folder".to_string(), "/out".to_string())],
            stages: vec![
                Stage::new("make-nfgraph", StageKind::BuildNormalizationGraph)
                    .param("rcc_lang", "n")
                    .param("out", "${output_folder}/formulas_graph.json"),
                Stage::new("main", StageKind::Scenario).param("scenario", "make-nfgraph"),
            ],
            scenario: vec!["make-nfgraph".to_string()],
        };

        let rendered = doc.render();
        let nfgraph_pos = rendered.find("[make-nfgraph]").unwrap();
        let main_pos = rendered.find("[main]").unwrap();
        assert!(rendered.starts_with("[DEFAULT]\noutput_folder=/out\n"));
        assert!(nfgraph_pos < main_pos);
        // Placeholders pass through unresolved.
        assert!(rendered.contains("out=${output_folder}/formulas_graph.json"));
        assert!(rendered.contains("type=SCENARIO\nscenario=make-nfgraph"));
    }
}
