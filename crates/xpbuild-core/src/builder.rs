//! Compiles pipeline descriptors from optional build stages.

use crate::config::BuildConfig;
use crate::error::{Result, XpBuildError};
use crate::stage::{PipelineDocument, Stage, StageKind};
use regex::Regex;
use std::path::Path;

/// Incrementally assembles a [`PipelineDocument`] for one content root.
///
/// Each `add_*` method is idempotent by stage name: re-adding a stage
/// replaces its parameters without duplicating the scenario entry. Methods
/// only reference stages that the documented call order has already added,
/// which keeps the declaration-order invariant satisfied by construction.
/// The builder performs no filesystem checks; callers validate inputs before
/// building.
pub struct PipelineBuilder<'a> {
    config: &'a BuildConfig,
    content_root: String,
    stages: Vec<Stage>,
    scenario: Vec<String>,
}

impl<'a> PipelineBuilder<'a> {
    /// Start a descriptor for the given content root. The `[DEFAULT]` block
    /// is derived from the configuration; the output folder is keyed by the
    /// root's directory name.
    pub fn new(config: &'a BuildConfig, content_root: &Path) -> Self {
        Self {
            config,
            content_root: content_root.to_string_lossy().into_owned(),
            stages: Vec::new(),
            scenario: Vec::new(),
        }
    }

    fn root_name(content_root: &str) -> &str {
        Path::new(content_root)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(content_root)
    }

    /// Add or replace a stage, keeping the scenario free of duplicates.
    fn push_stage(&mut self, stage: Stage) {
        if let Some(existing) = self.stages.iter_mut().find(|s| s.name == stage.name) {
            *existing = stage;
            return;
        }
        self.scenario.push(stage.name.clone());
        self.stages.push(stage);
    }

    /// `[make-nfgraph]` — compile the normalization-formula graph.
    pub fn add_normalization_graph(&mut self) -> &mut Self {
        let stage = Stage::new("make-nfgraph", StageKind::BuildNormalizationGraph)
            .param("rcc_lang", "n")
            .param("rules_src", &self.content_root)
            .param(
                "xp_appendix",
                self.config.appendix_path.to_string_lossy(),
            )
            .param("out", "${output_folder}/formulas_graph.json");
        self.push_stage(stage);
        self
    }

    /// `[make-tables-schema]` — build the tabular-list schema.
    pub fn add_tables_schema(&mut self) -> &mut Self {
        let stage = Stage::new("make-tables-schema", StageKind::BuildTablesSchema)
            .param("table_list_schema_src", &self.content_root)
            .param(
                "contract",
                self.config.tables_contract_path.to_string_lossy(),
            )
            .param("out", "${output_folder}");
        self.push_stage(stage);
        self
    }

    /// `[make-tables-db]` — fill the tabular-list database from the schema.
    pub fn add_tables_db(&mut self) -> &mut Self {
        let stage = Stage::new("make-tables-db", StageKind::BuildTablesDatabase)
            .param("table_list_filltype", "All")
            .param("table_list_schema", "${output_folder}/schema.json")
            .param(
                "table_list_defaults",
                "${output_folder}/correlation_defaults.json",
            )
            .param("out", "${output_folder}/fpta_db.db");
        self.push_stage(stage);
        self
    }

    /// `[make-ergraph]` — compile the enrichment graph.
    pub fn add_enrichment_graph(&mut self) -> &mut Self {
        let stage = Stage::new("make-ergraph", StageKind::BuildEnrichmentGraph)
            .param("rcc_lang", "e")
            .param("rules_src", &self.content_root)
            .param(
                "rfilters_src",
                self.config.rules_filters_path.to_string_lossy(),
            )
            .param("table_list_schema", "${output_folder}/schema.json")
            .param("out", "${output_folder}/enrules_graph.json");
        self.push_stage(stage);
        self
    }

    /// `[make-crgraph]` — compile the correlation graph. `rules_src`
    /// overrides the compiled scope (comma-separated directories); the
    /// default compiles the whole content root. Graph compilation cost
    /// scales with the input size, so callers pass the narrowest scope the
    /// subrule resolver allows.
    pub fn add_correlation_graph(&mut self, rules_src: Option<&str>) -> &mut Self {
        let stage = Stage::new("make-crgraph", StageKind::BuildCorrelationGraph)
            .param("rcc_lang", "c")
            .param(
                "rules_src",
                match rules_src {
                    Some(s) => s.to_string(),
                    None => self.content_root.clone(),
                },
            )
            .param(
                "rfilters_src",
                self.config.rules_filters_path.to_string_lossy(),
            )
            .param("table_list_schema", "${output_folder}/schema.json")
            .param("out", "${output_folder}/corrules_graph.json");
        self.push_stage(stage);
        self
    }

    /// `[make-loca]` — build event localizations.
    pub fn add_localization_build(&mut self, rules_src: Option<&str>) -> &mut Self {
        let stage = Stage::new("make-loca", StageKind::BuildLocalization)
            .param(
                "rules_src",
                match rules_src {
                    Some(s) => s.to_string(),
                    None => self.content_root.clone(),
                },
            )
            .param("out", "${output_folder}/langs");
        self.push_stage(stage);
        self
    }

    /// `[run-normalize]` — run raw events through the normalization graph.
    pub fn add_events_normalize(&mut self, raw_events_path: &Path) -> &mut Self {
        let stage = Stage::new("run-normalize", StageKind::Normalize)
            .param("formulas", "${output_folder}/formulas_graph.json")
            .param("in", raw_events_path.to_string_lossy())
            .param("raw_without_envelope", "no")
            .param("print_statistics", "yes")
            .param("not_norm_events", "${output_folder}/not_normalized.json")
            .param("out", "${output_folder}/norm_events.json");
        self.push_stage(stage);
        self
    }

    /// `[run-enrich]` — enrich the normalized events.
    pub fn add_events_enrich(&mut self) -> &mut Self {
        let stage = Stage::new("run-enrich", StageKind::Enrich)
            .param("enrules", "${output_folder}/enrules_graph.json")
            .param("in", "${run-normalize:out}")
            .param("out", "${output_folder}/enrich_events.json");
        self.push_stage(stage);
        self
    }

    /// `[run-correlate]` — correlate the enriched events.
    pub fn add_events_correlate(&mut self) -> &mut Self {
        let stage = Stage::new("run-correlate", StageKind::Correlate)
            .param("corrules", "${make-crgraph:out}")
            .param("in", "${run-enrich:out}")
            .param("table_list_database", "${output_folder}/fpta_db.db")
            .param("out", "${output_folder}/corr_events.json");
        self.push_stage(stage);
        self
    }

    /// `[rules-tests]` — run the integration tests found under `rule_dir`.
    /// Graph inputs are referenced only when the corresponding build stage
    /// was added, so a run without correlation compilation stays valid.
    pub fn add_tests_run(&mut self, rule_dir: &Path) -> &mut Self {
        let mut stage = Stage::new("rules-tests", StageKind::RunTests).param(
            "cr_timeout",
            self.config.correlator_timeout_secs.to_string(),
        );
        for (graph_stage, key) in [
            ("make-nfgraph", "formulas"),
            ("make-ergraph", "enrules"),
            ("make-crgraph", "corrules"),
        ] {
            if self.stages.iter().any(|s| s.name == graph_stage) {
                stage = stage.param(key, format!("${{{graph_stage}:out}}"));
            }
        }
        let stage = stage
            .param(
                "table_list_defaults",
                "${output_folder}/correlation_defaults.json",
            )
            .param("rules_src", rule_dir.to_string_lossy());
        self.push_stage(stage);
        self
    }

    /// Finish the document: append the synthetic `[main]` scenario stage and
    /// verify that every `${stage:key}` reference points at an
    /// earlier-declared stage. The check is a guard rail; the add methods
    /// satisfy it by construction when called in dependency order.
    pub fn build(mut self) -> Result<PipelineDocument> {
        if self.scenario.is_empty() {
            return Err(XpBuildError::Pipeline(
                "no stages were added to the pipeline".to_string(),
            ));
        }

        let reference = Regex::new(r"\$\{([A-Za-z0-9_-]+):").expect("static regex");
        for (index, stage) in self.stages.iter().enumerate() {
            for (_, value) in &stage.params {
                for cap in reference.captures_iter(value) {
                    let referenced = &cap[1];
                    let declared_earlier = self.stages[..index]
                        .iter()
                        .any(|s| s.name == referenced);
                    if !declared_earlier {
                        return Err(XpBuildError::Pipeline(format!(
                            "stage '{}' references '{referenced}' which is not declared earlier",
                            stage.name
                        )));
                    }
                }
            }
        }

        let main = Stage::new("main", StageKind::Scenario)
            .param("scenario", self.scenario.join(" "));
        self.stages.push(main);

        let root_name = Self::root_name(&self.content_root).to_string();
        let output_folder = self.config.output_folder(&root_name);
        let defaults = vec![
            (
                "ptsiem_sdk".to_string(),
                self.config.sdk_path.to_string_lossy().into_owned(),
            ),
            (
                "build_tools".to_string(),
                self.config.build_tools_path.to_string_lossy().into_owned(),
            ),
            (
                "taxonomy".to_string(),
                self.config.taxonomy_path.to_string_lossy().into_owned(),
            ),
            (
                "output_folder".to_string(),
                output_folder.to_string_lossy().into_owned(),
            ),
            (
                "temp".to_string(),
                self.config.temp_path.to_string_lossy().into_owned(),
            ),
        ];

        Ok(PipelineDocument {
            defaults,
            stages: self.stages,
            scenario: self.scenario,
        })
    }
}
