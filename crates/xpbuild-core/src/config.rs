//! Build configuration passed explicitly into every component.

use crate::error::{Result, XpBuildError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_correlator_timeout() -> u32 {
    45
}

/// Paths and settings for one toolchain installation plus the content trees
/// it builds. Constructed once by the caller and passed by reference; there
/// is no ambient global configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// The external toolchain binary (`siemj`).
    pub siemj_path: PathBuf,

    /// SDK directory handed to the toolchain as `ptsiem_sdk`.
    pub sdk_path: PathBuf,

    /// Build tools directory handed to the toolchain as `build_tools`.
    pub build_tools_path: PathBuf,

    /// Field taxonomy file.
    pub taxonomy_path: PathBuf,

    /// Normalization appendix (`xp_appendix`).
    pub appendix_path: PathBuf,

    /// Tabular-list contract for schema building.
    pub tables_contract_path: PathBuf,

    /// Rule filter directory (`rfilters_src`).
    pub rules_filters_path: PathBuf,

    /// Top-level directories grouping rule packages.
    pub content_roots: Vec<PathBuf>,

    /// Directory receiving one output folder per content root.
    pub output_root: PathBuf,

    /// Scratch directory for descriptor files.
    pub temp_path: PathBuf,

    /// Correlator timeout (seconds) for the test stage.
    #[serde(default = "default_correlator_timeout")]
    pub correlator_timeout_secs: u32,
}

impl BuildConfig {
    /// Load the configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| XpBuildError::Configuration(format!("{}: {e}", path.display())))
    }

    /// Fail fast when the toolchain or a required source path is missing.
    /// Called before any process is spawned.
    pub fn validate_toolchain(&self) -> Result<()> {
        if !self.siemj_path.is_file() {
            return Err(XpBuildError::Configuration(format!(
                "toolchain binary not found: {}",
                self.siemj_path.display()
            )));
        }
        for (label, path) in [
            ("sdk", &self.sdk_path),
            ("build tools", &self.build_tools_path),
            ("taxonomy", &self.taxonomy_path),
        ] {
            if !path.exists() {
                return Err(XpBuildError::Configuration(format!(
                    "{label} path not found: {}",
                    path.display()
                )));
            }
        }
        if self.content_roots.is_empty() {
            return Err(XpBuildError::Configuration(
                "no content roots configured".to_string(),
            ));
        }
        Ok(())
    }

    /// Output directory for a content root, keyed by its directory name.
    pub fn output_folder(&self, root_name: &str) -> PathBuf {
        self.output_root.join(root_name)
    }

    /// The content root that contains `path`, if any.
    pub fn root_containing(&self, path: &Path) -> Option<&Path> {
        self.content_roots
            .iter()
            .map(PathBuf::as_path)
            .find(|root| path.starts_with(root))
    }

    pub fn formulas_graph_path(&self, root_name: &str) -> PathBuf {
        self.output_folder(root_name).join("formulas_graph.json")
    }

    pub fn schema_path(&self, root_name: &str) -> PathBuf {
        self.output_folder(root_name).join("schema.json")
    }

    pub fn fpta_db_path(&self, root_name: &str) -> PathBuf {
        self.output_folder(root_name).join("fpta_db.db")
    }

    pub fn norm_events_path(&self, root_name: &str) -> PathBuf {
        self.output_folder(root_name).join("norm_events.json")
    }

    pub fn enrich_events_path(&self, root_name: &str) -> PathBuf {
        self.output_folder(root_name).join("enrich_events.json")
    }

    pub fn corr_events_path(&self, root_name: &str) -> PathBuf {
        self.output_folder(root_name).join("corr_events.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &Path) -> BuildConfig {
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

    #[test]
    fn test_validate_missing_binary() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        let err = config.validate_toolchain().unwrap_err();
        assert!(matches!(err, XpBuildError::Configuration(_)));
    }

    #[test]
    fn test_root_containing() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        let rule_dir = tmp.path().join("content/pkg/correlation_rules/My_Rule");
        assert_eq!(
            config.root_containing(&rule_dir),
            Some(tmp.path().join("content").as_path())
        );
        assert_eq!(config.root_containing(Path::new("/elsewhere")), None);
    }

    #[test]
    fn test_artifact_paths_are_per_root() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        assert_eq!(
            config.fpta_db_path("content"),
            tmp.path().join("out/content/fpta_db.db")
        );
        assert_eq!(
            config.norm_events_path("edr"),
            tmp.path().join("out/edr/norm_events.json")
        );
    }
}
