//! Minimal model of a correlation rule on disk.

use crate::error::{Result, XpBuildError};
use crate::testing::IntegrationTest;
use std::path::{Path, PathBuf};

/// A rule directory: `<content root>/<package>/.../<rule name>/rule.co`
/// plus an optional `tests/` subdirectory.
#[derive(Debug, Clone)]
pub struct Rule {
    directory: PathBuf,
    name: String,
}

impl Rule {
    pub fn from_directory(directory: &Path) -> Result<Self> {
        let name = directory
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                XpBuildError::Validation(format!(
                    "not a rule directory: {}",
                    directory.display()
                ))
            })?
            .to_string();
        Ok(Self {
            directory: directory.to_path_buf(),
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn rule_file_path(&self) -> PathBuf {
        self.directory.join("rule.co")
    }

    /// The rule's source code.
    pub fn code(&self) -> Result<String> {
        Ok(std::fs::read_to_string(self.rule_file_path())?)
    }

    /// The package directory: the first path component under the content
    /// root that contains this rule.
    pub fn package_path(&self, content_root: &Path) -> Result<PathBuf> {
        let relative = self.directory.strip_prefix(content_root).map_err(|_| {
            XpBuildError::Validation(format!(
                "rule '{}' is not under content root {}",
                self.name,
                content_root.display()
            ))
        })?;
        let package = relative.components().next().ok_or_else(|| {
            XpBuildError::Validation(format!(
                "rule '{}' sits directly at the content root",
                self.name
            ))
        })?;
        Ok(content_root.join(package))
    }

    /// Scan the rule's `tests/` directory.
    pub fn integration_tests(&self) -> Result<Vec<IntegrationTest>> {
        IntegrationTest::load_all(&self.directory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_rule_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("content");
        let dir = root.join("esc/correlation_rules/Active_Directory_Snapshot");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("rule.co"), "rule Active_Directory_Snapshot: x").unwrap();

        let rule = Rule::from_directory(&dir).unwrap();
        assert_eq!(rule.name(), "Active_Directory_Snapshot");
        assert_eq!(rule.package_path(&root).unwrap(), root.join("esc"));
        assert!(rule.code().unwrap().starts_with("rule "));
    }

    #[test]
    fn test_rule_outside_root_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("elsewhere/My_Rule");
        fs::create_dir_all(&dir).unwrap();

        let rule = Rule::from_directory(&dir).unwrap();
        let err = rule
            .package_path(&tmp.path().join("content"))
            .unwrap_err();
        assert!(matches!(err, XpBuildError::Validation(_)));
    }
}
