//! Subrule reference scanning and dependency resolution.
//!
//! Correlation rules may reference other rules ("subrules") by name inside
//! filter expressions. Compiling a rule's correlation graph then requires the
//! referenced rules' directories as additional inputs. The scan is lexical —
//! a best-effort regex pass over known operations, tolerant of partial or
//! invalid rule syntax — not a parse of the rule language.

use crate::error::{Result, XpBuildError};
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// How much correlation content gets compiled for a test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilationScope {
    /// Skip correlation-graph compilation entirely.
    DontCompile,
    /// Compile only the rule under test.
    CurrentRule,
    /// Compile the rule's package.
    CurrentPackage,
    /// Compile every package under the content root.
    AllPackages,
    /// Let the resolver compute the minimal dependency closure. Requires a
    /// non-empty resolved set; an empty one is an inconsistent configuration.
    Auto,
}

/// Lexical scanner for the operations known to carry subrule names.
pub struct SubruleScanner {
    name_compare: Regex,
    lower_name_compare: Regex,
    in_list: Regex,
    in_list_lower: Regex,
    quoted: Regex,
}

impl SubruleScanner {
    pub fn new() -> Self {
        Self {
            // correlation_name == "Subrule_Name"
            name_compare: Regex::new(r#"correlation_name\s*==\s*"(\w+)""#).expect("static regex"),
            // lower(correlation_name) == "subrule_name"
            lower_name_compare: Regex::new(
                r#"lower\s*\(\s*correlation_name\s*\)\s*==\s*"(\w+)""#,
            )
            .expect("static regex"),
            // in_list(["A", "B"], correlation_name)
            in_list: Regex::new(r"in_list\s*\(\s*(\[[\s\S]*?\])\s*,\s*correlation_name\s*\)")
                .expect("static regex"),
            // in_list(["a", "b"], lower(correlation_name))
            in_list_lower: Regex::new(
                r"in_list\s*\(\s*(\[[\s\S]*?\])\s*,\s*lower\s*\(\s*correlation_name\s*\)",
            )
            .expect("static regex"),
            quoted: Regex::new(r#""(\w+)""#).expect("static regex"),
        }
    }

    /// Whether the rule uses any subrule-referencing construct at all.
    pub fn uses_subrules(&self, rule_code: &str) -> bool {
        self.name_compare.is_match(rule_code)
            || self.lower_name_compare.is_match(rule_code)
            || self.in_list.is_match(rule_code)
            || self.in_list_lower.is_match(rule_code)
    }

    /// Extract referenced subrule names, lower-cased and de-duplicated,
    /// preserving first-appearance order.
    pub fn scan(&self, rule_code: &str) -> Vec<String> {
        let mut names = Vec::new();
        let mut push = |name: &str| {
            let lowered = name.to_lowercase();
            if !names.contains(&lowered) {
                names.push(lowered);
            }
        };

        for cap in self.name_compare.captures_iter(rule_code) {
            push(&cap[1]);
        }
        for cap in self.lower_name_compare.captures_iter(rule_code) {
            push(&cap[1]);
        }
        for list_re in [&self.in_list, &self.in_list_lower] {
            for cap in list_re.captures_iter(rule_code) {
                for name in self.quoted.captures_iter(&cap[1]) {
                    push(&name[1]);
                }
            }
        }

        names
    }
}

impl Default for SubruleScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves the directory set a correlation-graph build must include so that
/// cross-rule references compile.
pub struct SubruleDependencyResolver {
    scanner: SubruleScanner,
}

impl SubruleDependencyResolver {
    pub fn new() -> Self {
        Self {
            scanner: SubruleScanner::new(),
        }
    }

    /// Compute the dependency closure for a rule.
    ///
    /// Search order minimizes the compiled-graph size: the rule's own package
    /// first, the whole content root second. Names that resolve nowhere are
    /// returned as [`XpBuildError::AmbiguousDependencies`]; the resolver
    /// never guesses a wider scope on its own.
    pub fn resolve(
        &self,
        rule_code: &str,
        rule_dir: &Path,
        package_path: &Path,
        content_root: &Path,
    ) -> Result<Vec<PathBuf>> {
        let names = self.scanner.scan(rule_code);
        if names.is_empty() {
            debug!(rule = %rule_dir.display(), "no subrule references, scoping to current package");
            return Ok(vec![package_path.to_path_buf()]);
        }

        let mut resolved = vec![rule_dir.to_path_buf()];
        let mut visited: HashSet<String> = HashSet::new();
        let mut pending = names;

        while !pending.is_empty() {
            pending.retain(|n| !visited.contains(n));
            if pending.is_empty() {
                break;
            }
            for name in &pending {
                visited.insert(name.clone());
            }

            let found = self.locate_all(&pending, package_path, content_root)?;
            pending.clear();

            for dir in found {
                if resolved.contains(&dir) {
                    continue;
                }
                // Walk the closure: a subrule may reference further subrules.
                let subrule_file = dir.join("rule.co");
                if let Ok(code) = std::fs::read_to_string(&subrule_file) {
                    pending.extend(
                        self.scanner
                            .scan(&code)
                            .into_iter()
                            .filter(|n| !visited.contains(n)),
                    );
                }
                resolved.push(dir);
            }
        }

        Ok(resolved)
    }

    /// Find directories for every name, trying the package before the whole
    /// content root. All-or-nothing per search root: partial matches inside
    /// the package widen the search instead of mixing scopes.
    fn locate_all(
        &self,
        names: &[String],
        package_path: &Path,
        content_root: &Path,
    ) -> Result<Vec<PathBuf>> {
        let in_package = find_dirs_by_name(package_path, names);
        if in_package.len() == names.len() {
            return Ok(in_package);
        }

        let missing: Vec<_> = names
            .iter()
            .filter(|n| {
                !in_package
                    .iter()
                    .any(|p| dir_name_matches(p, n))
            })
            .cloned()
            .collect();
        debug!(?missing, "subrules not found in current package, widening to content root");

        let in_root = find_dirs_by_name(content_root, names);
        if in_root.len() == names.len() {
            return Ok(in_root);
        }

        let unresolved: Vec<_> = names
            .iter()
            .filter(|n| !in_root.iter().any(|p| dir_name_matches(p, n)))
            .cloned()
            .collect();
        warn!(?unresolved, "subrules not found anywhere in the content tree");
        Err(XpBuildError::AmbiguousDependencies { unresolved })
    }
}

impl Default for SubruleDependencyResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn dir_name_matches(path: &Path, name: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_lowercase() == *name)
        .unwrap_or(false)
}

/// Depth-first search for directories whose name matches any of `names`
/// (case-insensitive). Returns the first match per name.
fn find_dirs_by_name(root: &Path, names: &[String]) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = Vec::new();
    let mut matched: HashSet<String> = HashSet::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        if matched.len() == names.len() {
            break;
        }
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(dir_name) = path.file_name().and_then(|n| n.to_str()) {
                let lowered = dir_name.to_lowercase();
                if names.contains(&lowered) && !matched.contains(&lowered) {
                    matched.insert(lowered);
                    found.push(path.clone());
                }
            }
            stack.push(path);
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_scan_name_compare() {
        let scanner = SubruleScanner::new();
        let code = r#"filter { correlation_name == "Subrule_Windows_Login" }"#;
        assert_eq!(scanner.scan(code), vec!["subrule_windows_login"]);
        assert!(scanner.uses_subrules(code));
    }

    #[test]
    fn test_scan_lower_and_in_list() {
        let scanner = SubruleScanner::new();
        let code = r#"
            lower( correlation_name ) == "subrule_proxy"
            in_list([
                "Subrule_Host_Access",
                "Subrule_Server_Access"
            ], correlation_name)
        "#;
        let names = scanner.scan(code);
        assert_eq!(
            names,
            vec!["subrule_proxy", "subrule_host_access", "subrule_server_access"]
        );
    }

    #[test]
    fn test_scan_tolerates_broken_syntax() {
        let scanner = SubruleScanner::new();
        let code = "rule Broken: ((( correlation_name == \"Sub_A\" ,,, in_list([";
        assert_eq!(scanner.scan(code), vec!["sub_a"]);
    }

    #[test]
    fn test_scan_dedupes_names() {
        let scanner = SubruleScanner::new();
        let code = r#"
            correlation_name == "Sub_A"
            correlation_name == "sub_a"
        "#;
        assert_eq!(scanner.scan(code), vec!["sub_a"]);
    }

    #[test]
    fn test_no_subrules_scopes_to_package() {
        let tmp = tempfile::tempdir().unwrap();
        let resolver = SubruleDependencyResolver::new();
        let package = tmp.path().join("pkg");
        fs::create_dir_all(&package).unwrap();

        let dirs = resolver
            .resolve("event Login: start", &package.join("My_Rule"), &package, tmp.path())
            .unwrap();
        assert_eq!(dirs, vec![package]);
    }

    #[test]
    fn test_resolver_prefers_package_scope() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("content");
        let package = root.join("esc");
        let rule_dir = package.join("correlation_rules").join("My_Rule");
        let sub_in_package = package.join("correlation_rules").join("Sub_A");
        // A same-named directory outside the package must not be picked up.
        let sub_elsewhere = root.join("other").join("correlation_rules").join("Sub_A");
        for dir in [&rule_dir, &sub_in_package, &sub_elsewhere] {
            fs::create_dir_all(dir).unwrap();
        }

        let resolver = SubruleDependencyResolver::new();
        let dirs = resolver
            .resolve(
                r#"correlation_name == "Sub_A""#,
                &rule_dir,
                &package,
                &root,
            )
            .unwrap();

        assert_eq!(dirs, vec![rule_dir, sub_in_package]);
    }

    #[test]
    fn test_resolver_widens_to_content_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("content");
        let package = root.join("esc");
        let rule_dir = package.join("correlation_rules").join("My_Rule");
        let sub_other_package = root.join("network").join("correlation_rules").join("Sub_B");
        for dir in [&rule_dir, &sub_other_package] {
            fs::create_dir_all(dir).unwrap();
        }

        let resolver = SubruleDependencyResolver::new();
        let dirs = resolver
            .resolve(
                r#"correlation_name == "Sub_B""#,
                &rule_dir,
                &package,
                &root,
            )
            .unwrap();

        assert_eq!(dirs, vec![rule_dir, sub_other_package]);
    }

    #[test]
    fn test_resolver_walks_transitive_closure() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("content");
        let package = root.join("esc");
        let rule_dir = package.join("correlation_rules").join("My_Rule");
        let sub_a = package.join("correlation_rules").join("Sub_A");
        let sub_b = root.join("network").join("correlation_rules").join("Sub_B");
        for dir in [&rule_dir, &sub_a, &sub_b] {
            fs::create_dir_all(dir).unwrap();
        }
        // Sub_A itself references Sub_B.
        fs::write(sub_a.join("rule.co"), r#"correlation_name == "Sub_B""#).unwrap();

        let resolver = SubruleDependencyResolver::new();
        let dirs = resolver
            .resolve(
                r#"correlation_name == "Sub_A""#,
                &rule_dir,
                &package,
                &root,
            )
            .unwrap();

        assert_eq!(dirs, vec![rule_dir, sub_a, sub_b]);
    }

    #[test]
    fn test_unresolved_names_are_ambiguous() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("content");
        let package = root.join("esc");
        let rule_dir = package.join("correlation_rules").join("My_Rule");
        fs::create_dir_all(&rule_dir).unwrap();

        let resolver = SubruleDependencyResolver::new();
        let err = resolver
            .resolve(
                r#"correlation_name == "Sub_Missing""#,
                &rule_dir,
                &package,
                &root,
            )
            .unwrap_err();

        match err {
            XpBuildError::AmbiguousDependencies { unresolved } => {
                assert_eq!(unresolved, vec!["sub_missing"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cyclic_subrules_terminate() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("content");
        let package = root.join("esc");
        let rule_dir = package.join("correlation_rules").join("My_Rule");
        let sub_a = package.join("correlation_rules").join("Sub_A");
        let sub_b = package.join("correlation_rules").join("Sub_B");
        for dir in [&rule_dir, &sub_a, &sub_b] {
            fs::create_dir_all(dir).unwrap();
        }
        fs::write(sub_a.join("rule.co"), r#"correlation_name == "Sub_B""#).unwrap();
        fs::write(sub_b.join("rule.co"), r#"correlation_name == "Sub_A""#).unwrap();

        let resolver = SubruleDependencyResolver::new();
        let dirs = resolver
            .resolve(
                r#"correlation_name == "Sub_A""#,
                &rule_dir,
                &package,
                &root,
            )
            .unwrap();

        assert_eq!(dirs.len(), 3);
    }
}
