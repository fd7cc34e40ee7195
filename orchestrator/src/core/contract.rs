//! Architectural contract: the file and dependency surface a story may touch.

use std::collections::BTreeSet;
use std::fmt;

use crate::core::files::normalize_path;
use crate::core::imports::{manifest_dependencies, normalize_dependency, scan_imports};
use crate::core::types::{FileSpec, TaskBreakdown};

/// Workspace state before a story starts: existing files and declared dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Baseline {
    pub files: BTreeSet<String>,
    /// Normalized names declared by the workspace manifests.
    pub dependencies: BTreeSet<String>,
}

/// Allowed files and dependencies for one story. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchitecturalContract {
    story_id: String,
    allowed_files: BTreeSet<String>,
    allowed_deps: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractViolation {
    UndeclaredFile { path: String },
    UndeclaredDependency { name: String, source: String },
}

impl fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractViolation::UndeclaredFile { path } => {
                write!(f, "file `{path}` is not declared by any task")
            }
            ContractViolation::UndeclaredDependency { name, source } => {
                write!(f, "dependency `{name}` (from {source}) was not declared")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContractReport {
    pub violations: Vec<ContractViolation>,
}

impl ContractReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn messages(&self) -> Vec<String> {
        self.violations.iter().map(ToString::to_string).collect()
    }
}

impl ArchitecturalContract {
    /// Baseline files and deps plus everything the breakdown declares.
    pub fn build(baseline: &Baseline, breakdown: &TaskBreakdown) -> Self {
        let mut allowed_files: BTreeSet<String> =
            baseline.files.iter().map(|path| normalize_path(path)).collect();
        for task in &breakdown.tasks {
            allowed_files.extend(task.files().map(normalize_path));
        }
        let mut allowed_deps = baseline.dependencies.clone();
        allowed_deps.extend(breakdown.declared_dependencies().map(normalize_dependency));
        Self {
            story_id: breakdown.story_id.clone(),
            allowed_files,
            allowed_deps,
        }
    }

    pub fn story_id(&self) -> &str {
        &self.story_id
    }

    pub fn allowed_files(&self) -> &BTreeSet<String> {
        &self.allowed_files
    }

    pub fn allowed_deps(&self) -> &BTreeSet<String> {
        &self.allowed_deps
    }

    pub fn allows_file(&self, path: &str) -> bool {
        self.allowed_files.contains(&normalize_path(path))
    }

    pub fn allows_dependency(&self, name: &str) -> bool {
        self.allowed_deps.contains(&normalize_dependency(name))
    }

    /// Check generated files: every path must be allowed, and every dependency
    /// a file introduces (manifest entry or import) must be allowed or already
    /// present in the baseline.
    pub fn enforce(&self, files: &[FileSpec], baseline: &Baseline) -> ContractReport {
        let mut violations = Vec::new();
        let mut local_paths = self.allowed_files.clone();
        local_paths.extend(files.iter().map(|file| normalize_path(&file.path)));
        let mut reported: BTreeSet<String> = BTreeSet::new();

        for file in files {
            let path = normalize_path(&file.path);
            if !self.allowed_files.contains(&path) {
                violations.push(ContractViolation::UndeclaredFile { path: path.clone() });
            }

            let mut introduced: Vec<String> = manifest_dependencies(&path, &file.content)
                .map(|deps| deps.into_iter().collect())
                .unwrap_or_default();
            introduced.extend(scan_imports(&path, &file.content, &local_paths));

            for name in introduced {
                if baseline.dependencies.contains(&name) || self.allowed_deps.contains(&name) {
                    continue;
                }
                if reported.insert(name.clone()) {
                    violations.push(ContractViolation::UndeclaredDependency {
                        name,
                        source: path.clone(),
                    });
                }
            }
        }
        ContractReport { violations }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{DependencyDeclaration, Task};

    fn breakdown(files: &[&str], deps: &[&str]) -> TaskBreakdown {
        TaskBreakdown {
            story_id: "S-1".to_string(),
            tasks: vec![Task {
                task_id: "S-1-T01".to_string(),
                description: "d".to_string(),
                files_to_create: files.iter().map(ToString::to_string).collect(),
                ..Task::default()
            }],
            dependencies: Some(DependencyDeclaration {
                runtime: deps.iter().map(ToString::to_string).collect(),
                dev: Vec::new(),
            }),
            ..TaskBreakdown::default()
        }
    }

    #[test]
    fn undeclared_file_is_rejected() {
        let baseline = Baseline::default();
        let contract = ArchitecturalContract::build(&baseline, &breakdown(&["a.txt"], &[]));
        let report = contract.enforce(&[FileSpec::new("b.txt", "x")], &baseline);
        assert_eq!(
            report.violations,
            vec![ContractViolation::UndeclaredFile {
                path: "b.txt".to_string()
            }]
        );
        assert!(contract.enforce(&[FileSpec::new("./a.txt", "x")], &baseline).is_clean());
    }

    #[test]
    fn only_the_extra_file_is_rejected_next_to_a_declared_one() {
        let baseline = Baseline {
            files: ["server.txt".to_string()].into(),
            dependencies: BTreeSet::new(),
        };
        let contract = ArchitecturalContract::build(&baseline, &breakdown(&["a.txt"], &[]));
        assert_eq!(
            contract.allowed_files().iter().collect::<Vec<_>>(),
            vec!["a.txt", "server.txt"]
        );

        let files = [FileSpec::new("a.txt", "alpha"), FileSpec::new("b.txt", "beta")];
        let report = contract.enforce(&files, &baseline);
        assert_eq!(
            report.violations,
            vec![ContractViolation::UndeclaredFile {
                path: "b.txt".to_string()
            }]
        );
        assert_eq!(report.messages(), vec!["file `b.txt` is not declared by any task"]);
        assert!(contract.enforce(&files[..1], &baseline).is_clean());
    }

    #[test]
    fn contract_contains_baseline_and_declarations() {
        let baseline = Baseline {
            files: ["src/old.js".to_string()].into(),
            dependencies: ["express".to_string()].into(),
        };
        let contract =
            ArchitecturalContract::build(&baseline, &breakdown(&["src/new.js"], &["Zod"]));
        assert!(contract.allows_file("src/old.js"));
        assert!(contract.allows_file("src/new.js"));
        assert!(contract.allows_dependency("express"));
        assert!(contract.allows_dependency("zod"));
        assert!(!contract.allows_dependency("lodash"));
    }

    #[test]
    fn imported_and_manifest_dependencies_must_be_declared() {
        let baseline = Baseline {
            files: BTreeSet::new(),
            dependencies: ["express".to_string()].into(),
        };
        let contract = ArchitecturalContract::build(
            &baseline,
            &breakdown(&["src/app.js", "package.json"], &["zod"]),
        );
        let files = [
            FileSpec::new(
                "src/app.js",
                "const express = require('express');\nconst z = require('zod');\nconst _ = require('lodash');\nconst h = require('./helpers');\n",
            ),
            FileSpec::new(
                "package.json",
                r#"{"dependencies": {"express": "^4", "zod": "^3", "lodash": "^4", "axios": "^1"}}"#,
            ),
        ];
        let report = contract.enforce(&files, &baseline);
        let names: Vec<String> = report
            .violations
            .iter()
            .filter_map(|v| match v {
                ContractViolation::UndeclaredDependency { name, .. } => Some(name.clone()),
                ContractViolation::UndeclaredFile { .. } => None,
            })
            .collect();
        assert_eq!(names, vec!["lodash", "axios"]);
        assert_eq!(report.messages().len(), 2);
    }
}
