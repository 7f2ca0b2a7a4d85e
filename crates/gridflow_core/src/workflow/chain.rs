//! Chains of rules and their DAG documents.
//!
//! # Responsibility
//! - Collect rules in insertion order with queue bookkeeping.
//! - Validate the rule graph before it is written.
//! - Render the plain-text document the workflow engine consumes.
//!
//! # Invariants
//! - `write` never produces a document for an invalid graph.
//! - A dependency is either another rule's output or a path that already
//!   exists; the graph is acyclic.

use super::queue::{ChainSummary, Priority};
use super::rule::Rule;
use crate::model::identity::EntityId;
use crate::model::status::Status;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::error::Error;
use std::fmt::{Display, Formatter, Write as _};
use std::path::{Path, PathBuf};

pub type ChainResult<T> = Result<T, ChainError>;

#[derive(Debug)]
pub enum ChainError {
    Empty,
    NoOutputs {
        rule: usize,
    },
    DuplicateOutput {
        output: String,
        first_rule: usize,
        second_rule: usize,
    },
    SelfDependency {
        rule: usize,
        path: String,
    },
    MissingDependency {
        rule: usize,
        path: String,
    },
    Cycle {
        rules: Vec<usize>,
    },
    MissingLocation,
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl Display for ChainError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "chain has no rules"),
            Self::NoOutputs { rule } => write!(f, "rule {rule} declares no outputs"),
            Self::DuplicateOutput {
                output,
                first_rule,
                second_rule,
            } => write!(
                f,
                "output `{output}` declared by rules {first_rule} and {second_rule}"
            ),
            Self::SelfDependency { rule, path } => {
                write!(f, "rule {rule} depends on its own output `{path}`")
            }
            Self::MissingDependency { rule, path } => write!(
                f,
                "rule {rule} depends on `{path}` which no rule produces and does not exist"
            ),
            Self::Cycle { rules } => write!(f, "rules {rules:?} form a dependency cycle"),
            Self::MissingLocation => write!(f, "chain has no document location"),
            Self::Io { path, source } => {
                write!(f, "failed to write chain `{}`: {source}", path.display())
            }
        }
    }
}

impl Error for ChainError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Leading record of a chain document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainMetadata {
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chain {
    pub id: Option<EntityId>,
    pub owner: String,
    pub gridset_id: Option<EntityId>,
    pub priority: Priority,
    pub status: Status,
    pub status_mod_time: i64,
    /// Unix epoch milliseconds; orders chains of equal priority.
    pub submitted_at: i64,
    /// Where the DAG document is written.
    pub dlocation: Option<String>,
    pub metadata: ChainMetadata,
    pub rules: Vec<Rule>,
    pub mod_time: i64,
}

impl Chain {
    pub fn new(owner: impl Into<String>, priority: Priority, submitted_at: i64) -> Self {
        let owner = owner.into();
        Self {
            id: None,
            metadata: ChainMetadata {
                created_by: owner.clone(),
                description: None,
            },
            owner,
            gridset_id: None,
            priority,
            status: Status::General,
            status_mod_time: submitted_at,
            submitted_at,
            dlocation: None,
            rules: Vec::new(),
            mod_time: submitted_at,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = Some(description.into());
        self
    }

    /// Appends rules, keeping insertion order.
    pub fn add_commands(&mut self, rules: impl IntoIterator<Item = Rule>) {
        self.rules.extend(rules);
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn summary(&self) -> Option<ChainSummary> {
        Some(ChainSummary {
            id: self.id?,
            priority: self.priority,
            status: self.status,
            submitted_at: self.submitted_at,
        })
    }

    /// Checks the rule graph.
    ///
    /// `exists` answers whether a path is present before the chain runs.
    pub fn validate(&self, exists: impl Fn(&str) -> bool) -> ChainResult<()> {
        if self.rules.is_empty() {
            return Err(ChainError::Empty);
        }

        let mut producers: HashMap<&str, usize> = HashMap::new();
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.outputs.is_empty() {
                return Err(ChainError::NoOutputs { rule: index });
            }
            for output in &rule.outputs {
                if let Some(first_rule) = producers.insert(output.as_str(), index) {
                    return Err(ChainError::DuplicateOutput {
                        output: output.clone(),
                        first_rule,
                        second_rule: index,
                    });
                }
            }
        }

        let mut downstream: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); self.rules.len()];
        let mut in_degree = vec![0_usize; self.rules.len()];
        for (index, rule) in self.rules.iter().enumerate() {
            for dependency in &rule.dependencies {
                match producers.get(dependency.as_str()) {
                    Some(&producer) if producer == index => {
                        return Err(ChainError::SelfDependency {
                            rule: index,
                            path: dependency.clone(),
                        });
                    }
                    Some(&producer) => {
                        if downstream[producer].insert(index) {
                            in_degree[index] += 1;
                        }
                    }
                    None if exists(dependency.as_str()) => {}
                    None => {
                        return Err(ChainError::MissingDependency {
                            rule: index,
                            path: dependency.clone(),
                        });
                    }
                }
            }
        }

        // Kahn ordering; whatever is left unvisited sits on a cycle.
        let mut ready: VecDeque<usize> = (0..self.rules.len())
            .filter(|index| in_degree[*index] == 0)
            .collect();
        let mut visited = 0;
        while let Some(index) = ready.pop_front() {
            visited += 1;
            for &next in &downstream[index] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }
        if visited < self.rules.len() {
            let rules = (0..self.rules.len())
                .filter(|index| in_degree[*index] > 0)
                .collect();
            return Err(ChainError::Cycle { rules });
        }

        Ok(())
    }

    /// Renders the DAG document.
    pub fn to_document(&self) -> String {
        let mut document = String::new();
        let _ = writeln!(document, "# created_by: {}", self.metadata.created_by);
        if let Some(description) = &self.metadata.description {
            let _ = writeln!(
                document,
                "# description: {}",
                description.replace(['\n', '\r'], " ")
            );
        }

        for rule in &self.rules {
            document.push('\n');
            if let Some(comment) = &rule.comment {
                let _ = writeln!(document, "# {}", comment.replace(['\n', '\r'], " "));
            }
            let _ = writeln!(
                document,
                "{} : {}",
                rule.outputs.join(" "),
                rule.dependencies.join(" ")
            );
            let _ = writeln!(document, "\t{}", rule.command_line());
        }
        document
    }

    /// Validates against the filesystem and writes the document.
    pub fn write(&self) -> ChainResult<PathBuf> {
        self.write_with(|path| Path::new(path).exists())
    }

    /// Validates with a caller-supplied existence check and writes the document.
    pub fn write_with(&self, exists: impl Fn(&str) -> bool) -> ChainResult<PathBuf> {
        self.validate(exists)?;
        let path = PathBuf::from(self.dlocation.as_deref().ok_or(ChainError::MissingLocation)?);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ChainError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(&path, self.to_document()).map_err(|source| ChainError::Io {
            path: path.clone(),
            source,
        })?;

        info!(
            "event=chain_write module=workflow status=ok rules={} owner={} path={}",
            self.rules.len(),
            self.owner,
            path.display()
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::{Chain, ChainError};
    use crate::workflow::queue::Priority;
    use crate::workflow::rule::Rule;

    fn no_files(_: &str) -> bool {
        false
    }

    #[test]
    fn document_layout_is_stable() {
        let mut chain = Chain::new("alice", Priority::NORMAL, 10).with_description("demo run");
        chain.add_commands([
            Rule::new("make a", ["a.txt"], ["in.txt"]).with_comment("first"),
            Rule::new("make b", ["b.txt"], ["a.txt"]).run_locally(),
        ]);

        let expected = "# created_by: alice\n\
                        # description: demo run\n\
                        \n\
                        # first\n\
                        a.txt : in.txt\n\
                        \tmake a\n\
                        \n\
                        b.txt : a.txt\n\
                        \tLOCAL make b\n";
        assert_eq!(chain.to_document(), expected);
        assert_eq!(chain.to_document(), chain.to_document());
    }

    #[test]
    fn validate_accepts_pre_existing_inputs() {
        let mut chain = Chain::new("alice", Priority::NORMAL, 0);
        chain.add_commands([Rule::new("make a", ["a.txt"], ["in.txt"])]);
        chain.validate(|path| path == "in.txt").unwrap();
    }

    #[test]
    fn validate_rejects_two_producers_for_one_output() {
        let mut chain = Chain::new("alice", Priority::NORMAL, 0);
        chain.add_commands([
            Rule::new("one", ["x"], Vec::<String>::new()),
            Rule::new("two", ["x"], Vec::<String>::new()),
        ]);
        assert!(matches!(
            chain.validate(no_files),
            Err(ChainError::DuplicateOutput {
                first_rule: 0,
                second_rule: 1,
                ..
            })
        ));
    }

    #[test]
    fn validate_rejects_dangling_dependency() {
        let mut chain = Chain::new("alice", Priority::NORMAL, 0);
        chain.add_commands([Rule::new("one", ["x"], ["missing"])]);
        assert!(matches!(
            chain.validate(no_files),
            Err(ChainError::MissingDependency { rule: 0, .. })
        ));
    }

    #[test]
    fn validate_rejects_cycles() {
        let mut chain = Chain::new("alice", Priority::NORMAL, 0);
        chain.add_commands([
            Rule::new("one", ["x"], ["z"]),
            Rule::new("two", ["y"], ["x"]),
            Rule::new("three", ["z"], ["y"]),
            Rule::new("free", ["w"], Vec::<String>::new()),
        ]);
        match chain.validate(no_files) {
            Err(ChainError::Cycle { rules }) => assert_eq!(rules, vec![0, 1, 2]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_empty_chain_and_self_dependency() {
        let chain = Chain::new("alice", Priority::NORMAL, 0);
        assert!(matches!(chain.validate(no_files), Err(ChainError::Empty)));

        let mut chain = Chain::new("alice", Priority::NORMAL, 0);
        chain.add_commands([Rule::new("loop", ["x"], ["x"])]);
        assert!(matches!(
            chain.validate(no_files),
            Err(ChainError::SelfDependency { rule: 0, .. })
        ));
    }

    #[test]
    fn write_without_location_fails_after_validation() {
        let mut chain = Chain::new("alice", Priority::NORMAL, 0);
        chain.add_commands([Rule::new("one", ["x"], Vec::<String>::new())]);
        assert!(matches!(
            chain.write_with(no_files),
            Err(ChainError::MissingLocation)
        ));
    }
}
