//! One unit of work in a chain.

use serde::{Deserialize, Serialize};

/// Prefix telling the engine to run the command on the submitting host.
pub const LOCAL_PREFIX: &str = "LOCAL ";

/// A command with the paths it produces and the paths it reads.
///
/// Output and dependency lists keep first-seen order and drop repeats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub command: String,
    pub outputs: Vec<String>,
    pub dependencies: Vec<String>,
    pub comment: Option<String>,
    /// Run on the submitting host instead of a worker.
    pub local: bool,
}

impl Rule {
    pub fn new<O, D>(command: impl Into<String>, outputs: O, dependencies: D) -> Self
    where
        O: IntoIterator,
        O::Item: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        Self {
            command: command.into(),
            outputs: dedup(outputs),
            dependencies: dedup(dependencies),
            comment: None,
            local: false,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn run_locally(mut self) -> Self {
        self.local = true;
        self
    }

    /// Command as written into the DAG document.
    pub fn command_line(&self) -> String {
        if self.local {
            format!("{LOCAL_PREFIX}{}", self.command)
        } else {
            self.command.clone()
        }
    }
}

fn dedup<I>(values: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    let mut unique: Vec<String> = Vec::new();
    for value in values {
        let value = value.into();
        if !unique.contains(&value) {
            unique.push(value);
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::Rule;

    #[test]
    fn new_drops_repeated_paths_in_order() {
        let rule = Rule::new("concat", ["out.lmm"], ["b.lmm", "a.lmm", "b.lmm"]);
        assert_eq!(rule.dependencies, vec!["b.lmm", "a.lmm"]);
    }

    #[test]
    fn local_rules_carry_engine_prefix() {
        let rule = Rule::new("stockpile --matrix 1", ["ok"], Vec::<String>::new()).run_locally();
        assert_eq!(rule.command_line(), "LOCAL stockpile --matrix 1");
    }
}
