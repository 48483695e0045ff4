//! Declarative variable references.
//!
//! A `VariableRef` names a value in run state: the trigger input, a step's
//! output, or the scratch variables. The textual form is
//! `trigger.<path>`, `variables.<path>`, or `<step_id>.<path>`, where a path
//! of `.` (or nothing) selects the whole root.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Where a reference is rooted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum VariableSource {
    Trigger,
    Step(String),
    Variables,
}

/// A path into run state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VariableRef {
    pub source: VariableSource,
    /// Dot-delimited path; `"."` selects the root itself.
    pub path: String,
}

impl VariableRef {
    pub fn trigger(path: impl Into<String>) -> Self {
        Self {
            source: VariableSource::Trigger,
            path: path.into(),
        }
    }

    /// Reference into the output of step `step_id`.
    pub fn step(step_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            source: VariableSource::Step(step_id.into()),
            path: path.into(),
        }
    }

    pub fn variable(path: impl Into<String>) -> Self {
        Self {
            source: VariableSource::Variables,
            path: path.into(),
        }
    }

    /// Path segments, empty when the whole root is selected.
    pub fn segments(&self) -> Vec<&str> {
        if self.path.is_empty() || self.path == "." {
            return Vec::new();
        }
        self.path.split('.').filter(|s| !s.is_empty()).collect()
    }
}

/// Error parsing the textual form of a reference.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid variable reference '{0}'")]
pub struct InvalidReference(pub String);

impl FromStr for VariableRef {
    type Err = InvalidReference;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.starts_with('.') {
            return Err(InvalidReference(s.to_string()));
        }

        let (head, rest) = match trimmed.split_once('.') {
            Some((head, rest)) => (head, rest),
            None => (trimmed, "."),
        };
        let rest = if rest.is_empty() { "." } else { rest };

        Ok(match head {
            "trigger" => VariableRef::trigger(rest),
            "variables" => VariableRef::variable(rest),
            step_id => {
                // `research.output.text` and `research.text` address the same value.
                let path = match rest.strip_prefix("output") {
                    Some("") => ".",
                    Some(tail) if tail.starts_with('.') => &tail[1..],
                    _ => rest,
                };
                VariableRef::step(step_id, path)
            }
        })
    }
}

impl fmt::Display for VariableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let root = match &self.source {
            VariableSource::Trigger => "trigger",
            VariableSource::Variables => "variables",
            VariableSource::Step(id) => id.as_str(),
        };
        if self.segments().is_empty() {
            write!(f, "{root}")
        } else {
            write!(f, "{root}.{}", self.path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trigger_reference() {
        let r: VariableRef = "trigger.topic".parse().unwrap();
        assert_eq!(r.source, VariableSource::Trigger);
        assert_eq!(r.segments(), vec!["topic"]);
    }

    #[test]
    fn test_parse_step_reference_strips_output_prefix() {
        let a: VariableRef = "research.output.text".parse().unwrap();
        let b: VariableRef = "research.text".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.source, VariableSource::Step("research".to_string()));

        let whole: VariableRef = "research.output".parse().unwrap();
        assert!(whole.segments().is_empty());
    }

    #[test]
    fn test_output_prefix_requires_segment_boundary() {
        let r: VariableRef = "fetch.outputs.count".parse().unwrap();
        assert_eq!(r.segments(), vec!["outputs", "count"]);
    }

    #[test]
    fn test_parse_bare_root_selects_everything() {
        let r: VariableRef = "variables".parse().unwrap();
        assert_eq!(r.source, VariableSource::Variables);
        assert!(r.segments().is_empty());
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!("".parse::<VariableRef>().is_err());
        assert!(".text".parse::<VariableRef>().is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        let r = VariableRef::step("writing", "text");
        assert_eq!(r.to_string(), "writing.text");
        assert_eq!(r.to_string().parse::<VariableRef>().unwrap(), r);
        assert_eq!(VariableRef::trigger(".").to_string(), "trigger");
    }
}
