//! Agent requirements written as `operator(key, value)`.

use crate::params::{self, Parameters};
use crate::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Capabilities an agent advertises (`os = Windows10`, `msbuild.path = ...`).
pub type Capabilities = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequirementOp {
    Equals,
    NotEquals,
    Exists,
    NotExists,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Matches,
    MoreThan,
    LessThan,
}

impl RequirementOp {
    fn name(&self) -> &'static str {
        match self {
            RequirementOp::Equals => "equals",
            RequirementOp::NotEquals => "not_equals",
            RequirementOp::Exists => "exists",
            RequirementOp::NotExists => "not_exists",
            RequirementOp::Contains => "contains",
            RequirementOp::NotContains => "not_contains",
            RequirementOp::StartsWith => "starts_with",
            RequirementOp::EndsWith => "ends_with",
            RequirementOp::Matches => "matches",
            RequirementOp::MoreThan => "more_than",
            RequirementOp::LessThan => "less_than",
        }
    }

    fn takes_value(&self) -> bool {
        !matches!(self, RequirementOp::Exists | RequirementOp::NotExists)
    }
}

impl FromStr for RequirementOp {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        let op = match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "equals" => RequirementOp::Equals,
            "not_equals" | "does_not_equal" => RequirementOp::NotEquals,
            "exists" => RequirementOp::Exists,
            "not_exists" | "does_not_exist" => RequirementOp::NotExists,
            "contains" => RequirementOp::Contains,
            "not_contains" | "does_not_contain" => RequirementOp::NotContains,
            "starts_with" => RequirementOp::StartsWith,
            "ends_with" => RequirementOp::EndsWith,
            "matches" => RequirementOp::Matches,
            "more_than" | "no_less_than" => RequirementOp::MoreThan,
            "less_than" | "no_more_than" => RequirementOp::LessThan,
            _ => return Err(()),
        };
        Ok(op)
    }
}

/// A single agent requirement.
///
/// `matches` values are compiled once. A value that still holds a `%name%`
/// reference is compiled after expansion instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Requirement {
    pub key: String,
    pub op: RequirementOp,
    pub value: Option<String>,
    pattern: Option<Regex>,
}

impl PartialEq for Requirement {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.op == other.op && self.value == other.value
    }
}

impl Eq for Requirement {}

impl Requirement {
    pub fn new(key: impl Into<String>, op: RequirementOp, value: Option<String>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() || op.takes_value() != value.is_some() {
            return Err(Error::InvalidRequirement(display(op, &key, value.as_deref())));
        }
        let pattern = match (op, value.as_deref()) {
            (RequirementOp::Matches, Some(value)) => match Regex::new(value) {
                Ok(re) => Some(re),
                Err(_) if !params::references(value).is_empty() => None,
                Err(e) => {
                    return Err(Error::InvalidRequirement(format!(
                        "{}: {}",
                        display(op, &key, Some(value)),
                        e
                    )));
                }
            },
            _ => None,
        };
        Ok(Self {
            key,
            op,
            value,
            pattern,
        })
    }

    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op: RequirementOp::Equals,
            value: Some(value.into()),
            pattern: None,
        }
    }

    pub fn exists(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op: RequirementOp::Exists,
            value: None,
            pattern: None,
        }
    }

    /// Expand `%name%` references in key and value.
    pub fn expand(&self, params: &Parameters) -> Result<Self> {
        Self::new(
            params::interpolate(&self.key, params),
            self.op,
            self.value.as_deref().map(|v| params::interpolate(v, params)),
        )
    }

    /// Check the requirement against an agent's capabilities.
    pub fn is_satisfied_by(&self, capabilities: &Capabilities) -> bool {
        let actual = capabilities.get(&self.key);
        let expected = self.value.as_deref().unwrap_or_default();
        match (self.op, actual) {
            (RequirementOp::Exists, found) => found.is_some(),
            (RequirementOp::NotExists, found) => found.is_none(),
            (RequirementOp::NotEquals, None) | (RequirementOp::NotContains, None) => true,
            (_, None) => false,
            (RequirementOp::Equals, Some(v)) => v == expected,
            (RequirementOp::NotEquals, Some(v)) => v != expected,
            (RequirementOp::Contains, Some(v)) => v.contains(expected),
            (RequirementOp::NotContains, Some(v)) => !v.contains(expected),
            (RequirementOp::StartsWith, Some(v)) => v.starts_with(expected),
            (RequirementOp::EndsWith, Some(v)) => v.ends_with(expected),
            (RequirementOp::Matches, Some(v)) => {
                self.pattern.as_ref().is_some_and(|re| re.is_match(v))
            }
            (RequirementOp::MoreThan, Some(v)) => {
                compare_versions(v, expected) == Ordering::Greater
            }
            (RequirementOp::LessThan, Some(v)) => compare_versions(v, expected) == Ordering::Less,
        }
    }
}

fn display(op: RequirementOp, key: &str, value: Option<&str>) -> String {
    match value {
        Some(value) => format!("{}({}, {})", op.name(), key, value),
        None => format!("{}({})", op.name(), key),
    }
}

/// All requirements hold for the capability set.
pub fn all_satisfied(requirements: &[Requirement], capabilities: &Capabilities) -> bool {
    requirements.iter().all(|r| r.is_satisfied_by(capabilities))
}

/// Compare dotted versions component-wise, numerically where possible.
fn compare_versions(left: &str, right: &str) -> Ordering {
    let mut l = left.split(['.', '-', '_']);
    let mut r = right.split(['.', '-', '_']);
    loop {
        match (l.next(), r.next()) {
            (None, None) => return Ordering::Equal,
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(a), Some(b)) => {
                let ord = match (a.parse::<u64>(), b.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    _ => a.cmp(b),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

impl FromStr for Requirement {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidRequirement(s.to_string());
        let (op, rest) = s.trim().split_once('(').ok_or_else(invalid)?;
        let args = rest.strip_suffix(')').ok_or_else(invalid)?;
        let op: RequirementOp = op.parse().map_err(|_| invalid())?;

        let (key, value) = match args.split_once(',') {
            Some((key, value)) => (key.trim(), Some(value.trim().to_string())),
            None => (args.trim(), None),
        };
        Self::new(key, op, value)
    }
}

impl TryFrom<String> for Requirement {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Requirement> for String {
    fn from(req: Requirement) -> Self {
        req.to_string()
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&display(self.op, &self.key, self.value.as_deref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(pairs: &[(&str, &str)]) -> Capabilities {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_and_display() {
        let req: Requirement = "equals(os, Windows10)".parse().unwrap();
        assert_eq!(req, Requirement::equals("os", "Windows10"));
        assert_eq!(req.to_string(), "equals(os, Windows10)");

        let req: Requirement = "exists(msbuild.path)".parse().unwrap();
        assert_eq!(req, Requirement::exists("msbuild.path"));
    }

    #[test]
    fn test_parse_rejects_bad_arity() {
        assert!("exists(a, b)".parse::<Requirement>().is_err());
        assert!("equals(os)".parse::<Requirement>().is_err());
        assert!("frobnicate(os, x)".parse::<Requirement>().is_err());
        assert!("equals os".parse::<Requirement>().is_err());
    }

    #[test]
    fn test_invalid_pattern_rejected_at_parse() {
        let err = "matches(os, ^Windows(\\d+$)".parse::<Requirement>().unwrap_err();
        assert!(matches!(err, Error::InvalidRequirement(_)));

        let deferred: Requirement = "matches(os, %os.pattern%)".parse().unwrap();
        let params = Parameters::from([("os.pattern".to_string(), "^Win".to_string())]);
        let expanded = deferred.expand(&params).unwrap();
        assert!(expanded.is_satisfied_by(&caps(&[("os", "Windows10")])));
        assert!(!deferred.is_satisfied_by(&caps(&[("os", "Windows10")])));
    }

    #[test]
    fn test_satisfaction() {
        let agent = caps(&[("os", "Windows10"), ("vs.version", "17.8.2")]);
        assert!(Requirement::equals("os", "Windows10").is_satisfied_by(&agent));
        assert!(!Requirement::equals("os", "Linux").is_satisfied_by(&agent));
        assert!(!Requirement::exists("docker").is_satisfied_by(&agent));
        let holds = |text: &str| text.parse::<Requirement>().unwrap().is_satisfied_by(&agent);
        assert!(holds("not_exists(docker)"));
        assert!(holds("more_than(vs.version, 17.4)"));
        assert!(!holds("less_than(vs.version, 17.4)"));
        assert!(holds("matches(os, ^Windows\\d+$)"));
    }

    #[test]
    fn test_version_compare_is_numeric() {
        assert_eq!(compare_versions("10.0", "9.9"), Ordering::Greater);
        assert_eq!(compare_versions("1.2", "1.2.0"), Ordering::Less);
    }
}
