//! `+:`/`-:` rule lists shared by branch filters, trigger path rules and
//! artifact rules.
//!
//! A rule list is evaluated in order and the last matching rule wins. Lines
//! without a prefix are inclusions. Artifact rules may carry a destination:
//!
//! ```text
//! +:out/Release/**/*.dll => bin
//! -:out/Release/**/*.pdb
//! ```

use crate::artifact::ArtifactEntry;
use crate::params::{self, Parameters};
use crate::{Error, Result};
use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Token matching the VCS root's default branch.
pub const DEFAULT_BRANCH_TOKEN: &str = "<default>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Include,
    Exclude,
}

/// A single compiled rule line.
#[derive(Debug, Clone)]
pub struct Rule {
    pub action: RuleAction,
    pub pattern: String,
    pub destination: Option<String>,
    matcher: Option<GlobMatcher>,
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.action == other.action
            && self.pattern == other.pattern
            && self.destination == other.destination
    }
}

impl Rule {
    fn parse(line: &str, syntax: Syntax) -> Result<Self> {
        let (action, body) = if let Some(rest) = line.strip_prefix("+:") {
            (RuleAction::Include, rest)
        } else if let Some(rest) = line.strip_prefix("-:") {
            (RuleAction::Exclude, rest)
        } else {
            (RuleAction::Include, line)
        };

        let (pattern, destination) = match body.split_once("=>") {
            Some((pattern, dest)) if syntax == Syntax::Paths => {
                let dest = normalize_path(dest.trim());
                let dest = dest.trim_matches('/').to_string();
                (pattern.trim(), (!dest.is_empty()).then_some(dest))
            }
            _ => (body.trim(), None),
        };

        if pattern.is_empty() {
            return Err(Error::InvalidPattern {
                pattern: line.to_string(),
                reason: "empty pattern".to_string(),
            });
        }

        let pattern = match syntax {
            Syntax::Paths => normalize_path(pattern),
            Syntax::Branches => pattern.to_string(),
        };

        let matcher = if syntax == Syntax::Branches && pattern == DEFAULT_BRANCH_TOKEN {
            None
        } else {
            let glob = GlobBuilder::new(&pattern)
                .literal_separator(syntax == Syntax::Paths)
                .build()
                .map_err(|e| Error::InvalidPattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })?;
            Some(glob.compile_matcher())
        };

        Ok(Self {
            action,
            pattern,
            destination,
            matcher,
        })
    }

    fn matches(&self, candidate: &str, default_branch: Option<&str>) -> bool {
        match &self.matcher {
            Some(matcher) => matcher.is_match(candidate),
            None => default_branch == Some(candidate),
        }
    }

    /// Destination path for a file selected by this rule.
    ///
    /// The part of the path below the pattern's literal directory prefix is
    /// kept, so `out/**/*.dll => bin` maps `out/x64/a.dll` to `bin/x64/a.dll`.
    fn destination_for(&self, path: &str) -> String {
        let prefix = literal_prefix(&self.pattern);
        let relative = path
            .strip_prefix(prefix)
            .map(|rest| rest.trim_start_matches('/'))
            .filter(|rest| !rest.is_empty())
            .unwrap_or(path);
        match &self.destination {
            Some(dest) => format!("{}/{}", dest, relative),
            None => relative.to_string(),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = match self.action {
            RuleAction::Include => '+',
            RuleAction::Exclude => '-',
        };
        write!(f, "{}:{}", sign, self.pattern)?;
        if let Some(dest) = &self.destination {
            write!(f, " => {}", dest)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Syntax {
    Branches,
    Paths,
}

fn parse_rules(text: &str, syntax: Syntax) -> Result<Vec<Rule>> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| Rule::parse(line, syntax))
        .collect()
}

fn last_match<'a>(rules: &'a [Rule], candidate: &str, default: Option<&str>) -> Option<&'a Rule> {
    rules.iter().rev().find(|r| r.matches(candidate, default))
}

/// Filter semantics: empty accepts everything, exclusions alone imply an
/// include-all base rule.
fn filter_accepts(rules: &[Rule], candidate: &str, default: Option<&str>) -> bool {
    if rules.is_empty() {
        return true;
    }
    match last_match(rules, candidate, default) {
        Some(rule) => rule.action == RuleAction::Include,
        None => !rules.iter().any(|r| r.action == RuleAction::Include),
    }
}

fn render(rules: &[Rule]) -> String {
    rules
        .iter()
        .map(Rule::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
}

fn literal_prefix(pattern: &str) -> &str {
    let mut end = 0;
    for (idx, segment) in pattern.match_indices('/') {
        if pattern[end..idx].contains(['*', '?', '[', '{']) {
            return pattern[..end].trim_end_matches('/');
        }
        end = idx + segment.len();
    }
    if pattern[end..].contains(['*', '?', '[', '{']) {
        pattern[..end].trim_end_matches('/')
    } else {
        // Exact file: keep the file name below its directory.
        pattern.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
    }
}

/// Rule text as authored: one multi-line string or a list of lines.
#[derive(Deserialize)]
#[serde(untagged)]
enum RuleText {
    One(String),
    Many(Vec<String>),
}

impl RuleText {
    fn into_text(self) -> String {
        match self {
            RuleText::One(text) => text,
            RuleText::Many(lines) => lines.join("\n"),
        }
    }
}

/// Branch filter used by VCS roots, triggers and artifact dependencies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RuleText", into = "String")]
pub struct BranchFilter {
    rules: Vec<Rule>,
}

impl BranchFilter {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(Self {
            rules: parse_rules(text, Syntax::Branches)?,
        })
    }

    /// Filter accepting every branch.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn matches(&self, branch: &str) -> bool {
        filter_accepts(&self.rules, branch, None)
    }

    /// Match with `<default>` bound to the given default branch.
    pub fn matches_with_default(&self, branch: &str, default_branch: Option<&str>) -> bool {
        filter_accepts(&self.rules, branch, default_branch)
    }

    /// Whether any rule references a `%parameter%`.
    pub fn has_references(&self) -> bool {
        self.rules
            .iter()
            .any(|r| !params::references(&r.pattern).is_empty())
    }

    /// Substitute parameter references. Substituted values match literally.
    pub fn resolve(&self, params: &Parameters) -> Result<Self> {
        if !self.has_references() {
            return Ok(self.clone());
        }
        let text = self
            .rules
            .iter()
            .map(|rule| {
                let sign = match rule.action {
                    RuleAction::Include => "+:",
                    RuleAction::Exclude => "-:",
                };
                let pattern = params::interpolate_with(&rule.pattern, params, globset::escape);
                format!("{}{}", sign, pattern)
            })
            .collect::<Vec<_>>()
            .join("\n");
        Self::parse(&text)
    }

    /// Replace `<default>` rules with a literal match on `default_branch`.
    pub fn bind_default(&self, default_branch: &str) -> Self {
        if !self.rules.iter().any(|r| r.matcher.is_none()) {
            return self.clone();
        }
        let text = self
            .rules
            .iter()
            .map(|rule| {
                let sign = match rule.action {
                    RuleAction::Include => "+:",
                    RuleAction::Exclude => "-:",
                };
                if rule.matcher.is_none() {
                    format!("{}{}", sign, globset::escape(default_branch))
                } else {
                    format!("{}{}", sign, rule.pattern)
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        Self::parse(&text).unwrap_or_else(|_| self.clone())
    }
}

impl TryFrom<RuleText> for BranchFilter {
    type Error = Error;

    fn try_from(text: RuleText) -> Result<Self> {
        Self::parse(&text.into_text())
    }
}

impl From<BranchFilter> for String {
    fn from(filter: BranchFilter) -> Self {
        render(&filter.rules)
    }
}

impl fmt::Display for BranchFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render(&self.rules))
    }
}

impl std::str::FromStr for BranchFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Path rules: artifact publishing, artifact dependency and VCS trigger rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RuleText", into = "String")]
pub struct PathRules {
    rules: Vec<Rule>,
}

impl PathRules {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(Self {
            rules: parse_rules(text, Syntax::Paths)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Filter semantics, used by VCS trigger rules.
    pub fn accepts(&self, path: &str) -> bool {
        filter_accepts(&self.rules, &normalize_path(path), None)
    }

    /// Select files and map them to destinations. Unmatched files are
    /// dropped; an empty rule list selects nothing.
    pub fn select(&self, files: &[String]) -> Vec<ArtifactEntry> {
        files
            .iter()
            .filter_map(|file| {
                let path = normalize_path(file);
                let rule = last_match(&self.rules, &path, None)?;
                (rule.action == RuleAction::Include).then(|| ArtifactEntry {
                    destination: rule.destination_for(&path),
                    source: path,
                })
            })
            .collect()
    }

    /// Like [`PathRules::select`], but an empty rule list keeps every file
    /// at its own path.
    pub fn select_or_all(&self, files: &[String]) -> Vec<ArtifactEntry> {
        if self.rules.is_empty() {
            return files
                .iter()
                .map(|file| {
                    let path = normalize_path(file);
                    ArtifactEntry {
                        source: path.clone(),
                        destination: path,
                    }
                })
                .collect();
        }
        self.select(files)
    }
}

impl TryFrom<RuleText> for PathRules {
    type Error = Error;

    fn try_from(text: RuleText) -> Result<Self> {
        Self::parse(&text.into_text())
    }
}

impl From<PathRules> for String {
    fn from(rules: PathRules) -> Self {
        render(&rules.rules)
    }
}

impl fmt::Display for PathRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render(&self.rules))
    }
}
