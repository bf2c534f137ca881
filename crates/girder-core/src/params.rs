//! Parameter maps and `%name%` reference expansion.

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Ordered parameter map. Ordering keeps dispatch records stable.
pub type Parameters = BTreeMap<String, String>;

/// Branch the run builds.
pub const BUILD_BRANCH: &str = "build.branch";
/// Alias kept for definitions authored against TeamCity parameter names.
pub const BUILD_BRANCH_ALIAS: &str = "teamcity.build.branch";
/// Per build type run counter.
pub const BUILD_COUNTER: &str = "build.counter";
/// Rendered build number.
pub const BUILD_NUMBER: &str = "build.number";
/// Id of the build type being run.
pub const BUILD_TYPE_ID: &str = "build.type.id";

static REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%%|%([A-Za-z0-9_.\-]+)%").expect("reference pattern is valid"));

/// Expand `%name%` references against `params`.
///
/// `%%` yields a literal `%`. Unknown references are left untouched so a
/// later layer can still resolve them.
pub fn interpolate(input: &str, params: &Parameters) -> String {
    interpolate_with(input, params, |value| value.to_string())
}

/// Expand references, passing every substituted value through `escape`.
pub fn interpolate_with<F>(input: &str, params: &Parameters, escape: F) -> String
where
    F: Fn(&str) -> String,
{
    if !input.contains('%') {
        return input.to_string();
    }
    REFERENCE
        .replace_all(input, |caps: &Captures| match caps.get(1) {
            None => "%".to_string(),
            Some(name) => match params.get(name.as_str()) {
                Some(value) => escape(value),
                None => caps[0].to_string(),
            },
        })
        .into_owned()
}

/// Names referenced by `input`, in order of appearance.
pub fn references(input: &str) -> Vec<String> {
    REFERENCE
        .captures_iter(input)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Expand every value of `params` against the map itself.
///
/// References are expanded a bounded number of times so self-referencing
/// values terminate.
pub fn resolve_all(params: &Parameters) -> Parameters {
    let mut resolved = params.clone();
    for _ in 0..8 {
        let next: Parameters = resolved
            .iter()
            .map(|(k, v)| (k.clone(), interpolate(v, &resolved)))
            .collect();
        if next == resolved {
            break;
        }
        resolved = next;
    }
    resolved
}

/// Built-in parameters every run carries.
pub fn builtins(build_type: &str, branch: &str, counter: u64, build_number: &str) -> Parameters {
    let mut params = Parameters::new();
    params.insert(BUILD_BRANCH.to_string(), branch.to_string());
    params.insert(BUILD_BRANCH_ALIAS.to_string(), branch.to_string());
    params.insert(BUILD_COUNTER.to_string(), counter.to_string());
    params.insert(BUILD_NUMBER.to_string(), build_number.to_string());
    params.insert(BUILD_TYPE_ID.to_string(), build_type.to_string());
    params
}

/// Parameters describing only the branch, used to resolve filters before a
/// run exists.
pub fn branch_context(branch: &str) -> Parameters {
    let mut params = Parameters::new();
    params.insert(BUILD_BRANCH.to_string(), branch.to_string());
    params.insert(BUILD_BRANCH_ALIAS.to_string(), branch.to_string());
    params
}
