//! Agent matching for run assignment.

use girder_core::agent::AgentInfo;
use girder_core::requirement::Requirement;
use std::collections::BTreeMap;

/// Matcher for assigning runs to agents.
///
/// Remembers every agent it has seen so it can tell a run that waits for a
/// busy agent from one no agent will ever accept.
#[derive(Debug, Default)]
pub struct AgentMatcher {
    known: BTreeMap<String, AgentInfo>,
}

impl AgentMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: AgentInfo) {
        self.known.insert(agent.name.clone(), agent);
    }

    pub fn deregister(&mut self, name: &str) -> Option<AgentInfo> {
        self.known.remove(name)
    }

    /// Record agents offered for dispatch.
    pub fn observe(&mut self, available: &[AgentInfo]) {
        for agent in available {
            self.known.insert(agent.name.clone(), agent.clone());
        }
    }

    /// First available agent satisfying every requirement.
    pub fn find_available<'a>(
        &self,
        available: &'a [AgentInfo],
        requirements: &[Requirement],
    ) -> Option<&'a AgentInfo> {
        available.iter().find(|agent| agent.satisfies(requirements))
    }

    /// Whether any known agent could ever take the run.
    pub fn can_satisfy(&self, requirements: &[Requirement]) -> bool {
        self.known.values().any(|agent| agent.satisfies(requirements))
    }

    pub fn known(&self) -> impl Iterator<Item = &AgentInfo> {
        self.known.values()
    }
}
