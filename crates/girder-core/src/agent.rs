//! Agent types.

use crate::requirement::{self, Capabilities, Requirement};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// An executor host as seen by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AgentInfo {
    pub name: String,
    #[serde(default)]
    pub capabilities: Capabilities,
}

impl AgentInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: Capabilities::new(),
        }
    }

    pub fn with_capability(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.capabilities.insert(key.into(), value.into());
        self
    }

    pub fn satisfies(&self, requirements: &[Requirement]) -> bool {
        requirement::all_satisfied(requirements, &self.capabilities)
    }
}
