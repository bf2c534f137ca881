//! Definition registry and effective-configuration resolution.
//!
//! A registry lives for one configuration load. Build types keep a reference
//! to their template; nothing is flattened at registration, so replacing a
//! template is visible to every build type on its next resolution.

use crate::definition::{
    BuildTemplate, BuildType, DEFAULT_BUILD_NUMBER_PATTERN, Dependency, DefinitionSet,
    EffectiveConfig, Project, SelectionRule, Trigger, VcsRoot,
};
use crate::error::EntityKind;
use crate::ids::{BuildTypeId, ProjectId, TemplateId, VcsRootId};
use crate::params::Parameters;
use crate::{Error, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct Registry {
    projects: BTreeMap<ProjectId, Project>,
    vcs_roots: BTreeMap<VcsRootId, VcsRoot>,
    templates: BTreeMap<TemplateId, BuildTemplate>,
    build_types: BTreeMap<BuildTypeId, BuildType>,
    namespace: HashMap<String, EntityKind>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a whole definition set and validate cross references.
    pub fn load(set: DefinitionSet) -> Result<Self> {
        let mut registry = Self::new();
        for project in set.projects {
            registry.register_project(project)?;
        }
        for root in set.vcs_roots {
            registry.register_vcs_root(root)?;
        }
        for template in set.templates {
            registry.register_template(template)?;
        }
        for build_type in set.build_types {
            registry.register_build_type(build_type)?;
        }
        registry.validate()?;

        info!(
            projects = registry.projects.len(),
            vcs_roots = registry.vcs_roots.len(),
            templates = registry.templates.len(),
            build_types = registry.build_types.len(),
            "Definitions loaded"
        );
        Ok(registry)
    }

    fn claim(&mut self, id: &str, kind: EntityKind) -> Result<()> {
        if let Some(existing) = self.namespace.get(id) {
            return Err(Error::DuplicateId {
                id: id.to_string(),
                kind,
                existing: *existing,
            });
        }
        self.namespace.insert(id.to_string(), kind);
        Ok(())
    }

    pub fn register_project(&mut self, project: Project) -> Result<()> {
        self.claim(project.id.as_str(), EntityKind::Project)?;
        self.projects.insert(project.id.clone(), project);
        Ok(())
    }

    pub fn register_vcs_root(&mut self, root: VcsRoot) -> Result<()> {
        self.claim(root.id.as_str(), EntityKind::VcsRoot)?;
        self.vcs_roots.insert(root.id.clone(), root);
        Ok(())
    }

    pub fn register_template(&mut self, template: BuildTemplate) -> Result<()> {
        self.claim(template.id.as_str(), EntityKind::Template)?;
        self.templates.insert(template.id.clone(), template);
        Ok(())
    }

    pub fn register_build_type(&mut self, build_type: BuildType) -> Result<()> {
        self.claim(build_type.id.as_str(), EntityKind::BuildType)?;
        self.build_types.insert(build_type.id.clone(), build_type);
        Ok(())
    }

    /// Swap a template in place, returning the previous definition.
    pub fn replace_template(&mut self, template: BuildTemplate) -> Result<Option<BuildTemplate>> {
        if self.templates.contains_key(&template.id) {
            debug!(template = %template.id, "Replacing template");
            return Ok(self.templates.insert(template.id.clone(), template));
        }
        self.register_template(template)?;
        Ok(None)
    }

    /// Check every cross reference. Dependency cycles are checked by the
    /// graph resolver.
    pub fn validate(&self) -> Result<()> {
        for project in self.projects.values() {
            if let Some(parent) = &project.parent {
                self.require_project(&format!("project {}", project.id), parent)?;
            }
        }
        for root in self.vcs_roots.values() {
            self.require_project(&format!("VCS root {}", root.id), &root.project)?;
        }
        for template in self.templates.values() {
            self.require_project(&format!("template {}", template.id), &template.project)?;
        }
        for build_type in self.build_types.values() {
            let owner = format!("build type {}", build_type.id);
            self.require_project(&owner, &build_type.project)?;
            for root in &build_type.vcs_roots {
                if !self.vcs_roots.contains_key(root) {
                    return Err(Error::UnknownVcsRoot {
                        owner: owner.clone(),
                        vcs_root: root.clone(),
                    });
                }
            }

            let config = self.resolve_effective_config(&build_type.id)?;
            self.validate_references(&config)?;
        }
        Ok(())
    }

    fn require_project(&self, owner: &str, project: &ProjectId) -> Result<()> {
        if self.projects.contains_key(project) {
            Ok(())
        } else {
            Err(Error::UnknownProject {
                owner: owner.to_string(),
                project: project.clone(),
            })
        }
    }

    fn validate_references(&self, config: &EffectiveConfig) -> Result<()> {
        let unknown = |upstream: &BuildTypeId| Error::UnknownDependency {
            build_type: config.build_type.clone(),
            upstream: upstream.clone(),
        };

        for dependency in &config.dependencies {
            if !self.build_types.contains_key(dependency.upstream()) {
                return Err(unknown(dependency.upstream()));
            }
        }
        for trigger in &config.triggers {
            match trigger {
                Trigger::FinishBuild(t) if !self.build_types.contains_key(&t.upstream) => {
                    return Err(unknown(&t.upstream));
                }
                Trigger::Scheduled(t) => {
                    t.schedule(&config.build_type)?;
                }
                _ => {}
            }
        }

        let snapshot_upstreams: HashSet<_> =
            config.snapshot_dependencies().map(|d| &d.upstream).collect();
        for artifact in config.artifact_dependencies() {
            if artifact.selection == SelectionRule::SameChain
                && !snapshot_upstreams.contains(&artifact.upstream)
            {
                return Err(Error::InvalidDependency {
                    build_type: config.build_type.clone(),
                    reason: format!(
                        "artifacts from the same chain need a snapshot dependency on {}",
                        artifact.upstream
                    ),
                });
            }
        }
        Ok(())
    }

    /// Merge project, template and build type layers into one view.
    ///
    /// Parameters: project chain (outermost first), then template, then the
    /// build type's own values; the nearest layer wins. Steps, dependencies
    /// and requirements keep template order and let an own entry with the
    /// same key replace the template's entry in place.
    pub fn resolve_effective_config(&self, id: &BuildTypeId) -> Result<EffectiveConfig> {
        let build_type = self
            .build_types
            .get(id)
            .ok_or_else(|| Error::BuildTypeNotFound(id.clone()))?;

        let template = match &build_type.template {
            Some(template_id) => Some(self.templates.get(template_id).ok_or_else(|| {
                Error::MissingTemplate {
                    build_type: id.clone(),
                    template: template_id.clone(),
                }
            })?),
            None => None,
        };

        let mut params = self.project_params(&build_type.project);
        let mut steps = Vec::new();
        let mut triggers = Vec::new();
        let mut dependencies = Vec::new();
        let mut requirements = Vec::new();
        let mut artifact_rules = build_type.artifact_rules.clone();
        let mut build_number_pattern = build_type.build_number_pattern.clone();

        if let Some(template) = template {
            params.extend(template.params.clone());
            steps = template.steps.clone();
            triggers = template.triggers.clone();
            dependencies = template.dependencies.clone();
            requirements = template.requirements.clone();
            if artifact_rules.is_empty() {
                artifact_rules = template.artifact_rules.clone();
            }
            if build_number_pattern.is_none() {
                build_number_pattern = template.build_number_pattern.clone();
            }
        }

        params.extend(build_type.params.clone());
        let steps = overlay(steps, &build_type.steps, |s| s.name.clone());
        triggers.extend(build_type.triggers.iter().cloned());
        let dependencies = overlay(dependencies, &build_type.dependencies, |d: &Dependency| {
            (d.kind(), d.upstream().clone())
        });
        let requirements = overlay(requirements, &build_type.requirements, |r| {
            (r.key.clone(), r.op)
        });

        Ok(EffectiveConfig {
            build_type: build_type.id.clone(),
            name: build_type.name.clone(),
            project: build_type.project.clone(),
            template: build_type.template.clone(),
            params,
            vcs_roots: build_type.vcs_roots.clone(),
            steps,
            triggers,
            dependencies,
            requirements,
            artifact_rules,
            build_number_pattern: build_number_pattern
                .unwrap_or_else(|| DEFAULT_BUILD_NUMBER_PATTERN.to_string()),
            priority: build_type.priority,
            paused: build_type.paused,
        })
    }

    /// Parameters inherited from the project and its ancestors.
    fn project_params(&self, project: &ProjectId) -> Parameters {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = self.projects.get(project);
        while let Some(p) = current {
            if !seen.insert(&p.id) {
                break;
            }
            chain.push(p);
            current = p.parent.as_ref().and_then(|parent| self.projects.get(parent));
        }

        let mut params = Parameters::new();
        for p in chain.iter().rev() {
            params.extend(p.params.clone());
        }
        params
    }

    /// Default branch of the build type's first VCS root.
    pub fn default_branch(&self, id: &BuildTypeId) -> Option<&str> {
        let build_type = self.build_types.get(id)?;
        let root = build_type.vcs_roots.first()?;
        self.vcs_roots.get(root).map(|r| r.default_branch.as_str())
    }

    /// Branch a build type builds when asked for `requested`.
    ///
    /// A branch outside every bound root's branch specification falls back
    /// to the default branch of the first root.
    pub fn branch_for(&self, id: &BuildTypeId, requested: &str) -> String {
        let Some(build_type) = self.build_types.get(id) else {
            return requested.to_string();
        };
        let roots: Vec<&VcsRoot> = build_type
            .vcs_roots
            .iter()
            .filter_map(|r| self.vcs_roots.get(r))
            .collect();
        let Some(first) = roots.first() else {
            return requested.to_string();
        };
        if roots.iter().any(|root| root.tracks(requested)) {
            requested.to_string()
        } else {
            first.default_branch.clone()
        }
    }

    /// Build types bound to a VCS root.
    pub fn build_types_for_root(&self, root: &VcsRootId) -> Vec<&BuildType> {
        self.build_types
            .values()
            .filter(|bt| bt.vcs_roots.contains(root))
            .collect()
    }

    pub fn project(&self, id: &ProjectId) -> Option<&Project> {
        self.projects.get(id)
    }

    pub fn vcs_root(&self, id: &VcsRootId) -> Option<&VcsRoot> {
        self.vcs_roots.get(id)
    }

    pub fn template(&self, id: &TemplateId) -> Option<&BuildTemplate> {
        self.templates.get(id)
    }

    pub fn build_type(&self, id: &BuildTypeId) -> Option<&BuildType> {
        self.build_types.get(id)
    }

    pub fn build_types(&self) -> impl Iterator<Item = &BuildType> {
        self.build_types.values()
    }

    pub fn build_type_ids(&self) -> impl Iterator<Item = &BuildTypeId> {
        self.build_types.keys()
    }

    pub fn vcs_roots(&self) -> impl Iterator<Item = &VcsRoot> {
        self.vcs_roots.values()
    }

    pub fn templates(&self) -> impl Iterator<Item = &BuildTemplate> {
        self.templates.values()
    }
}

/// Keep `base` order; an `own` item with a matching key replaces the base
/// item in place, others are appended.
fn overlay<T, K, F>(base: Vec<T>, own: &[T], key: F) -> Vec<T>
where
    T: Clone,
    K: PartialEq,
    F: Fn(&T) -> K,
{
    let mut merged = base;
    for item in own {
        let k = key(item);
        match merged.iter().position(|m| key(m) == k) {
            Some(idx) => merged[idx] = item.clone(),
            None => merged.push(item.clone()),
        }
    }
    merged
}
