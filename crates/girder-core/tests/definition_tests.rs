//! Definition ingestion and effective-configuration tests for girder-core.

use girder_core::definition::*;
use girder_core::error::{EntityKind, Error};
use girder_core::registry::Registry;
use girder_core::requirement::{Requirement, RequirementOp};
use girder_core::run::Priority;
use pretty_assertions::assert_eq;

const DEFINITIONS: &str = r#"
projects:
  - id: Root
    name: Root
    params:
      vendor: acme
  - id: Native
    name: Native
    parent: Root
vcs_roots:
  - id: MainRepo
    project: Root
    name: main repository
    url: https://git.example.com/main.git
    default_branch: master
    branch_spec: |
      +:feature/*
      +:release/*
templates:
  - id: WindowsNative
    project: Native
    name: Windows native build
    params:
      arch: x64
      config: Release
    steps:
      - name: configure
        script: cmake -A %arch% .
      - name: build
        script: cmake --build . --config %config%
    requirements:
      - equals(os, Windows10)
      - exists(msbuild.path)
    artifact_rules: "out/**/*.dll => bin"
build_types:
  - id: Deps
    project: Native
    name: Dependencies
    template: WindowsNative
    vcs_roots: [MainRepo]
    params:
      config: Debug
    steps:
      - name: build
        script: msbuild deps.sln
    triggers:
      - type: vcs
        branch_filter:
          - "+:<default>"
          - "+:feature/*"
        quiet_period_secs: 60
  - id: App
    project: Native
    name: Application
    template: WindowsNative
    vcs_roots: [MainRepo]
    priority: high
    build_number_pattern: "1.0.%build.counter%"
    dependencies:
      - kind: snapshot
        upstream: Deps
        on_failure: fail_to_start
      - kind: artifact
        upstream: Deps
        selection:
          rule: same_chain
        rules: "bin/*.dll => lib"
    triggers:
      - type: finish_build
        upstream: Deps
        branch_filter: "+:%teamcity.build.branch%"
"#;

fn load() -> Registry {
    let set: DefinitionSet = serde_yaml::from_str(DEFINITIONS).expect("parse definitions");
    Registry::load(set).expect("load definitions")
}

#[test]
fn test_yaml_definitions_load() {
    let registry = load();
    assert_eq!(registry.build_types().count(), 2);
    assert_eq!(registry.default_branch(&"App".into()), Some("master"));
    let root = registry.vcs_root(&"MainRepo".into()).unwrap();
    assert!(root.branch_spec.matches("feature/login"));
    assert!(!root.branch_spec.matches("hotfix/1"));
}

#[test]
fn test_effective_config_merges_layers() {
    let registry = load();
    let deps = registry.resolve_effective_config(&"Deps".into()).unwrap();

    assert_eq!(deps.params["vendor"], "acme");
    assert_eq!(deps.params["arch"], "x64");
    assert_eq!(deps.params["config"], "Debug");

    let steps: Vec<_> = deps.steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(steps, vec!["configure", "build"]);
    assert_eq!(deps.steps[1].script.as_deref(), Some("msbuild deps.sln"));

    assert_eq!(deps.requirements.len(), 2);
    assert_eq!(deps.requirements[1].op, RequirementOp::Exists);
    assert!(deps.artifact_rules.accepts("out/x64/zlib.dll"));
    assert_eq!(deps.build_number_pattern, DEFAULT_BUILD_NUMBER_PATTERN);
    assert_eq!(deps.priority, None);
}

#[test]
fn test_effective_config_keeps_own_values() {
    let registry = load();
    let app = registry.resolve_effective_config(&"App".into()).unwrap();

    assert_eq!(app.priority, Some(Priority::High));
    assert_eq!(app.build_number_pattern, "1.0.%build.counter%");
    assert_eq!(app.snapshot_dependencies().count(), 1);
    let artifact = app.artifact_dependencies().next().unwrap();
    assert_eq!(artifact.selection, SelectionRule::SameChain);
    assert!(artifact.mandatory);

    match &app.triggers[0] {
        Trigger::FinishBuild(t) => {
            assert!(t.successful_only);
            assert!(t.branch_filter.has_references());
        }
        other => panic!("unexpected trigger: {other:?}"),
    }
}

#[test]
fn test_effective_config_reflects_template_edit() {
    let mut registry = load();
    let mut template = registry.template(&"WindowsNative".into()).unwrap().clone();
    template.params.insert("arch".to_string(), "arm64".to_string());
    template.requirements = vec![Requirement::equals("os", "Windows11")];
    registry.replace_template(template).unwrap();

    for id in ["Deps", "App"] {
        let config = registry.resolve_effective_config(&id.into()).unwrap();
        assert_eq!(config.params["arch"], "arm64");
        assert_eq!(config.requirements, vec![Requirement::equals("os", "Windows11")]);
    }
}

#[test]
fn test_duplicate_id_is_rejected() {
    let mut set: DefinitionSet = serde_yaml::from_str(DEFINITIONS).unwrap();
    let mut clash = set.build_types[0].clone();
    clash.id = "WindowsNative".into();
    set.build_types.push(clash);

    let err = Registry::load(set).unwrap_err();
    match err {
        Error::DuplicateId { id, kind, existing } => {
            assert_eq!(id, "WindowsNative");
            assert_eq!(kind, EntityKind::BuildType);
            assert_eq!(existing, EntityKind::Template);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_missing_template_is_rejected() {
    let mut set: DefinitionSet = serde_yaml::from_str(DEFINITIONS).unwrap();
    set.templates.clear();

    let err = Registry::load(set).unwrap_err();
    assert!(matches!(err, Error::MissingTemplate { .. }));
}

#[test]
fn test_same_chain_without_snapshot_dependency_is_rejected() {
    let mut set: DefinitionSet = serde_yaml::from_str(DEFINITIONS).unwrap();
    let app = set
        .build_types
        .iter_mut()
        .find(|bt| bt.id.as_str() == "App")
        .unwrap();
    app.dependencies.retain(|d| d.kind() == DependencyKind::Artifact);

    let err = Registry::load(set).unwrap_err();
    assert!(matches!(err, Error::InvalidDependency { .. }));
}

#[test]
fn test_unknown_vcs_root_is_rejected() {
    let mut set: DefinitionSet = serde_yaml::from_str(DEFINITIONS).unwrap();
    set.vcs_roots.clear();

    let err = Registry::load(set).unwrap_err();
    assert!(matches!(err, Error::UnknownVcsRoot { .. }));
}

#[test]
fn test_invalid_cron_is_rejected_at_load() {
    let mut set: DefinitionSet = serde_yaml::from_str(DEFINITIONS).unwrap();
    let deps = set
        .build_types
        .iter_mut()
        .find(|bt| bt.id.as_str() == "Deps")
        .unwrap();
    deps.triggers.push(Trigger::Scheduled(ScheduledTrigger {
        cron: "every night".to_string(),
        branch_filter: Default::default(),
        only_if_changes: false,
    }));

    let err = Registry::load(set).unwrap_err();
    assert!(err.is_configuration());
    match err {
        Error::InvalidSchedule {
            build_type,
            expression,
            ..
        } => {
            assert_eq!(build_type.as_str(), "Deps");
            assert_eq!(expression, "every night");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_invalid_requirement_pattern_is_rejected_at_load() {
    let yaml = DEFINITIONS.replace("exists(msbuild.path)", "matches(msbuild.path, [unclosed)");
    let err = serde_yaml::from_str::<DefinitionSet>(&yaml).unwrap_err();
    assert!(err.to_string().contains("Invalid requirement"));
}
