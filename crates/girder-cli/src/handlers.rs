//! Command handlers.

use crate::config::{CliConfig, OutputFormat};
use crate::loader;
use crate::simulate::{self, Script};
use anyhow::Result;
use console::style;
use girder_core::definition::{DefinitionSet, EffectiveConfig};
use girder_core::events::Event;
use girder_core::ids::BuildTypeId;
use girder_core::run::RunState;
use girder_scheduler::{DependencyGraph, SchedulerConfig};
use serde::Serialize;
use std::path::Path;

/// Validate definitions.
pub fn validate(path: &Path) -> Result<()> {
    let registry = loader::load_registry(path)?;
    let graph = DependencyGraph::resolve(&registry)?;

    println!(
        "{} Definitions in {} are valid",
        style("✓").green(),
        path.display()
    );
    println!("  VCS roots: {}", registry.vcs_roots().count());
    println!("  Templates: {}", registry.templates().count());
    println!("  Build types: {}", graph.topological_order().len());
    Ok(())
}

/// Print the dependency graph.
pub fn graph(config: &CliConfig, path: &Path) -> Result<()> {
    let registry = loader::load_registry(path)?;
    let graph = DependencyGraph::resolve(&registry)?;

    if config.output_format != OutputFormat::Table {
        #[derive(Serialize)]
        struct Edge<'a> {
            upstream: &'a BuildTypeId,
            downstream: &'a BuildTypeId,
            kind: String,
        }
        let edges: Vec<Edge> = graph
            .edges()
            .into_iter()
            .map(|(upstream, downstream, kind)| Edge {
                upstream,
                downstream,
                kind: kind.to_string(),
            })
            .collect();
        return print_structured(config.output_format, &edges);
    }

    for id in graph.topological_order() {
        let upstream = graph.upstream(id);
        if upstream.is_empty() {
            println!("{}", style(id).bold());
        } else {
            let names: Vec<&str> = upstream.iter().map(|u| u.as_str()).collect();
            println!("{} {} {}", style(id).bold(), style("<-").dim(), names.join(", "));
        }
    }
    Ok(())
}

/// Print a build type's effective configuration.
pub fn effective(config: &CliConfig, path: &Path, build_type: &str) -> Result<()> {
    let registry = loader::load_registry(path)?;
    let effective = registry.resolve_effective_config(&BuildTypeId::from(build_type))?;

    match config.output_format {
        OutputFormat::Table => print_effective(&effective),
        format => print_structured(format, &effective)?,
    }
    Ok(())
}

fn print_effective(config: &EffectiveConfig) {
    println!("{} ({})", style(&config.build_type).bold(), config.name);
    if let Some(template) = &config.template {
        println!("  template: {}", template);
    }
    println!("  build number: {}", config.build_number_pattern);
    if config.paused {
        println!("  {}", style("paused").yellow());
    }

    println!("  params:");
    for (key, value) in &config.params {
        println!("    {} = {}", key, value);
    }
    println!("  steps:");
    for step in &config.steps {
        println!("    - {} [{}]", step.name, step.runner);
    }
    if !config.requirements.is_empty() {
        println!("  requirements:");
        for requirement in &config.requirements {
            println!("    - {}", requirement);
        }
    }
    if !config.dependencies.is_empty() {
        println!("  dependencies:");
        for dependency in &config.dependencies {
            println!("    - {} on {}", dependency.kind(), dependency.upstream());
        }
    }
    println!("  triggers: {}", config.triggers.len());
}

/// Print the definition JSON schema.
pub fn schema() -> Result<()> {
    let schema = schemars::schema_for!(DefinitionSet);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

/// Run a simulation script and print the resulting runs.
pub async fn simulate(config: &CliConfig, path: &Path, script_path: &Path) -> Result<()> {
    let registry = loader::load_registry(path)?;
    let content = std::fs::read_to_string(script_path)?;
    let script: Script = loader::parse(script_path, &content)?;
    let scheduler_config = SchedulerConfig {
        agent_wait_timeout_secs: config.agent_wait_timeout_secs,
        ..Default::default()
    };

    let outcome = simulate::simulate(registry, script, scheduler_config).await?;

    if config.output_format != OutputFormat::Table {
        return print_structured(config.output_format, &outcome.runs);
    }

    for run in &outcome.runs {
        let state = match run.state {
            RunState::Succeeded => style(run.state.to_string()).green(),
            RunState::Failed => style(run.state.to_string()).red(),
            RunState::Cancelled => style(run.state.to_string()).yellow(),
            RunState::Queued | RunState::Running => style(run.state.to_string()).dim(),
        };
        println!(
            "{:<10} {} #{} on {} ({})",
            state,
            style(&run.build_type).bold(),
            run.build_number,
            run.branch,
            run.cause
        );
        if let Some(reason) = &run.reason {
            println!("           {}", style(reason).dim());
        }
    }

    let triggers = outcome
        .events
        .iter()
        .filter(|e| matches!(e, Event::TriggerFired(_)))
        .count();
    println!(
        "\n{} {} runs, {} trigger firings",
        style("i").blue(),
        outcome.runs.len(),
        triggers
    );
    Ok(())
}

/// Show configuration.
pub fn show_config(config: &CliConfig) -> Result<()> {
    println!("Current configuration:");
    println!("  output_format: {:?}", config.output_format);
    println!("  log_filter: {}", config.log_filter);
    println!("  agent_wait_timeout_secs: {}", config.agent_wait_timeout_secs);

    if let Ok(path) = CliConfig::config_path() {
        println!("\nConfig file: {}", path.display());
    }
    Ok(())
}

/// Set configuration.
pub fn set_config(key: &str, value: &str) -> Result<()> {
    let mut config = CliConfig::load().unwrap_or_default();
    config.set(key, value)?;
    config.save()?;

    println!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(())
}

fn print_structured<T: Serialize>(format: OutputFormat, value: &T) -> Result<()> {
    match format {
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
        _ => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}
