//! CLI definition management subcommands.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use comfy_table::Cell;
use console::style;

use stepwise_core::engine::definition::{load_definition_file, serialize_definition_yaml};
use stepwise_types::definition::Definition;

use super::output;
use crate::state::{AppState, default_registry};

#[derive(Subcommand)]
pub enum DefinitionCommand {
    /// Check a YAML definition without storing it.
    Validate {
        /// Path to the definition YAML file.
        file: PathBuf,
    },

    /// Store a YAML definition and publish it.
    Publish {
        /// Path to the definition YAML file.
        file: PathBuf,

        /// Recorded as the audit actor.
        #[arg(long, default_value = "cli")]
        actor: String,
    },

    /// List definitions for the tenant.
    #[command(alias = "ls")]
    List,

    /// Print a stored definition as YAML.
    Show {
        code: String,
        #[arg(id = "def_version", value_name = "VERSION")]
        version: u32,
    },

    /// Retire a published definition so no new executions can start.
    Deprecate {
        code: String,
        #[arg(id = "def_version", value_name = "VERSION")]
        version: u32,
    },
}

pub async fn handle_definition_command(
    cmd: DefinitionCommand,
    state: &AppState,
    tenant: &str,
    json: bool,
) -> Result<()> {
    match cmd {
        DefinitionCommand::Validate { file } => handle_validate(&file, tenant, json),
        DefinitionCommand::Publish { file, actor } => {
            handle_publish(&file, &actor, state, tenant, json).await
        }
        DefinitionCommand::List => handle_list(state, tenant, json).await,
        DefinitionCommand::Show { code, version } => {
            handle_show(&code, version, state, tenant, json).await
        }
        DefinitionCommand::Deprecate { code, version } => {
            handle_deprecate(&code, version, state, tenant, json).await
        }
    }
}

fn load_for_tenant(file: &PathBuf, tenant: &str) -> Result<Definition> {
    let def = load_definition_file(file)
        .with_context(|| format!("Failed to load definition from {}", file.display()))?;
    if def.tenant_id != tenant {
        bail!(
            "{} belongs to tenant '{}', not '{tenant}' (pass --tenant {})",
            file.display(),
            def.tenant_id,
            def.tenant_id
        );
    }
    Ok(def)
}

fn handle_validate(file: &PathBuf, tenant: &str, json: bool) -> Result<()> {
    let def = load_for_tenant(file, tenant)?;
    let missing = default_registry().missing_handlers(&def);

    if json {
        output::print_json(&serde_json::json!({
            "code": def.code,
            "version": def.version,
            "steps": def.steps.len(),
            "valid": missing.is_empty(),
            "missing_handlers": missing,
        }))?;
    } else {
        output::success(&format!(
            "{} v{} is well-formed ({} steps)",
            style(&def.code).cyan(),
            def.version,
            def.steps.len()
        ));
        for key in &missing {
            println!("  {} no handler registered for {key}", style("!").yellow().bold());
        }
        println!();
    }

    if !missing.is_empty() {
        bail!("{} step handler(s) missing", missing.len());
    }
    Ok(())
}

async fn handle_publish(
    file: &PathBuf,
    actor: &str,
    state: &AppState,
    tenant: &str,
    json: bool,
) -> Result<()> {
    let def = load_for_tenant(file, tenant)?;
    let published = state.definitions.save_and_publish(&def, actor).await?;

    if json {
        output::print_json(&serde_json::json!({
            "code": published.code,
            "version": published.version,
            "status": published.status.as_str(),
            "published_at": published.published_at.map(|t| t.to_rfc3339()),
        }))?;
    } else {
        output::success(&format!(
            "Published {} v{}",
            style(&published.code).cyan(),
            published.version
        ));
        println!("  Steps: {}", published.steps.len());
        println!(
            "  Published at: {}",
            output::optional_timestamp(published.published_at.as_ref())
        );
        println!();
    }
    Ok(())
}

async fn handle_list(state: &AppState, tenant: &str, json: bool) -> Result<()> {
    let defs = state.definitions.list(tenant).await?;

    if json {
        let out: Vec<_> = defs
            .iter()
            .map(|d| {
                serde_json::json!({
                    "code": d.code,
                    "version": d.version,
                    "status": d.status.as_str(),
                    "steps": d.steps.len(),
                    "description": d.description,
                })
            })
            .collect();
        return output::print_json(&serde_json::Value::Array(out));
    }

    if defs.is_empty() {
        output::empty(
            &format!("No definitions for tenant '{tenant}'."),
            "Publish one with: stepwise definition publish <file.yaml>",
        );
        return Ok(());
    }

    let mut table = output::table(&["Code", "Version", "Status", "Steps", "Description"]);
    for d in &defs {
        table.add_row(vec![
            Cell::new(&d.code),
            Cell::new(d.version),
            output::status_cell(d.status.as_str()),
            Cell::new(d.steps.len()),
            Cell::new(d.description.as_deref().unwrap_or("")),
        ]);
    }
    output::print_table(&table);
    Ok(())
}

async fn handle_show(
    code: &str,
    version: u32,
    state: &AppState,
    tenant: &str,
    json: bool,
) -> Result<()> {
    let def = state
        .definitions
        .get(tenant, code, version)
        .await?
        .with_context(|| format!("Definition {code} v{version} not found"))?;

    if json {
        output::print_json(&serde_json::to_value(&def)?)
    } else {
        print!("{}", serialize_definition_yaml(&def)?);
        Ok(())
    }
}

async fn handle_deprecate(
    code: &str,
    version: u32,
    state: &AppState,
    tenant: &str,
    json: bool,
) -> Result<()> {
    let def = state.definitions.deprecate(tenant, code, version).await?;

    if json {
        output::print_json(&serde_json::json!({
            "code": def.code,
            "version": def.version,
            "status": def.status.as_str(),
        }))
    } else {
        output::success(&format!(
            "{} v{} is now {}",
            style(&def.code).cyan(),
            def.version,
            def.status
        ));
        println!();
        Ok(())
    }
}
