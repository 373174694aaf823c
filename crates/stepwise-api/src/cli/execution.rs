//! CLI execution subcommands: create, run, cancel, show and list.

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::Cell;
use console::style;
use uuid::Uuid;

use stepwise_core::engine::manager::NewExecution;
use stepwise_types::execution::{Execution, ExecutionStatus, StepExecution, Target};

use super::output;
use crate::state::AppState;

#[derive(Subcommand)]
pub enum ExecutionCommand {
    /// Start an execution of a published definition.
    Create {
        /// Definition code.
        code: String,

        /// Definition version.
        #[arg(id = "def_version", value_name = "VERSION")]
        version: u32,

        /// Kind of entity the execution acts on (e.g. `order`).
        #[arg(long)]
        target_type: String,

        /// Identifier of the target entity.
        #[arg(long)]
        target_id: String,

        /// JSON input passed to every step.
        #[arg(long, default_value = "{}")]
        input: String,

        /// Deduplication key; derived from tenant, code and target when omitted.
        #[arg(long)]
        idempotency_key: Option<String>,

        #[arg(long)]
        correlation_id: Option<String>,

        /// Run the steps immediately after creating.
        #[arg(long)]
        run: bool,
    },

    /// Drive an execution through its steps.
    Run { id: Uuid },

    /// Cancel a pending, running or waiting execution.
    Cancel {
        id: Uuid,

        #[arg(long, default_value = "cli")]
        actor: String,
    },

    /// Show an execution and every step attempt.
    Show { id: Uuid },

    /// List recent executions.
    #[command(alias = "ls")]
    List {
        /// Only executions in this status.
        #[arg(long)]
        status: Option<ExecutionStatus>,

        #[arg(long, default_value = "20")]
        limit: u32,
    },
}

pub async fn handle_execution_command(
    cmd: ExecutionCommand,
    state: &AppState,
    tenant: &str,
    json: bool,
) -> Result<()> {
    match cmd {
        ExecutionCommand::Create {
            code,
            version,
            target_type,
            target_id,
            input,
            idempotency_key,
            correlation_id,
            run,
        } => {
            let input_data: serde_json::Value =
                serde_json::from_str(&input).context("Invalid JSON in --input")?;
            let mut request = NewExecution::new(Target::new(target_type, target_id), input_data)
                .with_actor("cli");
            if let Some(key) = idempotency_key {
                request = request.with_idempotency_key(key);
            }
            if let Some(id) = correlation_id {
                request = request.with_correlation_id(id);
            }
            handle_create(&code, version, request, run, state, tenant, json).await
        }
        ExecutionCommand::Run { id } => {
            let execution = state.manager.run_execution(tenant, id).await?;
            print_summary("Ran", &execution, json)
        }
        ExecutionCommand::Cancel { id, actor } => {
            let execution = state
                .manager
                .cancel_execution(tenant, id, Some(&actor))
                .await?;
            print_summary("Cancelled", &execution, json)
        }
        ExecutionCommand::Show { id } => handle_show(id, state, tenant, json).await,
        ExecutionCommand::List { status, limit } => {
            handle_list(status, limit, state, tenant, json).await
        }
    }
}

async fn handle_create(
    code: &str,
    version: u32,
    request: NewExecution,
    run: bool,
    state: &AppState,
    tenant: &str,
    json: bool,
) -> Result<()> {
    let definition = state
        .definitions
        .get(tenant, code, version)
        .await?
        .with_context(|| format!("Definition {code} v{version} not found"))?;

    let mut execution = state
        .manager
        .create_execution(tenant, &definition, request)
        .await?;
    if run {
        execution = state.manager.run_execution(tenant, execution.id).await?;
    }

    print_summary("Created", &execution, json)
}

fn print_summary(verb: &str, execution: &Execution, json: bool) -> Result<()> {
    if json {
        return output::print_json(&serde_json::to_value(execution)?);
    }
    output::success(&format!(
        "{verb} execution {}",
        style(execution.id).cyan()
    ));
    println!(
        "  Definition: {} v{}",
        execution.definition_code, execution.definition_version
    );
    println!("  Status: {}", execution.status);
    println!("  Idempotency key: {}", execution.idempotency_key);
    println!();
    Ok(())
}

async fn handle_show(id: Uuid, state: &AppState, tenant: &str, json: bool) -> Result<()> {
    let execution = state
        .manager
        .get_execution(tenant, id)
        .await?
        .with_context(|| format!("Execution {id} not found"))?;
    let attempts = state.manager.list_step_executions(tenant, id).await?;

    if json {
        return output::print_json(&serde_json::json!({
            "execution": execution,
            "steps": attempts,
        }));
    }

    println!();
    println!(
        "  Execution {} ({} v{})",
        style(execution.id).cyan(),
        execution.definition_code,
        execution.definition_version
    );
    println!("  Status: {}", execution.status);
    println!(
        "  Target: {}/{}",
        execution.target_type, execution.target_id
    );
    println!("  Correlation: {}", execution.correlation_id);
    println!("  Created: {}", output::timestamp(&execution.created_at));
    println!(
        "  Finished: {}",
        output::optional_timestamp(execution.finished_at.as_ref())
    );

    if attempts.is_empty() {
        output::empty("No step attempts yet.", "");
        return Ok(());
    }
    output::print_table(&attempts_table(&attempts));
    Ok(())
}

fn attempts_table(attempts: &[StepExecution]) -> comfy_table::Table {
    let mut table = output::table(&["Step", "Attempt", "Status", "Error", "Retry after"]);
    for a in attempts {
        let error = match (&a.error_class, &a.error_summary) {
            (Some(class), Some(summary)) => format!("{class}: {summary}"),
            (Some(class), None) => class.to_string(),
            _ => String::new(),
        };
        table.add_row(vec![
            Cell::new(&a.step_id),
            Cell::new(a.attempt_number),
            output::status_cell(a.status.as_str()),
            Cell::new(error),
            Cell::new(output::optional_timestamp(a.retry_after_at.as_ref())),
        ]);
    }
    table
}

async fn handle_list(
    status: Option<ExecutionStatus>,
    limit: u32,
    state: &AppState,
    tenant: &str,
    json: bool,
) -> Result<()> {
    let executions = state.manager.list_executions(tenant, status, limit).await?;

    if json {
        return output::print_json(&serde_json::to_value(&executions)?);
    }

    if executions.is_empty() {
        output::empty(
            &format!("No executions for tenant '{tenant}'."),
            "Start one with: stepwise execution create <code> <version> --target-type .. --target-id ..",
        );
        return Ok(());
    }

    let mut table = output::table(&["ID", "Definition", "Status", "Target", "Created"]);
    for e in &executions {
        table.add_row(vec![
            Cell::new(e.id),
            Cell::new(format!("{} v{}", e.definition_code, e.definition_version)),
            output::status_cell(e.status.as_str()),
            Cell::new(format!("{}/{}", e.target_type, e.target_id)),
            Cell::new(output::timestamp(&e.created_at)),
        ]);
    }
    output::print_table(&table);
    Ok(())
}
