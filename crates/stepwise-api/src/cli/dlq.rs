//! CLI dead-letter queue subcommands.

use anyhow::Result;
use clap::Subcommand;
use comfy_table::Cell;

use super::output;
use crate::state::AppState;

#[derive(Subcommand)]
pub enum DlqCommand {
    /// List dead-lettered step attempts, newest first.
    #[command(alias = "ls")]
    List {
        #[arg(long, default_value = "50")]
        limit: u32,
    },
}

pub async fn handle_dlq_command(
    cmd: DlqCommand,
    state: &AppState,
    tenant: &str,
    json: bool,
) -> Result<()> {
    match cmd {
        DlqCommand::List { limit } => {
            let entries = state.manager.list_dlq_entries(tenant, limit).await?;

            if json {
                return output::print_json(&serde_json::to_value(&entries)?);
            }

            if entries.is_empty() {
                output::empty(&format!("Dead-letter queue for '{tenant}' is empty."), "");
                return Ok(());
            }

            let mut table =
                output::table(&["Execution", "Step", "Attempt", "Reason", "Class", "Error", "At"]);
            for e in &entries {
                table.add_row(vec![
                    Cell::new(e.execution_id),
                    Cell::new(&e.step_id),
                    Cell::new(e.attempt_number),
                    Cell::new(e.reason),
                    Cell::new(e.error_class),
                    Cell::new(e.error_summary.as_deref().unwrap_or("")),
                    Cell::new(output::timestamp(&e.created_at)),
                ]);
            }
            output::print_table(&table);
            Ok(())
        }
    }
}
