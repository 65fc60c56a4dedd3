//! Workflow state commands: `waypoint state`.

use anyhow::{Result, bail};
use waypoint::config::WaypointConfig;
use waypoint::errors::StateError;
use waypoint::orchestrator::WorkflowStatus;

use super::super::StateCommands;
use super::truncate;

fn styled_status(status: WorkflowStatus) -> console::StyledObject<&'static str> {
    let style = console::style(status.as_str());
    match status {
        WorkflowStatus::Completed => style.green(),
        WorkflowStatus::Failed => style.red(),
        WorkflowStatus::Paused => style.yellow(),
        WorkflowStatus::Running => style.cyan(),
        WorkflowStatus::Initialized => style.dim(),
    }
}

pub fn cmd_state(config: &WaypointConfig, command: &StateCommands) -> Result<()> {
    let store = config.state_store();

    match command {
        StateCommands::List => {
            let ids = store.list()?;
            println!();
            if ids.is_empty() {
                println!("No workflows found in {}", store.dir().display());
                println!();
                return Ok(());
            }

            println!("{:<24} {:<12} {:<6} Updated", "Workflow", "Status", "Step");
            println!(
                "{:<24} {:<12} {:<6} -------",
                "------------------------", "------------", "------"
            );
            for id in &ids {
                match store.load(id) {
                    Ok(Some(state)) => println!(
                        "{:<24} {:<12} {:<6} {}",
                        truncate(id, 24),
                        styled_status(state.status),
                        state.current_step_index,
                        state.updated_at.to_rfc3339()
                    ),
                    Ok(None) => {}
                    Err(StateError::Corrupt { .. }) => println!(
                        "{:<24} {:<12} {:<6} run 'waypoint state recover {}'",
                        truncate(id, 24),
                        console::style("corrupt").red().bold(),
                        "-",
                        id
                    ),
                    Err(e) => return Err(e.into()),
                }
            }
            println!();
        }
        StateCommands::Show { id } => {
            let Some(state) = store.load(id)? else {
                bail!("No such workflow: {}", id);
            };

            println!();
            println!("{}", console::style(format!("Workflow {}", state.id)).bold());
            println!("  Status:      {}", styled_status(state.status));
            println!("  Next step:   {}", state.current_step_index);
            println!("  Created:     {}", state.created_at.to_rfc3339());
            println!("  Updated:     {}", state.updated_at.to_rfc3339());
            if state.restarts > 0 {
                println!("  Restarts:    {}", state.restarts);
            }
            if let Some(escalation) = &state.pending_escalation {
                println!("  Waiting on:  {}", console::style(escalation).yellow());
            }
            if let Some(failure) = &state.failure {
                println!(
                    "  {} step {}: {}",
                    console::style("Failed at").red().bold(),
                    failure.step_index,
                    failure.message
                );
            }

            if !state.variables.is_empty() {
                let mut keys: Vec<&String> = state.variables.keys().collect();
                keys.sort();
                println!();
                println!("Variables:");
                for key in keys {
                    let value = serde_json::to_string(&state.variables[key])?;
                    println!("  {} = {}", key, truncate(&value, 70));
                }
            }

            if !state.step_log.is_empty() {
                println!();
                println!(
                    "{:<6} {:<20} {:<9} {:<10} Outcome",
                    "Step", "Name", "Attempts", "Duration"
                );
                println!(
                    "{:<6} {:<20} {:<9} {:<10} -------",
                    "------", "--------------------", "---------", "----------"
                );
                for entry in &state.step_log {
                    println!(
                        "{:<6} {:<20} {:<9} {:<10} {}",
                        entry.step_index,
                        truncate(&entry.step_name, 20),
                        entry.attempts,
                        format!("{}ms", entry.duration_ms),
                        truncate(&entry.outcome.to_string(), 60)
                    );
                }
            }
            println!();
        }
        StateCommands::Recover { id } => {
            let _lease = store.acquire_lease(id)?;
            let state = store.recover_from_backup(id)?;
            println!(
                "{} {} from backup (status: {}, next step: {})",
                console::style("Recovered").green().bold(),
                state.id,
                state.status,
                state.current_step_index
            );
        }
        StateCommands::Reset { id, force } => {
            if !*force {
                println!();
                println!(
                    "This deletes the state and all backups of workflow {}.",
                    id
                );
                println!("Re-run with --force to confirm.");
                println!();
                return Ok(());
            }
            let _lease = store.acquire_lease(id)?;
            store.delete(id)?;
            println!("{} workflow {}", console::style("Reset").yellow().bold(), id);
        }
    }

    Ok(())
}
