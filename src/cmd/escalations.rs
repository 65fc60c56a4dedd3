//! Escalation queue commands: `waypoint escalations`.

use anyhow::Result;
use waypoint::config::WaypointConfig;
use waypoint::escalation::{EscalationFilter, EscalationStatus};

use super::super::EscalationCommands;
use super::truncate;

pub async fn cmd_escalations(config: &WaypointConfig, command: &EscalationCommands) -> Result<()> {
    let queue = config.escalation_queue();

    match command {
        EscalationCommands::List { status, workflow } => {
            let mut filter = EscalationFilter::all();
            if let Some(status) = status {
                filter = filter.with_status(*status);
            }
            if let Some(workflow) = workflow {
                filter = filter.for_workflow(workflow.clone());
            }

            let records = queue.list(&filter)?;
            println!();
            if records.is_empty() {
                println!("No escalations found in {}", queue.dir().display());
                println!();
                return Ok(());
            }

            println!(
                "{:<14} {:<20} {:<6} {:<10} Question",
                "Id", "Workflow", "Step", "Status"
            );
            println!(
                "{:<14} {:<20} {:<6} {:<10} --------",
                "--------------", "--------------------", "------", "----------"
            );
            for record in &records {
                let status = match record.status {
                    EscalationStatus::Pending => console::style("pending").yellow(),
                    EscalationStatus::Resolved => console::style("resolved").green(),
                };
                println!(
                    "{:<14} {:<20} {:<6} {:<10} {}",
                    record.id,
                    truncate(&record.workflow_id, 20),
                    record.step_index,
                    status,
                    truncate(&record.question, 60)
                );
            }
            println!();
        }
        EscalationCommands::Show { id } => {
            let record = queue.get(id)?;
            println!();
            println!("{}", console::style(format!("Escalation {}", record.id)).bold());
            println!("  Workflow:  {}", record.workflow_id);
            println!("  Step:      {}", record.step_index);
            println!("  Status:    {}", record.status);
            println!("  Created:   {}", record.created_at.to_rfc3339());
            if let Some(resolved_at) = record.resolved_at {
                println!("  Resolved:  {}", resolved_at.to_rfc3339());
            }
            println!();
            println!("Question:");
            println!("  {}", record.question);
            if !record.context.is_null() {
                println!();
                println!("Context:");
                for line in serde_json::to_string_pretty(&record.context)?.lines() {
                    println!("  {}", line);
                }
            }
            if let Some(response) = &record.response {
                println!();
                println!("Response:");
                println!("  {}", response);
            }
            println!();
        }
        EscalationCommands::Respond { id, response } => {
            let record = queue.respond(id, response).await?;
            println!(
                "{} {} for workflow {}",
                console::style("Resolved").green().bold(),
                record.id,
                record.workflow_id
            );
        }
        EscalationCommands::Metrics => {
            let metrics = queue.metrics()?;
            println!();
            println!("{}", console::style("Escalation Metrics").bold().cyan());
            println!("  Pending:   {}", metrics.pending_count);
            println!("  Resolved:  {}", metrics.resolved_count);
            match metrics.avg_resolution_time_ms {
                Some(ms) => println!("  Mean time to resolve: {:.1}s", ms / 1000.0),
                None => println!("  Mean time to resolve: n/a"),
            }
            println!();
        }
    }

    Ok(())
}
