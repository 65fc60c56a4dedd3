//! Decision audit trail commands: `waypoint decisions`.

use anyhow::Result;
use waypoint::config::WaypointConfig;
use waypoint::orchestrator::store::validate_workflow_id;

use super::super::DecisionCommands;
use super::truncate;

pub fn cmd_decisions(config: &WaypointConfig, command: &DecisionCommands) -> Result<()> {
    let audit = config.audit_logger();

    match command {
        DecisionCommands::List => {
            let workflows = audit.list_workflows()?;
            println!();
            if workflows.is_empty() {
                println!("No decisions recorded in {}", config.decisions_dir().display());
                println!();
                return Ok(());
            }
            println!("{:<24} {:<10} Avg confidence", "Workflow", "Decisions");
            println!("{:<24} {:<10} --------------", "------------------------", "----------");
            for workflow_id in &workflows {
                let trail = audit.trail(workflow_id)?;
                let avg = trail
                    .average_confidence()
                    .map(|c| format!("{:.2}", c))
                    .unwrap_or_else(|| "-".to_string());
                println!("{:<24} {:<10} {}", truncate(workflow_id, 24), trail.len(), avg);
            }
            println!();
        }
        DecisionCommands::Show { workflow_id } => {
            validate_workflow_id(workflow_id)?;
            let trail = audit.trail(workflow_id)?;
            println!();
            if trail.is_empty() {
                println!("No decisions recorded for workflow {}", workflow_id);
                println!();
                return Ok(());
            }

            println!(
                "{}",
                console::style(format!("Decisions for {}", workflow_id)).bold()
            );
            for decision in &trail.decisions {
                println!();
                println!(
                    "  {} {}",
                    console::style(decision.timestamp.to_rfc3339()).dim(),
                    decision.question
                );
                println!(
                    "    value = {}  confidence = {:.2}  source = {}",
                    truncate(&serde_json::to_string(&decision.value)?, 50),
                    decision.confidence,
                    decision.source
                );
                if let Some(agent) = &decision.agent {
                    println!("    agent = {}", agent);
                }
                if !decision.rationale.is_empty() {
                    println!("    rationale: {}", truncate(&decision.rationale, 100));
                }
            }
            println!();
        }
    }

    Ok(())
}
