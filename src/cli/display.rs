//! Table rendering for CLI output.

use comfy_table::presets::UTF8_FULL_CONDENSED;
use comfy_table::Table;
use console::style;

use crate::domain::models::{Agent, Objective, ScrapeJob};

pub fn agents_table(agents: &[Agent]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec!["ID", "Name", "Type", "Status", "PID", "Last heartbeat"]);
    for agent in agents {
        table.add_row(vec![
            short_id(&agent.id.to_string()),
            agent.agent_name.clone(),
            agent.agent_type.clone().unwrap_or_default(),
            agent.status.to_string(),
            agent
                .claude_pid
                .map(|pid| pid.to_string())
                .unwrap_or_default(),
            agent.last_heartbeat.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
    }
    table
}

pub fn objectives_table(objectives: &[Objective]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec!["ID", "Type", "Status", "Priority", "Progress", "Description"]);
    for objective in objectives {
        table.add_row(vec![
            short_id(&objective.id.to_string()),
            objective.objective_type.to_string(),
            objective.status.to_string(),
            objective.priority.to_string(),
            objective
                .progress_percentage
                .map(|p| format!("{p}%"))
                .unwrap_or_default(),
            truncate(&objective.description, 60),
        ]);
    }
    table
}

pub fn jobs_table(jobs: &[ScrapeJob]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec!["ID", "Source", "Status", "Priority", "Pages", "Locked by"]);
    for job in jobs {
        table.add_row(vec![
            short_id(&job.id.to_string()),
            job.source_id.clone(),
            job.status.to_string(),
            job.priority.to_string(),
            job.pages_scraped.to_string(),
            job.locked_by.clone().unwrap_or_default(),
        ]);
    }
    table
}

pub fn success(message: &str) {
    println!("{} {message}", style("✓").green().bold());
}

pub fn failure(message: &str) {
    eprintln!("{} {message}", style("✗").red().bold());
}

fn short_id(id: &str) -> String {
    id.chars().rev().take(8).collect::<Vec<_>>().into_iter().rev().collect()
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}
