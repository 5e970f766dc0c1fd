//! Command-line interface.

pub mod display;
pub mod runtime;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "zmcp", about = "Agent orchestration runtime", version)]
pub struct Cli {
    /// Emit JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    /// Configuration file (defaults to ~/.mcptools/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestration runtime (reconciler + dashboard connector)
    Serve,
    /// Run the scrape worker pool
    Worker,
    /// Run one orchestration to completion
    Orchestrate {
        title: String,
        objective: String,
        #[arg(long, default_value = ".")]
        repository_path: String,
        #[arg(long)]
        skip_research: bool,
        #[arg(long)]
        skip_monitor: bool,
    },
    /// Agent management
    #[command(subcommand)]
    Agent(AgentCommands),
    /// Objective management
    #[command(subcommand)]
    Objective(ObjectiveCommands),
    /// Scrape job management
    #[command(subcommand)]
    Job(JobCommands),
}

#[derive(Subcommand)]
pub enum AgentCommands {
    /// List agents, newest heartbeat first
    List {
        #[arg(long)]
        repository_path: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Terminate agents by id
    Terminate {
        ids: Vec<Uuid>,
    },
    /// Terminate agents whose heartbeat went stale
    Cleanup {
        #[arg(long)]
        stale_minutes: Option<i64>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        include_rooms: bool,
        #[arg(long)]
        notify: bool,
    },
}

#[derive(Subcommand)]
pub enum ObjectiveCommands {
    Create {
        title: String,
        description: String,
        #[arg(long, default_value = ".")]
        repository_path: String,
        #[arg(long, default_value = "feature")]
        objective_type: String,
        #[arg(long)]
        priority: Option<i32>,
    },
    List {
        #[arg(long, default_value = ".")]
        repository_path: String,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
}

#[derive(Subcommand)]
pub enum JobCommands {
    /// Queue a scrape job for a source
    Queue {
        source_id: String,
        #[arg(long)]
        url: Option<String>,
        #[arg(long, default_value_t = 0)]
        max_pages: u32,
        #[arg(long)]
        priority: Option<i32>,
    },
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Return a failed job to pending
    Retry {
        id: Uuid,
    },
}
