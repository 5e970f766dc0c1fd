//! ZMCP CLI entry point.

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;

use zmcp::cli::runtime::Runtime;
use zmcp::cli::{display, AgentCommands, Cli, Commands, JobCommands, ObjectiveCommands};
use zmcp::domain::models::{ObjectiveStatus, ScrapeJobData, ScrapeJobStatus};
use zmcp::infrastructure::config::ConfigLoader;
use zmcp::infrastructure::logging::Logging;
use zmcp::infrastructure::transport::DashboardConnector;
use zmcp::services::scrape_worker::ScrapeWorker;

fn main() -> std::process::ExitCode {
    match run() {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("zmcp: {e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load()?,
    };
    let _logging = Logging::init(&config.logging).context("initializing logging")?;

    let runtime = Runtime::init(config).await?;

    match cli.command {
        Commands::Serve => serve(&runtime).await,
        Commands::Worker => worker(&runtime).await,
        Commands::Orchestrate {
            title,
            objective,
            repository_path,
            skip_research,
            skip_monitor,
        } => {
            let request = zmcp::services::orchestrator::OrchestrationRequest {
                title,
                objective,
                repository_path,
                skip_research,
                skip_monitor,
                max_monitor_ms: None,
            };
            let report = runtime.orchestrator.run(request).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if report.success {
                display::success(&format!(
                    "orchestration {} completed in {} ms",
                    report.orchestration_id, report.duration_ms
                ));
            } else {
                display::failure(&format!(
                    "orchestration {} ended {:?}",
                    report.orchestration_id, report.status
                ));
            }
            runtime.shutdown().await;
            if report.success {
                Ok(())
            } else {
                anyhow::bail!("orchestration did not complete successfully")
            }
        }
        Commands::Agent(command) => agent_command(&runtime, command, cli.json).await,
        Commands::Objective(command) => objective_command(&runtime, command, cli.json).await,
        Commands::Job(command) => job_command(&runtime, command, cli.json).await,
    }
}

/// Long-running server mode: reconciler, signal forwarding, dashboard
/// connector. Runs until SIGINT/SIGTERM.
async fn serve(runtime: &Runtime) -> Result<()> {
    let reconciler = Arc::clone(&runtime.agents).spawn_reconciler();
    let forwarder = tokio::spawn(Arc::clone(&runtime.supervisor).forward_signals_task());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let connector = DashboardConnector::new(
        Arc::clone(&runtime.bus),
        runtime.config.dashboard.clone(),
        runtime.config.dashboard_discovery_path(),
        ".",
        None,
    );
    let dashboard = tokio::spawn(connector.run(shutdown_rx));

    tracing::info!(
        host = %runtime.config.http_host,
        port = runtime.config.http_port,
        "runtime up; waiting for signals"
    );
    wait_for_shutdown_signal().await;

    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    reconciler.abort();
    forwarder.abort();
    runtime.shutdown().await;
    let _ = dashboard.await;
    Ok(())
}

/// Scrape worker mode: a pool of workers until SIGINT/SIGTERM. The
/// worker in flight flushes its completion before exit.
async fn worker(runtime: &Runtime) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = ScrapeWorker::spawn_pool(
        runtime.job_repo.clone(),
        Arc::clone(&runtime.queue),
        runtime.fetcher.clone(),
        Arc::clone(&runtime.bus),
        runtime.config.worker.clone(),
        shutdown_rx,
    );

    wait_for_shutdown_signal().await;
    tracing::info!("stopping scrape workers");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }
    runtime.shutdown().await;
    Ok(())
}

async fn agent_command(runtime: &Runtime, command: AgentCommands, json: bool) -> Result<()> {
    match command {
        AgentCommands::List {
            repository_path,
            status,
            limit,
            offset,
        } => {
            let response = runtime
                .dispatcher
                .dispatch(
                    "list_agents",
                    json!({
                        "repository_path": repository_path,
                        "status": status,
                        "limit": limit,
                        "offset": offset,
                    }),
                )
                .await;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else if let Some(data) = response.data {
                let agents: Vec<zmcp::domain::models::Agent> =
                    serde_json::from_value(data["agents"].clone())?;
                println!("{}", display::agents_table(&agents));
            }
            Ok(())
        }
        AgentCommands::Terminate { ids } => {
            let response = runtime
                .dispatcher
                .dispatch("terminate_agent", json!({ "agent_ids": ids }))
                .await;
            print_response(&response, json)
        }
        AgentCommands::Cleanup {
            stale_minutes,
            dry_run,
            include_rooms,
            notify,
        } => {
            let response = runtime
                .dispatcher
                .dispatch(
                    "cleanup_stale_agents",
                    json!({
                        "stale_minutes": stale_minutes,
                        "dry_run": dry_run,
                        "include_room_cleanup": include_rooms,
                        "notify_participants": notify,
                    }),
                )
                .await;
            print_response(&response, json)
        }
    }
}

async fn objective_command(
    runtime: &Runtime,
    command: ObjectiveCommands,
    json: bool,
) -> Result<()> {
    match command {
        ObjectiveCommands::Create {
            title,
            description,
            repository_path,
            objective_type,
            priority,
        } => {
            let response = runtime
                .dispatcher
                .dispatch(
                    "create_objective",
                    json!({
                        "repository_path": repository_path,
                        "objective_type": objective_type,
                        "title": title,
                        "description": description,
                        "priority": priority,
                    }),
                )
                .await;
            print_response(&response, json)
        }
        ObjectiveCommands::List {
            repository_path,
            status,
            limit,
        } => {
            let status = match status.as_deref() {
                None => None,
                Some(raw) => Some(
                    ObjectiveStatus::from_str(raw)
                        .with_context(|| format!("unknown status {raw:?}"))?,
                ),
            };
            let page = runtime
                .objectives
                .list(&repository_path, status, limit, 0)
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&page.data)?);
            } else {
                println!("{}", display::objectives_table(&page.data));
            }
            Ok(())
        }
    }
}

async fn job_command(runtime: &Runtime, command: JobCommands, json: bool) -> Result<()> {
    match command {
        JobCommands::Queue {
            source_id,
            url,
            max_pages,
            priority,
        } => {
            let outcome = runtime
                .queue
                .queue(
                    &source_id,
                    ScrapeJobData {
                        url,
                        max_pages,
                        ..ScrapeJobData::default()
                    },
                    priority,
                )
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome.job)?);
            } else if outcome.skipped {
                display::failure(&format!(
                    "skipped: {}",
                    outcome.reason.unwrap_or_default()
                ));
            } else {
                display::success(&format!("queued job {}", outcome.job.id));
            }
            Ok(())
        }
        JobCommands::List { status, limit } => {
            let status = match status.as_deref() {
                None => None,
                Some(raw) => Some(
                    ScrapeJobStatus::from_str(raw)
                        .with_context(|| format!("unknown status {raw:?}"))?,
                ),
            };
            let page = runtime.queue.list(status, limit, 0).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&page.data)?);
            } else {
                println!("{}", display::jobs_table(&page.data));
            }
            Ok(())
        }
        JobCommands::Retry { id } => {
            let job = runtime.queue.retry_job(id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&job)?);
            } else {
                display::success(&format!("job {} back to pending", job.id));
            }
            Ok(())
        }
    }
}

fn print_response(response: &zmcp::services::requests::ToolResponse, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(response)?);
    } else if response.success {
        display::success(&response.message);
    } else {
        display::failure(&response.message);
    }
    if response.success {
        Ok(())
    } else {
        anyhow::bail!("{}", response.message)
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return,
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
