/// dagflow: workflow execution orchestrator
///
/// Command-line entry point. Imports workflow definitions into the local
/// SQLite database and runs them through the execution engine.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use dagflow::{
    app,
    config::Config,
    runtime::{ExecuteRequest, ExecutionEvent, ExecutionMode, ExecutionResponse},
    workflow::Workflow,
};

#[derive(Parser)]
#[command(name = "dagflow", version, about = "Workflow execution orchestrator")]
struct Cli {
    /// Directory holding the SQLite database
    #[arg(long, env = "DAGFLOW_DATA_DIR")]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a workflow definition from a JSON file
    Import {
        file: PathBuf,
    },
    /// Execute a stored workflow
    Run {
        workflow_id: String,
        /// Execution input as JSON
        #[arg(long, default_value = "{}")]
        input: String,
        /// User the execution runs on behalf of
        #[arg(long, default_value = "cli")]
        user: String,
        /// Return the execution id at once and follow its events
        #[arg(long = "async")]
        run_async: bool,
    },
    /// Show the status of an execution
    Status {
        execution_id: String,
    },
    /// List stored workflow definitions
    Workflows,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    app::init_tracing();

    let mut config = Config::default();
    if let Some(data_dir) = cli.data_dir {
        config.database.data_dir = data_dir;
    }
    let app = app::build(config).await?;

    match cli.command {
        Commands::Import { file } => {
            let raw = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let workflow: Workflow = serde_json::from_str(&raw)
                .with_context(|| format!("Invalid workflow definition in {}", file.display()))?;
            let id = workflow.id.clone();
            app.registry.upsert_workflow(workflow).await?;
            println!("Imported workflow {}", id);
        }
        Commands::Run {
            workflow_id,
            input,
            user,
            run_async,
        } => {
            let input_data: serde_json::Value =
                serde_json::from_str(&input).context("--input must be valid JSON")?;
            let mode = if run_async {
                ExecutionMode::Async
            } else {
                ExecutionMode::Sync
            };
            let mut events = app.engine.subscribe();

            let response = app
                .engine
                .execute_workflow(ExecuteRequest {
                    workflow_id,
                    user_id: user,
                    input_data,
                    mode,
                })
                .await?;

            match response {
                ExecutionResponse::Finished(result) => {
                    println!("{}", serde_json::to_string_pretty(&result)?);
                }
                ExecutionResponse::Accepted { execution_id } => {
                    println!("Execution {} accepted", execution_id);
                    loop {
                        let event = match events.recv().await {
                            Ok(event) => event,
                            Err(RecvError::Lagged(skipped)) => {
                                tracing::warn!(skipped, "Event stream lagged");
                                continue;
                            }
                            Err(RecvError::Closed) => break,
                        };
                        if event.execution_id() != execution_id {
                            continue;
                        }
                        println!("{}", serde_json::to_string(&event)?);
                        if matches!(event, ExecutionEvent::ExecutionFinished { .. }) {
                            break;
                        }
                    }
                }
            }
        }
        Commands::Status { execution_id } => {
            match app.engine.get_execution_status(&execution_id).await? {
                Some(context) => println!("{}", serde_json::to_string_pretty(&context)?),
                None => anyhow::bail!("Execution {} not found", execution_id),
            }
        }
        Commands::Workflows => {
            for summary in app.storage.list_workflows().await? {
                println!(
                    "{}\t{}\t{} nodes\t{}",
                    summary.id, summary.name, summary.node_count, summary.updated_at
                );
            }
        }
    }

    Ok(())
}
