use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use conductor::app::{logging, AppConfig, AppPaths, AppState};
use conductor::cli::{parse_variables, Cli, Commands, WorkflowCommands};
use conductor::models::GenerationRequest;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = AppPaths::new()?;
    if cli.config.is_none() {
        paths.ensure_dirs_exist()?;
    }
    let config_path = paths.resolve_config_file(cli.config.as_deref());
    let config = AppConfig::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

    let _guard = logging::init_logging(&config.logging, cli.debug)?;
    info!("Starting conductor {}", env!("CARGO_PKG_VERSION"));

    let state = AppState::new(config)?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling in-flight work");
            interrupt.cancel();
        }
    });

    run(cli.command, &state, &cancel).await
}

async fn run(command: Commands, state: &AppState, cancel: &CancellationToken) -> anyhow::Result<()> {
    let orchestration = state.orchestration();

    match command {
        Commands::Generate {
            prompt,
            model,
            system,
            temperature,
            max_tokens,
            user,
            session,
            json,
        } => {
            let mut request = GenerationRequest::from_prompt(model, prompt);
            if let Some(system) = system {
                request = request.with_system_message(system);
            }
            if let Some(temperature) = temperature {
                request = request.with_temperature(temperature);
            }
            if let Some(max_tokens) = max_tokens {
                request = request.with_max_tokens(max_tokens);
            }
            if let Some(user) = user {
                request = request.with_user(user);
            }
            if let Some(session) = session {
                request = request.with_session(session);
            }

            let response = orchestration.generate(&request, cancel).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                println!("{}", response.content);
                eprintln!(
                    "[{} via {} | {} tokens | ${} | {:?}]",
                    response.model, response.provider, response.usage.total_tokens, response.usage.cost, response.duration
                );
            }
        }

        Commands::Health => {
            let health = orchestration.get_provider_health().await;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }

        Commands::Providers { validate } => {
            let registry = orchestration.registry();
            if registry.is_empty() {
                println!("No providers available");
            }
            if validate {
                for (name, valid) in orchestration.validate_providers().await {
                    println!("{:<24} {}", name, if valid { "ok" } else { "invalid" });
                }
            } else {
                for provider in registry.get_available_providers() {
                    println!("{:<24} {}", provider.name(), provider.kind());
                }
            }
        }

        Commands::Metrics => {
            let metrics = orchestration.get_provider_metrics();
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }

        Commands::Config => {
            print!("{}", state.config().to_toml_redacted()?);
        }

        Commands::Workflow { command } => run_workflow(command, state, cancel).await?,
    }

    Ok(())
}

async fn run_workflow(command: WorkflowCommands, state: &AppState, cancel: &CancellationToken) -> anyhow::Result<()> {
    let gateway = state.workflow()?;

    match command {
        WorkflowCommands::Deploy { archive } => {
            let bytes = tokio::fs::read(&archive)
                .await
                .with_context(|| format!("Failed to read archive {}", archive.display()))?;
            let deployment = gateway.deploy(&bytes, cancel).await?;
            println!("{}", deployment.id);
        }
        WorkflowCommands::Start { process_key, vars } => {
            let id = gateway.start(&process_key, &parse_variables(&vars)?, cancel).await?;
            println!("{}", id);
        }
        WorkflowCommands::Tasks {
            assignee,
            candidate_group,
        } => {
            let tasks = gateway
                .tasks(assignee.as_deref(), candidate_group.as_deref(), cancel)
                .await?;
            println!("{}", serde_json::to_string_pretty(&tasks)?);
        }
        WorkflowCommands::History { process_instance_id } => {
            let history = gateway.history(&process_instance_id, cancel).await?;
            println!("{}", serde_json::to_string_pretty(&history)?);
        }
        WorkflowCommands::Claim { task_id, assignee } => {
            gateway.claim(&task_id, &assignee, cancel).await?;
            println!("Task {} claimed by {}", task_id, assignee);
        }
        WorkflowCommands::Complete { task_id, vars } => {
            gateway.complete(&task_id, &parse_variables(&vars)?, cancel).await?;
            println!("Task {} completed", task_id);
        }
        WorkflowCommands::Signal {
            execution_id,
            signal_name,
            vars,
        } => {
            gateway
                .signal(&execution_id, &signal_name, &parse_variables(&vars)?, cancel)
                .await?;
            println!("Signal {} sent to {}", signal_name, execution_id);
        }
    }

    Ok(())
}
