use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::workflow::Variables;

#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(about = "Resilient, adaptive orchestration over AI providers and a workflow engine")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send one generation request through the orchestrator
    Generate {
        /// Prompt text
        prompt: String,

        /// Model to request
        #[arg(short, long)]
        model: String,

        /// System message
        #[arg(short, long)]
        system: Option<String>,

        #[arg(short, long)]
        temperature: Option<f32>,

        #[arg(long)]
        max_tokens: Option<u32>,

        #[arg(long)]
        user: Option<String>,

        #[arg(long)]
        session: Option<String>,

        /// Print the full response as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check the health of every available provider
    Health,

    /// List available providers
    Providers {
        /// Check each provider's configuration against its backend
        #[arg(long)]
        validate: bool,
    },

    /// Show smoothed per-provider metrics and breaker state
    Metrics,

    /// Print the effective configuration with credentials masked
    Config,

    /// Talk to the workflow engine
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum WorkflowCommands {
    /// Deploy a zipped process archive
    Deploy {
        archive: PathBuf,
    },

    /// Start a process instance
    Start {
        process_key: String,

        /// Process variable as name=value (repeatable)
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,
    },

    /// List tasks
    Tasks {
        #[arg(long)]
        assignee: Option<String>,

        #[arg(long)]
        candidate_group: Option<String>,
    },

    /// Show historic data for a process instance
    History {
        process_instance_id: String,
    },

    /// Claim a task for a user
    Claim {
        task_id: String,
        assignee: String,
    },

    /// Complete a task
    Complete {
        task_id: String,

        /// Output variable as name=value (repeatable)
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,
    },

    /// Send a signal to an execution
    Signal {
        execution_id: String,
        signal_name: String,

        /// Payload variable as name=value (repeatable)
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,
    },
}

/// Parses `name=value` pairs. Values that read as JSON scalars keep their type;
/// anything else is a string.
pub fn parse_variables(pairs: &[String]) -> Result<Variables> {
    let mut variables = Variables::new();
    for pair in pairs {
        let (name, raw) = pair
            .split_once('=')
            .ok_or_else(|| Error::validation(format!("Expected NAME=VALUE, got '{}'", pair)))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::validation(format!("Variable name missing in '{}'", pair)));
        }

        let value = match serde_json::from_str::<Value>(raw) {
            Ok(value @ (Value::Bool(_) | Value::Number(_) | Value::Null)) => value,
            _ => Value::String(raw.to_string()),
        };
        variables.insert(name.to_string(), value);
    }
    Ok(variables)
}
