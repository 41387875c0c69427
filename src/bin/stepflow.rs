use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use stepflow::model::manifest::load_manifest_from_yaml;
use stepflow::runtime::engine::Engine;
use stepflow::runtime::instance::WorkflowStatus;
use stepflow::steps::StepHandler;
use stepflow::steps::builtin::{AssignHandler, LogHandler};
use stepflow::WorkflowGraph;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the structure of a workflow manifest
    Validate {
        /// Path to the workflow YAML file
        #[arg(long, short)]
        file: PathBuf,
    },

    /// Print step depths and the paths from the initial step to a target
    Paths {
        /// Path to the workflow YAML file
        #[arg(long, short)]
        file: PathBuf,

        /// Target step (defaults to each declared terminal step)
        #[arg(long)]
        to: Option<String>,

        /// Maximum number of paths to enumerate per target
        #[arg(long, default_value_t = 32)]
        max_paths: usize,
    },

    /// Run a workflow locally in memory with the builtin handlers
    Run {
        /// Path to the workflow YAML file
        #[arg(long, short)]
        file: PathBuf,

        /// Initial variables (key=value)
        #[arg(long, short = 'D', value_parser = parse_key_val)]
        vars: Vec<(String, serde_json::Value)>,

        /// Seconds to wait for the run to settle
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
}

fn parse_key_val(s: &str) -> Result<(String, serde_json::Value), String> {
    let pos = s.find('=').ok_or_else(|| format!("invalid KEY=value: no `=` found in `{}`", s))?;
    let key = s[..pos].to_string();
    let val_str = &s[pos + 1..];
    // Try parsing as JSON, otherwise treat as string
    let val = serde_json::from_str(val_str).unwrap_or_else(|_| serde_json::Value::String(val_str.to_string()));
    Ok((key, val))
}

fn builtin_handlers() -> HashMap<String, Arc<dyn StepHandler>> {
    let mut handlers: HashMap<String, Arc<dyn StepHandler>> = HashMap::new();
    handlers.insert("log".to_string(), Arc::new(LogHandler));
    handlers.insert("assign".to_string(), Arc::new(AssignHandler));
    handlers
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file } => {
            let manifest = load_manifest_from_yaml(&file)?;
            let definition = manifest.into_definition(&builtin_handlers())?;
            let findings = definition.validate();
            if findings.is_empty() {
                println!("OK: '{}' ({}) is structurally valid", definition.name, definition.version);
            } else {
                println!("{} problem(s) in '{}':", findings.len(), definition.name);
                for finding in &findings {
                    println!("  - {}", finding);
                }
                std::process::exit(1);
            }
        }

        Commands::Paths { file, to, max_paths } => {
            let manifest = load_manifest_from_yaml(&file)?;
            let definition = manifest.into_definition(&builtin_handlers())?;
            let graph = WorkflowGraph::new(&definition);

            let mut step_names: Vec<&String> = definition.steps.keys().collect();
            step_names.sort();
            println!("Step depths (from '{}'):", definition.initial_step);
            for name in step_names {
                println!("  {:>3}  {}", graph.get_step_depth(name), name);
            }

            let targets: Vec<String> = match to {
                Some(step) => vec![step],
                None => definition.terminal_steps.iter().cloned().collect(),
            };
            for target in targets {
                let paths = graph.get_all_paths(&definition.initial_step, &target, max_paths);
                println!("Paths to '{}' ({}):", target, paths.len());
                for path in paths {
                    println!("  {}", path.join(" -> "));
                }
            }
        }

        Commands::Run { file, vars, timeout } => {
            let manifest = load_manifest_from_yaml(&file)?;
            let definition = manifest.into_definition(&builtin_handlers())?;
            definition.ensure_valid()?;

            let name = definition.name.clone();
            let engine = Arc::new(Engine::new());
            engine.register(definition);

            let initial_data: HashMap<String, serde_json::Value> = vars.into_iter().collect();
            let instance_id = engine.start_workflow(&name, None, initial_data).await?;
            info!(instance_id = %instance_id, "instance started");

            let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout);
            let instance = loop {
                let instance = engine.get_instance(instance_id).await?;
                if instance.status.is_terminal() || instance.status == WorkflowStatus::Waiting {
                    break instance;
                }
                if tokio::time::Instant::now() >= deadline {
                    break instance;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            };

            println!("status: {:?}", instance.status);
            if let Some(step) = &instance.current_step {
                println!("current step: {}", step);
            }
            if let Some(error) = &instance.error {
                println!("error: {}", error);
            }
            println!("history:");
            for record in instance.context.history() {
                println!("  {:<20} {:?}", record.step_name, record.status);
            }
            println!("context:");
            let mut data: Vec<(String, serde_json::Value)> =
                instance.context.data_snapshot().into_iter().collect();
            data.sort_by(|a, b| a.0.cmp(&b.0));
            for (key, value) in data {
                println!("  {} = {}", key, value);
            }
        }
    }

    Ok(())
}
