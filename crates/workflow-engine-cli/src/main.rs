//! Command-line entry point for the workflow engine.

use clap::{Parser, Subcommand};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workflow_engine_core::{Engine, RunOptions, RunState, StateStore, TaskRegistry, WorkflowDocument};

#[derive(Parser)]
#[command(name = "workflow")]
#[command(version, about = "Run and inspect YAML-driven workflows", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow document
    Run {
        /// Path to the workflow YAML file
        workflow_file: PathBuf,

        /// KEY=VALUE pairs bound into the `args` namespace
        #[arg(value_name = "KEY=VALUE")]
        args: Vec<String>,

        /// Named flow to run (defaults to the document's default flow, or all steps)
        #[arg(long)]
        flow: Option<String>,

        /// Resume the latest run instead of starting a new one
        #[arg(long)]
        resume: bool,

        /// Start execution at a specific step (skipping everything before it)
        #[arg(long)]
        start_from: Option<String>,

        /// Comma-separated list of step names to skip entirely
        #[arg(long, value_delimiter = ',')]
        skip_steps: Vec<String>,

        /// Workspace directory (defaults to the workflow file's parent directory)
        #[arg(long)]
        workspace: Option<PathBuf>,
    },

    /// List workflow documents under a directory
    List {
        #[arg(long, default_value = ".")]
        base_dir: PathBuf,
    },

    /// Validate a workflow document without running it
    Validate { workflow_file: PathBuf },

    /// Inspect or manage persisted run state
    Workspace {
        #[command(subcommand)]
        action: WorkspaceAction,
    },

    /// Scaffold a new workflow document
    Init {
        #[arg(long, default_value = ".")]
        dir: PathBuf,

        #[arg(long, default_value = "basic")]
        example: String,
    },
}

#[derive(Subcommand)]
enum WorkspaceAction {
    /// List recorded runs for a workflow
    List {
        workflow_name: String,
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
    },
    /// Remove a specific run's persisted state
    Remove {
        workflow_name: String,
        run_number: u64,
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
    },
    /// Remove all persisted state under a workspace
    Clean {
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
    },
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "workflow_engine_cli=info,workflow_engine_core=info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    init_logging();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { workflow_file, args, flow, resume, start_from, skip_steps, workspace } => {
            run_command(workflow_file, args, flow, resume, start_from, skip_steps, workspace).await
        }
        Commands::List { base_dir } => list_command(base_dir),
        Commands::Validate { workflow_file } => validate_command(workflow_file),
        Commands::Workspace { action } => workspace_command(action).await,
        Commands::Init { dir, example } => init_command(dir, example),
    };

    if let Err(e) = result {
        error!(error = %e, "command failed");
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn parse_args(pairs: &[String]) -> Result<HashMap<String, serde_json::Value>, String> {
    let mut args = HashMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("argument '{}' is not in KEY=VALUE form", pair))?;
        let parsed = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        args.insert(key.to_string(), parsed);
    }
    Ok(args)
}

fn load_document(workflow_file: &Path) -> Result<WorkflowDocument, String> {
    let raw = std::fs::read_to_string(workflow_file)
        .map_err(|e| format!("reading '{}': {}", workflow_file.display(), e))?;
    serde_yaml::from_str(&raw).map_err(|e| format!("parsing '{}': {}", workflow_file.display(), e))
}

async fn run_command(
    workflow_file: PathBuf,
    args: Vec<String>,
    flow: Option<String>,
    resume: bool,
    start_from: Option<String>,
    skip_steps: Vec<String>,
    workspace: Option<PathBuf>,
) -> Result<(), String> {
    let doc = load_document(&workflow_file)?;
    let parsed_args = parse_args(&args)?;
    let workspace = workspace.unwrap_or_else(|| {
        workflow_file.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."))
    });

    let mut registry = TaskRegistry::new();
    workflow_engine_tasks::register_all(&mut registry).map_err(|e| e.to_string())?;

    let engine = Engine::new(doc, registry, workspace).map_err(|e| e.to_string())?;

    let options = RunOptions {
        args: parsed_args,
        flow,
        resume,
        start_from,
        skip_steps: skip_steps.into_iter().collect::<HashSet<_>>(),
    };

    let state = engine.run(options).await.map_err(|e| e.to_string())?;
    print_run_summary(&state);
    Ok(())
}

fn print_run_summary(state: &RunState) {
    info!(status = ?state.status, steps = state.completed_steps.len(), "run finished");
    println!("workflow:   {}", state.workflow_name);
    println!("run number: {}", state.run_number);
    println!("status:     {:?}", state.status);
    println!("steps completed: {}", state.completed_steps.join(", "));
    if let Some(failed) = &state.failed_step {
        println!("failed step: {} ({})", failed.step_name, failed.error);
    }
}

fn list_command(base_dir: PathBuf) -> Result<(), String> {
    let mut found = Vec::new();
    collect_workflow_files(&base_dir, &mut found)?;
    found.sort();
    for path in &found {
        match load_document(path) {
            Ok(doc) => println!("{}\t{}", path.display(), doc.name),
            Err(_) => println!("{}\t<unparsed>", path.display()),
        }
    }
    Ok(())
}

fn collect_workflow_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), String> {
    let entries = std::fs::read_dir(dir).map_err(|e| format!("reading '{}': {}", dir.display(), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| e.to_string())?;
        let path = entry.path();
        if path.is_dir() {
            if path.file_name().map(|n| n == ".workflow_state").unwrap_or(false) {
                continue;
            }
            collect_workflow_files(&path, out)?;
        } else if matches!(path.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml")) {
            out.push(path);
        }
    }
    Ok(())
}

fn validate_command(workflow_file: PathBuf) -> Result<(), String> {
    let doc = load_document(&workflow_file)?;
    let registry = TaskRegistry::new();
    Engine::new(doc, registry, PathBuf::from(".")).map_err(|e| e.to_string())?;
    println!("{}: valid", workflow_file.display());
    Ok(())
}

async fn workspace_command(action: WorkspaceAction) -> Result<(), String> {
    match action {
        WorkspaceAction::List { workflow_name, workspace } => {
            let store = StateStore::new(&workspace);
            let latest = store.latest_run_number(&workflow_name).await.map_err(|e| e.to_string())?;
            if latest == 0 {
                println!("no runs recorded for '{}'", workflow_name);
                return Ok(());
            }
            for run_number in 1..=latest {
                if let Some(state) = store.load(&workflow_name, run_number).await.map_err(|e| e.to_string())? {
                    println!("run {}: {:?} ({} steps completed)", run_number, state.status, state.completed_steps.len());
                }
            }
        }
        WorkspaceAction::Remove { workflow_name, run_number, workspace } => {
            let path = workspace.join(".workflow_state").join(&workflow_name).join(format!("run_{}.json", run_number));
            std::fs::remove_file(&path).map_err(|e| format!("removing '{}': {}", path.display(), e))?;
            println!("removed run {} of '{}'", run_number, workflow_name);
        }
        WorkspaceAction::Clean { workspace } => {
            let path = workspace.join(".workflow_state");
            if path.exists() {
                std::fs::remove_dir_all(&path).map_err(|e| format!("removing '{}': {}", path.display(), e))?;
            }
            println!("cleaned {}", path.display());
        }
    }
    Ok(())
}

fn init_command(dir: PathBuf, example: String) -> Result<(), String> {
    std::fs::create_dir_all(&dir).map_err(|e| e.to_string())?;
    let template = match example.as_str() {
        "basic" => BASIC_TEMPLATE,
        other => return Err(format!("unknown example template: {}", other)),
    };
    let path = dir.join("workflow.yaml");
    std::fs::write(&path, template).map_err(|e| e.to_string())?;
    println!("wrote {}", path.display());
    Ok(())
}

const BASIC_TEMPLATE: &str = r#"name: example-workflow
description: A minimal workflow demonstrating templated inputs.
params:
  name:
    type: string
    default: world

steps:
  - name: greet
    task: echo
    inputs:
      message: "Hello, {{ args.name }}!"
"#;
