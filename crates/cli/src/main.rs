//! `graphflow` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`: check a graph document without running it.
//! - `run`: execute a graph against the local agent pool and event bus.
//! - `types`: list the registered node types.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use engine::{ExecutorConfig, WorkflowExecutor};
use nodes::local::{EchoRunner, FixedAgentPool, InMemoryEventBus};
use nodes::{ExecutionContext, Graph, NodeRegistry};

#[derive(Parser)]
#[command(name = "graphflow", about = "Graph workflow execution engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a graph JSON file.
    Validate {
        /// Path to the graph JSON file.
        path: PathBuf,
    },
    /// Run a graph JSON file to completion and print the outcome.
    Run {
        /// Path to the graph JSON file.
        path: PathBuf,
        /// JSON value emitted by the start node.
        #[arg(long, default_value = "null")]
        input: String,
        /// Graph parameter as `name=value`; the value is parsed as JSON when it can be.
        #[arg(long = "param", value_name = "NAME=VALUE")]
        params: Vec<String>,
        /// Executor config JSON file.
        #[arg(long, env = "GRAPHFLOW_CONFIG")]
        config: Option<PathBuf>,
        /// Checkpoint file; an existing one is resumed from.
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        /// Run one node per line read from stdin.
        #[arg(long)]
        debug: bool,
        /// Seats in the local agent pool.
        #[arg(long, default_value_t = 5)]
        agents: usize,
    },
    /// List registered node types.
    Types,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let registry = Arc::new(NodeRegistry::with_builtins());

    match cli.command {
        Command::Validate { path } => {
            let graph = load_graph(&path).await?;
            let report = registry.validate(&graph);
            for warning in &report.warnings {
                println!("warning: {warning}");
            }
            for error in &report.errors {
                println!("error: {error}");
            }
            if !report.is_valid() {
                bail!("{} has {} error(s)", path.display(), report.errors.len());
            }
            println!("{} is valid ({} nodes, {} connections)", graph.name, graph.nodes.len(), graph.connections.len());
        }
        Command::Run { path, input, params, config, checkpoint, debug, agents } => {
            let graph = load_graph(&path).await?;
            let input: Value = serde_json::from_str(&input).context("--input is not valid JSON")?;

            let mut config = match config {
                Some(path) => ExecutorConfig::load(&path)
                    .await
                    .with_context(|| format!("cannot load config {}", path.display()))?,
                None => ExecutorConfig::default(),
            };
            config.debug |= debug;
            let debug = config.debug;
            if checkpoint.is_some() {
                config.checkpoint_path = checkpoint;
            }

            let mut ctx = ExecutionContext::new(&graph, parse_params(&params)?)?;
            ctx.bind_agents(Arc::new(FixedAgentPool::with_size(agents, Arc::new(EchoRunner))));
            ctx.bind_events(Arc::new(InMemoryEventBus::new()));

            let executor = Arc::new(WorkflowExecutor::new(graph, registry, ctx, config));
            if debug {
                executor.set_debug_callback(|event| {
                    let state = serde_json::to_string(&event.state).unwrap_or_default();
                    eprintln!("[debug] {} {state}", event.node_id);
                });
                tokio::spawn(step_on_enter(Arc::clone(&executor)));
            }

            let cancel = {
                let executor = Arc::clone(&executor);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("interrupt received, cancelling run");
                        executor.cancel();
                    }
                })
            };

            let outcome = executor.execute(input).await;
            cancel.abort();
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.success {
                bail!(outcome.error.unwrap_or_else(|| "run failed".into()));
            }
        }
        Command::Types => {
            for def in registry.definitions() {
                let inputs: Vec<&str> = def.inputs.iter().map(|p| p.id.as_str()).collect();
                let outputs: Vec<&str> = def.outputs.iter().map(|p| p.id.as_str()).collect();
                println!(
                    "{:<12} {:<8} in [{}] out [{}]  {}",
                    def.type_tag,
                    def.category,
                    inputs.join(", "),
                    outputs.join(", "),
                    def.description
                );
            }
        }
    }
    Ok(())
}

async fn load_graph(path: &Path) -> Result<Graph> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;
    let graph: Graph = serde_json::from_str(&raw).with_context(|| format!("{} is not a graph document", path.display()))?;
    info!(graph = %graph.name, nodes = graph.nodes.len(), "loaded graph");
    Ok(graph)
}

fn parse_params(raw: &[String]) -> Result<Map<String, Value>> {
    let mut params = Map::new();
    for entry in raw {
        let Some((name, value)) = entry.split_once('=') else {
            bail!("parameter '{entry}' is not NAME=VALUE");
        };
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_owned()));
        params.insert(name.trim().to_owned(), value);
    }
    Ok(params)
}

/// Debug mode: each line on stdin releases the next node.
async fn step_on_enter(executor: Arc<WorkflowExecutor>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(_)) = lines.next_line().await {
        if executor.run_status().is_terminal() {
            break;
        }
        executor.step();
    }
}
