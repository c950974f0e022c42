//! KF-021: CLI subcommands: run, validate, graph, schema, completion.

pub mod logging;

use crate::core::config::EngineConfig;
use crate::core::handler::Engine;
use crate::core::parser::{self, BlockSpec, GraphDocument};
use crate::core::store::Store;
use crate::core::types::{self, Diagnostic, Value, Variable};
use crate::provider::memory::MemoryProvider;
use crate::provider::ProviderRegistry;
use clap::{CommandFactory, Parser, Subcommand};
use indexmap::{IndexMap, IndexSet};
use logging::LogFormat;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "kform",
    version,
    about = "KRM-native infrastructure as code: concurrent block graph execution"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log line format (filter via KFORM_LOG)
    #[arg(long, global = true, value_enum, default_value_t)]
    pub log_format: LogFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute a graph document against in-memory providers
    Run {
        /// Path to the graph document
        #[arg(short, long, default_value = "kform.yaml")]
        file: PathBuf,

        /// Root input value, `name=value` (value parsed as YAML)
        #[arg(short, long = "input", value_name = "NAME=VALUE")]
        inputs: Vec<String>,

        /// Engine config file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Print outputs as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a graph document without executing it
    Validate {
        /// Path to the graph document
        #[arg(short, long, default_value = "kform.yaml")]
        file: PathBuf,
    },

    /// Print the execution order and edges of the root graph
    Graph {
        /// Path to the graph document
        #[arg(short, long, default_value = "kform.yaml")]
        file: PathBuf,
    },

    /// Print the JSON schema of the graph document format
    Schema,

    /// Generate shell completions
    Completion {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Run {
            file,
            inputs,
            config,
            json,
        } => cmd_run(&file, &inputs, config.as_deref(), json),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Graph { file } => cmd_graph(&file),
        Commands::Schema => cmd_schema(),
        Commands::Completion { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, "kform", &mut std::io::stdout());
            Ok(())
        }
    }
}

fn parse_and_validate(file: &Path) -> Result<GraphDocument, String> {
    let doc = parser::parse_document_file(file)?;
    let errors = parser::validate_document(&doc);
    if errors.is_empty() {
        return Ok(doc);
    }
    for e in &errors {
        eprintln!("  ERROR: {}", e);
    }
    Err("validation failed".to_string())
}

fn count_blocks(blocks: &IndexMap<String, BlockSpec>) -> usize {
    blocks
        .values()
        .map(|b| 1 + b.blocks.as_ref().map_or(0, count_blocks))
        .sum()
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let doc = parser::parse_document_file(file)?;
    let errors = parser::validate_document(&doc);

    if errors.is_empty() {
        println!(
            "OK: {} ({} blocks, {} total with modules)",
            doc.name,
            doc.blocks.len(),
            count_blocks(&doc.blocks)
        );
        Ok(())
    } else {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        Err(format!("{} validation error(s)", errors.len()))
    }
}

fn cmd_graph(file: &Path) -> Result<(), String> {
    let doc = parse_and_validate(file)?;
    let dag = parser::build_dag(&doc, &file.display().to_string()).map_err(|e| e.to_string())?;
    let order = dag.topological_order().map_err(|e| e.to_string())?;
    for name in order.iter().filter(|n| n.as_str() != types::ROOT_VERTEX) {
        let deps: Vec<String> = dag
            .get_up_vertexes(name)
            .into_iter()
            .filter(|d| d != types::ROOT_VERTEX)
            .collect();
        if deps.is_empty() {
            println!("{}", name);
        } else {
            println!("{} <- {}", name, deps.join(", "));
        }
    }
    Ok(())
}

fn cmd_schema() -> Result<(), String> {
    println!("{}", parser::document_schema()?);
    Ok(())
}

/// Parse `name=value` into a store key and value. The `input.` prefix is
/// optional; values that are not valid YAML are taken as strings.
fn parse_input(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("input '{}' must be NAME=VALUE", raw))?;
    let name = name.trim();
    let name = name.strip_prefix("input.").unwrap_or(name);
    if name.is_empty() {
        return Err(format!("input '{}' has an empty name", raw));
    }
    let value = serde_yaml_ng::from_str(value).unwrap_or_else(|_| Value::from(value));
    Ok((format!("input.{}", name), value))
}

/// Provider names declared anywhere in the document, modules included.
fn provider_names(blocks: &IndexMap<String, BlockSpec>, out: &mut IndexSet<String>) {
    for (name, spec) in blocks {
        if spec.block_type == types::BlockType::Provider {
            if let Some((_, id)) = name.split_once('.') {
                out.insert(id.to_string());
            }
        }
        if let Some(nested) = &spec.blocks {
            provider_names(nested, out);
        }
    }
}

fn load_engine_config(path: Option<&Path>) -> Result<EngineConfig, String> {
    let config = match path {
        Some(p) => EngineConfig::load(p).map_err(|e| e.to_string())?,
        None => EngineConfig::default(),
    };
    Ok(config.with_env_overrides())
}

/// Sorted `output.*` values of a store.
fn collect_outputs(store: &Store) -> IndexMap<String, Value> {
    let mut outputs: Vec<(String, Value)> = store
        .list()
        .into_iter()
        .filter(|(name, _)| name.starts_with("output."))
        .map(|(name, var)| (name, var.to_value()))
        .collect();
    outputs.sort_by(|a, b| a.0.cmp(&b.0));
    outputs.into_iter().collect()
}

/// Execute a validated document and return the root outputs plus every
/// diagnostic recorded.
fn execute(
    doc: &GraphDocument,
    file_name: &str,
    inputs: &[String],
    config: EngineConfig,
) -> Result<(bool, IndexMap<String, Value>, Vec<Diagnostic>), String> {
    let dag = parser::build_dag(doc, file_name).map_err(|e| e.to_string())?;

    let mut names = IndexSet::new();
    provider_names(&doc.blocks, &mut names);
    let mut providers = ProviderRegistry::new();
    for name in &names {
        providers.register(name, Arc::new(MemoryProvider::new(name)));
    }

    let store = Arc::new(Store::new());
    for raw in inputs {
        let (key, value) = parse_input(raw)?;
        store.upsert(&key, Variable::single(value));
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("failed to start runtime: {}", e))?;

    let engine = Arc::new(Engine::new(config, providers));
    let success = runtime.block_on(async {
        let success = engine.run(Arc::new(dag), store.clone()).await;
        engine.providers.stop_all().await;
        success
    });
    info!(document = %doc.name, success, "graph executed");
    Ok((success, collect_outputs(&store), engine.recorder.get()))
}

fn print_outputs(outputs: &IndexMap<String, Value>, json: bool) -> Result<(), String> {
    if json {
        let text =
            serde_json::to_string_pretty(outputs).map_err(|e| format!("JSON error: {}", e))?;
        println!("{}", text);
    } else {
        for (name, value) in outputs {
            println!("{} = {}", name, value);
        }
    }
    Ok(())
}

fn cmd_run(
    file: &Path,
    inputs: &[String],
    config: Option<&Path>,
    json: bool,
) -> Result<(), String> {
    let doc = parse_and_validate(file)?;
    let config = load_engine_config(config)?;
    let (success, outputs, diagnostics) =
        execute(&doc, &file.display().to_string(), inputs, config)?;

    for d in &diagnostics {
        let level = if d.is_error() { "ERROR" } else { "WARN" };
        eprintln!("  {}: {}: {}", level, d.context, d.detail);
    }
    if !success {
        if diagnostics.iter().any(Diagnostic::is_error) {
            return Err("run failed".to_string());
        }
        return Err("run failed without diagnostics (scheduler did not finish)".to_string());
    }
    print_outputs(&outputs, json)
}
