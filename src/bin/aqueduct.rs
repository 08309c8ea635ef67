//! Command line front end: explain or run a JSON plan against an in-memory
//! fixture.
#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use aqueduct::query::metadata::{CollectionInfo, IndexDescriptor, IndexKind};
use aqueduct::storage::InMemoryStorage;
use aqueduct::{AqlError, EngineConfig, Executor, Plan, QueryOptions};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "aqueduct",
    version,
    about = "Optimize and execute document-store query plans",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the optimized plan without running it
    Explain(ExplainCmd),
    /// Run a plan and print its results
    Run(RunCmd),
}

#[derive(Args, Debug)]
struct Inputs {
    #[arg(long, value_name = "FILE", help = "Plan in JSON form")]
    plan: PathBuf,

    #[arg(long, value_name = "FILE", help = "Collections, indexes and documents")]
    data: PathBuf,

    #[arg(long, value_name = "FILE", env = "AQUEDUCT_CONFIG", help = "Engine configuration (TOML)")]
    config: Option<PathBuf>,

    #[arg(long, help = "Execute the plan as given, without optimizing")]
    no_optimize: bool,
}

#[derive(Args, Debug)]
struct ExplainCmd {
    #[command(flatten)]
    inputs: Inputs,

    #[arg(long, help = "Print the explain output as JSON")]
    json: bool,
}

#[derive(Args, Debug)]
struct RunCmd {
    #[command(flatten)]
    inputs: Inputs,

    #[arg(long, help = "Record document errors of write nodes instead of failing")]
    ignore_errors: bool,

    #[arg(long, value_name = "N", help = "Rows per pull")]
    batch_size: Option<usize>,

    #[arg(long, help = "Include per-block call statistics")]
    profile: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Fixture {
    #[serde(default)]
    collections: Vec<FixtureCollection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FixtureCollection {
    name: String,
    #[serde(default)]
    documents: Vec<Value>,
    #[serde(default)]
    indexes: Vec<FixtureIndex>,
    #[serde(default = "one")]
    shards: u32,
    #[serde(default)]
    shard_keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FixtureIndex {
    id: String,
    kind: IndexKind,
    fields: Vec<String>,
    #[serde(default)]
    unique: bool,
    #[serde(default)]
    sparse: bool,
}

fn one() -> u32 {
    1
}

#[derive(Debug)]
enum CliError {
    Io(PathBuf, std::io::Error),
    Json(PathBuf, serde_json::Error),
    Config(aqueduct::config::ConfigError),
    Query(AqlError),
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Io(path, err) => write!(f, "cannot read {}: {err}", path.display()),
            CliError::Json(path, err) => write!(f, "invalid JSON in {}: {err}", path.display()),
            CliError::Config(err) => write!(f, "{err}"),
            CliError::Query(err) => write!(f, "[{}] {err}", err.code()),
        }
    }
}

impl From<AqlError> for CliError {
    fn from(err: AqlError) -> Self {
        CliError::Query(err)
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, CliError> {
    let text = fs::read_to_string(path).map_err(|err| CliError::Io(path.to_path_buf(), err))?;
    serde_json::from_str(&text).map_err(|err| CliError::Json(path.to_path_buf(), err))
}

fn load_storage(path: &Path) -> Result<InMemoryStorage, CliError> {
    let fixture: Fixture = read_json(path)?;
    let mut builder = InMemoryStorage::builder();
    for collection in fixture.collections {
        let keys: Vec<&str> = collection.shard_keys.iter().map(String::as_str).collect();
        let mut info = CollectionInfo::new(&collection.name, collection.documents.len() as u64)
            .with_shards(collection.shards, &keys);
        for index in &collection.indexes {
            let fields: Vec<&str> = index.fields.iter().map(String::as_str).collect();
            let mut descriptor = IndexDescriptor::new(&index.id, index.kind, &fields);
            if index.unique {
                descriptor = descriptor.unique();
            }
            if index.sparse {
                descriptor = descriptor.sparse();
            }
            info = info.with_index(descriptor);
        }
        debug!(
            collection = %collection.name,
            documents = collection.documents.len(),
            shards = collection.shards,
            "fixture collection loaded"
        );
        builder = builder.collection(info, collection.documents);
    }
    Ok(builder.build()?)
}

fn prepare(inputs: &Inputs) -> Result<(Executor, Plan), CliError> {
    let config = match &inputs.config {
        Some(path) => EngineConfig::load(path).map_err(CliError::Config)?,
        None => EngineConfig::default(),
    };
    let storage = load_storage(&inputs.data)?;
    let plan_text =
        fs::read_to_string(&inputs.plan).map_err(|err| CliError::Io(inputs.plan.clone(), err))?;
    let plan = Plan::from_json(&plan_text)?;
    Ok((Executor::new(Arc::new(storage), config), plan))
}

fn print_json(value: &impl serde::Serialize) -> Result<(), CliError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| CliError::Query(AqlError::Internal(err.to_string())))?;
    println!("{text}");
    Ok(())
}

fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::Explain(cmd) => {
            let (executor, plan) = prepare(&cmd.inputs)?;
            let options = QueryOptions {
                optimize: !cmd.inputs.no_optimize,
                ..QueryOptions::default()
            };
            let explain = executor.explain(&plan, &options)?;
            if cmd.json {
                print_json(&explain)
            } else {
                print!("{}", explain.render_text());
                Ok(())
            }
        }
        Command::Run(cmd) => {
            let (executor, plan) = prepare(&cmd.inputs)?;
            let mut options = QueryOptions {
                optimize: !cmd.inputs.no_optimize,
                ignore_errors: cmd.ignore_errors,
                profile: cmd.profile,
                ..QueryOptions::default()
            };
            if let Some(batch_size) = cmd.batch_size {
                options = options.with_batch_size(batch_size);
            }
            let result = executor.execute(&plan, options)?;
            print_json(&result)
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("aqueduct=info")),
        )
        .with_writer(std::io::stderr)
        .init();
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}
