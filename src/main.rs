//! # HubHarvest CLI
//!
//! The `hubharvest` binary drives CRM extractions from a TOML configuration
//! file.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `hubharvest run` | Extract all enabled object types to CSV tables |
//! | `hubharvest endpoints` | List the object types the registry knows about |
//! | `hubharvest properties <object>` | List property names available for an object type |
//!
//! ## Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Every enabled object type extracted successfully |
//! | 1 | User error: bad configuration, unknown object type, invalid credential |
//! | 2 | Transient upstream failure: rate limits or server errors that outlived the retry budget |
//!
//! The distinction lets an orchestrating platform retry code 2 runs and
//! park code 1 runs for a human.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use hubharvest::checkpoint::CheckpointStore;
use hubharvest::client::{ApiClient, HttpTransport, RetryPolicy};
use hubharvest::config::{load_config, Config};
use hubharvest::error::ExtractError;
use hubharvest::extract::{registry_for, run_extraction, RunReport};
use hubharvest::properties::fetch_property_schema;
use hubharvest::sink::CsvSink;

/// HubHarvest — extract HubSpot CRM objects into tabular datasets.
#[derive(Parser)]
#[command(
    name = "hubharvest",
    about = "Extract HubSpot CRM objects into tabular datasets",
    version,
    long_about = "HubHarvest walks the HubSpot API endpoint by endpoint, resolves the property \
    selection for each object type, pages through records under the account rate limit, and \
    writes flattened, schema-stable CSV tables with column manifests. Incremental runs resume \
    from per-object checkpoints stored in SQLite."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/hubharvest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the extraction across all enabled object types.
    ///
    /// Walks every enabled endpoint, streams pages into the destination
    /// tables, and commits per-object checkpoints. The run report lists
    /// succeeded and failed object types; nothing fails silently.
    Run,

    /// List the object types the registry knows about.
    ///
    /// Includes custom object types from the configuration and each
    /// endpoint's capabilities (associations, archived listing,
    /// incremental fetching).
    Endpoints,

    /// List the property names available for an object type.
    ///
    /// Queries the live property schema; useful for building
    /// `[properties.custom_lists]` entries.
    Properties {
        /// Object type name, e.g. `contact` or a custom type id.
        object_type: String,
    },
}

fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            classify_error(&err)
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run => run(&config).await,
        Commands::Endpoints => {
            list_endpoints(&config);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Properties { object_type } => {
            list_properties(&config, &object_type).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(config: &Config) -> anyhow::Result<ExitCode> {
    let client = build_client(config)?;
    let registry = registry_for(config);
    let store = CheckpointStore::open(&config.state.path).await?;
    let mut sink = CsvSink::new(&config.destination.out_dir, config.destination.load_mode)?;

    let report = run_extraction(config, &registry, &client, &store, &mut sink).await?;
    store.close().await;

    print_report(&report);
    Ok(report_exit_code(&report))
}

fn build_client(config: &Config) -> anyhow::Result<ApiClient> {
    let token = config.api.resolve_token()?;
    let transport = HttpTransport::new(
        &config.api.base_url,
        token,
        Duration::from_secs(config.api.timeout_secs),
    )?;
    Ok(ApiClient::new(
        Arc::new(transport),
        RetryPolicy::with_max_retries(config.api.max_retries),
    ))
}

fn list_endpoints(config: &Config) {
    let registry = registry_for(config);

    println!(
        "{:<16} {:<12} {:<12} {:<12} {:<12}",
        "OBJECT TYPE", "PROPERTIES", "ASSOCIATIONS", "ARCHIVED", "INCREMENTAL"
    );
    for object_type in registry.object_types() {
        let def = registry
            .lookup(object_type)
            .expect("listed object types are registered");
        println!(
            "{:<16} {:<12} {:<12} {:<12} {:<12}",
            object_type,
            def.supports_properties,
            def.supports_associations,
            def.supports_archived,
            def.supports_incremental,
        );
    }
}

async fn list_properties(config: &Config, object_type: &str) -> anyhow::Result<()> {
    let registry = registry_for(config);
    let def = registry.lookup(object_type)?;
    if !def.supports_properties {
        println!("{} does not support property selection.", object_type);
        return Ok(());
    }

    let client = build_client(config)?;
    let names = fetch_property_schema(&client, object_type).await?;
    for name in names {
        println!("{}", name);
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!("extraction finished");
    println!("  succeeded: {} object types", report.succeeded.len());
    for object_type in &report.succeeded {
        println!("    {}", object_type);
    }
    if !report.failed.is_empty() {
        println!("  failed: {} streams", report.failed.len());
        for (name, err) in &report.failed {
            println!("    {} — {}", name, err);
        }
    }
}

fn report_exit_code(report: &RunReport) -> ExitCode {
    if report.is_success() {
        ExitCode::SUCCESS
    } else if report.failed.iter().any(|(_, err)| err.is_user_error()) {
        ExitCode::from(1)
    } else {
        ExitCode::from(2)
    }
}

/// User errors exit 1; anything else (upstream trouble, local I/O) exits 2
/// so the platform may retry the run.
fn classify_error(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<ExtractError>() {
        Some(extract_err) if extract_err.is_user_error() => ExitCode::from(1),
        Some(_) => ExitCode::from(2),
        // Config file loading and parsing failures are user errors.
        None => ExitCode::from(1),
    }
}
