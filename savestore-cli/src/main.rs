/*!
Savestore CLI - inspect and manage save data through the savestore engine.

Records live in a local directory (or in memory for dry runs). The CLI can
save, load and delete records, export a save bundle and import one with a
chosen conflict resolution strategy.
*/

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use savestore_core::{
    init_observability, DataConfig, DataContext, ImportOptions, ImportOutcome, ImportPreview, LoadOptions,
    ResolutionStrategy, SaveOptions, Selection, StorageConfig,
};
use serde_json::Value;
use tabled::{Table, Tabled};
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "savestore")]
#[command(about = "CLI for the savestore save-data engine")]
#[command(version)]
struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Storage location: a directory, file:///dir or memory://
    #[arg(short, long, global = true, env = "SAVESTORE_STORE", default_value = "./savestore-data")]
    store: String,

    /// JSON configuration file; command-line flags override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Retry transient storage failures
    #[arg(long, global = true)]
    retry: bool,

    /// Key namespace
    #[arg(short, long, global = true)]
    namespace: Option<String>,

    /// Register a data type that is always chunked
    #[arg(long = "large-type", global = true)]
    large_types: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Save a record
    Save {
        data_type: String,
        /// JSON value, or @path to read it from a file
        data: String,
        /// Store as chunks plus metadata
        #[arg(long)]
        large: bool,
        /// Items per chunk for large data
        #[arg(long)]
        chunk_size: Option<usize>,
    },
    /// Print a stored record
    Load {
        data_type: String,
        /// Read chunked data directly
        #[arg(long)]
        large: bool,
    },
    /// Delete a record and any chunks it owns
    Delete {
        data_type: String,
        /// Only remove chunks and chunk metadata
        #[arg(long)]
        large: bool,
    },
    /// Write a save bundle
    Export {
        /// Comma-separated data types; all registered types when omitted
        #[arg(long, value_delimiter = ',')]
        types: Vec<String>,
        /// Output file; a timestamped name is used when omitted
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Import a save bundle
    Import {
        file: PathBuf,
        /// merge, overwrite, keep or selective
        #[arg(long, default_value = "merge")]
        strategy: String,
        /// Per-type choice for the selective strategy, as type=keep|import
        #[arg(long = "select")]
        selections: Vec<String>,
        /// Require the bundle's game version to match exactly
        #[arg(long)]
        strict: bool,
        /// Roll back every written type if one fails
        #[arg(long)]
        atomic: bool,
        /// Abort on the first failing type instead of skipping it
        #[arg(long)]
        no_partial: bool,
        /// Show what would happen without writing anything
        #[arg(long)]
        preview: bool,
    },
    /// Show engine status
    Status,
}

#[derive(Tabled)]
struct TypeRow {
    #[tabled(rename = "Data type")]
    data_type: String,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

#[derive(Tabled)]
struct ConflictRow {
    #[tabled(rename = "Data type")]
    data_type: String,
    #[tabled(rename = "Field")]
    field: String,
    #[tabled(rename = "Stored")]
    existing: String,
    #[tabled(rename = "Imported")]
    imported: String,
    #[tabled(rename = "Action")]
    action: String,
}

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "Metric")]
    metric: String,
    #[tabled(rename = "Value")]
    value: String,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    if cli.verbose && std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "debug");
    }
    init_observability(cli.json_logs)?;

    let config = build_config(&cli)?;
    let context = DataContext::from_config(config)?;

    let outcome = run(&context, cli.command).await;
    context.shutdown();
    outcome
}

fn build_config(cli: &Cli) -> Result<DataConfig, anyhow::Error> {
    let mut config = match &cli.config {
        Some(path) => DataConfig::from_json_file(path)
            .with_context(|| format!("failed to read config {}", path.display()))?,
        None => DataConfig::default(),
    };
    config.storage = StorageConfig {
        compress: config.storage.compress,
        retry: config.storage.retry || cli.retry,
        ..StorageConfig::from_uri(&cli.store)?
    };
    if let Some(namespace) = &cli.namespace {
        config.engine.namespace = namespace.clone();
    }
    config.engine.large_types.extend(cli.large_types.iter().cloned());
    config.validate()?;
    debug!(store = %cli.store, namespace = %config.engine.namespace, "configuration loaded");
    Ok(config)
}

async fn run(context: &DataContext, command: Commands) -> Result<(), anyhow::Error> {
    match command {
        Commands::Save {
            data_type,
            data,
            large,
            chunk_size,
        } => save(context, &data_type, &data, large, chunk_size).await,
        Commands::Load { data_type, large } => load(context, &data_type, large).await,
        Commands::Delete { data_type, large } => delete(context, &data_type, large).await,
        Commands::Export { types, out } => export(context, &types, out).await,
        Commands::Import {
            file,
            strategy,
            selections,
            strict,
            atomic,
            no_partial,
            preview,
        } => {
            let strategy = ResolutionStrategy::from_str(&strategy)?;
            let mut options = ImportOptions::default();
            for selection in &selections {
                let (data_type, choice) = parse_selection(selection)?;
                options = options.select(data_type, choice);
            }
            if strict {
                options = options.strict();
            }
            if atomic {
                options = options.atomic();
            }
            if no_partial {
                options.allow_partial_import = Some(false);
            }
            import(context, &file, strategy, options, preview).await
        }
        Commands::Status => status(context),
    }
}

async fn save(
    context: &DataContext,
    data_type: &str,
    data: &str,
    large: bool,
    chunk_size: Option<usize>,
) -> Result<(), anyhow::Error> {
    let value = read_json_arg(data)?;
    let mut options = SaveOptions::default();
    if let Some(chunk_size) = chunk_size {
        options = options.with_chunk_size(chunk_size);
    }

    let manager = context.manager();
    let result = if large {
        manager.save_large_data(data_type, value, options).await?
    } else {
        manager.save(data_type, value, options).await?
    };

    match result.chunks {
        Some(chunks) => println!(
            "✓ Saved {} ({} in {chunks} chunks, {} ms)",
            result.data_type,
            format_size(result.size),
            result.duration_ms
        ),
        None => println!(
            "✓ Saved {} ({}, {} ms)",
            result.data_type,
            format_size(result.size),
            result.duration_ms
        ),
    }
    Ok(())
}

async fn load(context: &DataContext, data_type: &str, large: bool) -> Result<(), anyhow::Error> {
    let manager = context.manager();
    let value = if large {
        manager.load_large_data(data_type, LoadOptions::uncached()).await?
    } else {
        manager.load(data_type, LoadOptions::uncached()).await?
    };

    if value.is_null() {
        bail!("no stored data for '{data_type}'");
    }
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn delete(context: &DataContext, data_type: &str, large: bool) -> Result<(), anyhow::Error> {
    let manager = context.manager();
    let result = if large {
        manager.delete_large_data(data_type).await?
    } else {
        manager.delete(data_type).await?
    };
    println!(
        "✓ Deleted {} ({} keys, {} chunks)",
        result.data_type, result.removed_keys, result.chunks
    );
    Ok(())
}

async fn export(context: &DataContext, types: &[String], out: Option<PathBuf>) -> Result<(), anyhow::Error> {
    let bundle = context.exporter().export_data(types).await?;
    let out = out.unwrap_or_else(|| {
        PathBuf::from(format!(
            "bubblepop-save-{}.json",
            chrono::Local::now().format("%Y%m%d-%H%M%S")
        ))
    });

    let rendered = serde_json::to_string_pretty(&bundle.to_value()?)?;
    tokio::fs::write(&out, rendered)
        .await
        .with_context(|| format!("failed to write {}", out.display()))?;

    info!(export_id = %bundle.header.export_id, path = %out.display(), "bundle written");
    println!(
        "✓ Exported {} to {} ({})",
        bundle.metadata.data_types.join(", "),
        out.display(),
        format_size(bundle.metadata.size)
    );
    Ok(())
}

async fn import(
    context: &DataContext,
    file: &PathBuf,
    strategy: ResolutionStrategy,
    options: ImportOptions,
    preview: bool,
) -> Result<(), anyhow::Error> {
    let raw = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let bundle: Value = serde_json::from_str(&raw).context("bundle is not valid JSON")?;

    if preview {
        let preview = context.importer().preview_import(&bundle, strategy, &options).await?;
        print_preview(&preview);
        return Ok(());
    }

    let outcome = context.importer().import_data(&bundle, strategy, options).await?;
    print_outcome(&outcome);
    if !outcome.success && !outcome.partial {
        bail!("import failed");
    }
    Ok(())
}

fn print_preview(preview: &ImportPreview) {
    println!(
        "Bundle: {} ({}), {}",
        preview.data_types.join(", "),
        format_size(preview.data_size),
        if preview.is_valid { "valid" } else { "INVALID" }
    );
    for error in &preview.validation.errors {
        println!("  ✗ {error}");
    }
    for warning in preview.validation.warnings.iter().chain(&preview.warnings) {
        println!("  ! {warning}");
    }

    let rows: Vec<ConflictRow> = preview
        .resolution_preview
        .actions
        .iter()
        .map(|action| ConflictRow {
            data_type: action.data_type.clone(),
            field: action.field.clone().unwrap_or_else(|| "*".to_string()),
            existing: render(action.existing.as_ref()),
            imported: render(action.imported.as_ref()),
            action: action.action.describe().to_string(),
        })
        .collect();
    if rows.is_empty() {
        println!("No conflicts with stored data");
    } else {
        println!("{}", Table::new(rows));
    }
}

fn print_outcome(outcome: &ImportOutcome) {
    let rows: Vec<TypeRow> = outcome
        .results
        .iter()
        .map(|result| TypeRow {
            data_type: result.data_type.clone(),
            result: match (result.success, result.skipped) {
                (true, _) => "imported".to_string(),
                (false, true) => "skipped".to_string(),
                (false, false) => "failed".to_string(),
            },
            detail: result.error.clone().unwrap_or_default(),
        })
        .collect();
    println!("{}", Table::new(rows));
    println!(
        "Import {}: {} conflicts resolved with {} in {} ms{}",
        outcome.import_id,
        outcome.conflicts,
        outcome.conflict_resolution,
        outcome.duration_ms,
        if outcome.partial { " (partial)" } else { "" }
    );
}

fn status(context: &DataContext) -> Result<(), anyhow::Error> {
    let status = context.manager().get_status();
    let rows = vec![
        StatusRow {
            metric: "Namespace".to_string(),
            value: status.namespace.clone(),
        },
        StatusRow {
            metric: "Handlers".to_string(),
            value: status
                .handlers
                .iter()
                .map(|(name, kind)| format!("{name}={kind}"))
                .collect::<Vec<_>>()
                .join(", "),
        },
        StatusRow {
            metric: "Cache entries".to_string(),
            value: status.cache.size.to_string(),
        },
        StatusRow {
            metric: "Queue concurrency".to_string(),
            value: status.queue.max_concurrency.to_string(),
        },
        StatusRow {
            metric: "Chunk size".to_string(),
            value: context.config().engine.chunk_size.to_string(),
        },
        StatusRow {
            metric: "Game version".to_string(),
            value: context.config().engine.game_version.clone(),
        },
        StatusRow {
            metric: "Import strategies".to_string(),
            value: context
                .importer()
                .history()
                .supported_resolutions
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        },
    ];
    println!("{}", Table::new(rows));
    Ok(())
}

fn parse_selection(raw: &str) -> Result<(String, Selection), anyhow::Error> {
    let (data_type, choice) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("selection must look like type=keep|import, got '{raw}'"))?;
    Ok((data_type.to_string(), Selection::from_str(choice)?))
}

fn read_json_arg(raw: &str) -> Result<Value, anyhow::Error> {
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&text).context("data is not valid JSON")
}

fn render(value: Option<&Value>) -> String {
    let text = value.map(Value::to_string).unwrap_or_else(|| "-".to_string());
    if text.chars().count() > 40 {
        format!("{}…", text.chars().take(39).collect::<String>())
    } else {
        text
    }
}

fn format_size(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}
