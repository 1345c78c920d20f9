use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{Level as TraceLevel, debug, info, warn};
use tracing_subscriber::FmtSubscriber;

use prefstore::config::{BackendKind, StorageConfig};
use prefstore::constants::config::ENV_LOG_LEVEL;
use prefstore::{ConfigStore, Value, ValueType};

#[derive(Parser)]
#[command(name = "prefstore")]
#[command(about = "Inspect and edit stored preferences")]
#[command(version)]
struct Cli {
    /// Storage format (overrides PREFSTORE_BACKEND)
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,

    /// XML preferences file (overrides PREFSTORE_FILE)
    #[arg(long)]
    file: Option<PathBuf>,

    /// Flat namespace root directory (overrides PREFSTORE_ROOT)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Node path, e.g. com/example/app (overrides PREFSTORE_PATH)
    #[arg(long)]
    path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every entry under the path
    List {
        /// Emit JSON instead of one line per entry
        #[arg(long)]
        json: bool,
    },

    /// Print the stored value of a key
    Get { key: String },

    /// Set a key and persist it
    #[command(after_help = "\
Type codes:
  s  string (default)     b  boolean
  i  integer              r  rectangle \"x,y,w,h\"
  p  point \"x,y\"          a  JSON array of strings
  o:<class>  object text form

Examples:
  prefstore set window.title 'Main'
  prefstore set window.frame 10,20,640,480 --type r
  prefstore set window.visible true --type b --no-reset")]
    Set {
        key: String,
        value: String,

        /// Type code of the value
        #[arg(long = "type", short = 't', default_value = "s")]
        value_type: String,

        /// Keep the entry when settings are reset to defaults (an existing
        /// flag is kept either way)
        #[arg(long)]
        no_reset: bool,

        /// Replace an existing entry even if its type differs
        #[arg(long)]
        force: bool,
    },

    /// Delete a key and persist the removal
    Remove { key: String },

    /// Delete every key under the path
    Clear,
}

#[derive(Serialize)]
struct EntryRow<'a> {
    key: &'a str,
    meta: String,
    value: &'a str,
}

fn init_logging() -> Result<()> {
    let log_level = match std::env::var(ENV_LOG_LEVEL)
        .unwrap_or_else(|_| "info".to_string())
        .to_lowercase()
        .as_str()
    {
        "trace" => TraceLevel::TRACE,
        "debug" => TraceLevel::DEBUG,
        "warn" => TraceLevel::WARN,
        "error" => TraceLevel::ERROR,
        _ => TraceLevel::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Surface anything the store swallowed during the last operation
fn check_absorbed(store: &mut ConfigStore, operation: &str) -> Result<()> {
    let mut errors = store.take_absorbed_errors().into_iter();
    match errors.next() {
        None => Ok(()),
        Some(first) => {
            for err in errors {
                warn!(operation, error = %err, "Additional failure");
            }
            Err(anyhow!(first)).with_context(|| format!("{operation} failed"))
        }
    }
}

/// Decode `text` as `type_code` and put it under `key`. The NO_RESET flag is
/// only ever added here; an existing flag is left as it is.
fn apply_set(
    store: &mut ConfigStore,
    key: &str,
    text: &str,
    type_code: &str,
    no_reset: bool,
    force: bool,
) -> Result<()> {
    let value_type = ValueType::from_code(type_code)
        .with_context(|| format!("invalid type code '{type_code}'"))?;
    let Some(value) = Value::decode(&value_type, text) else {
        bail!("'{text}' is not a valid {value_type} value");
    };

    if force {
        store.put_with_type_change(key, value);
    } else {
        store.try_put(key, value)?;
    }
    if no_reset {
        store.set_no_reset(key, true);
    }
    Ok(())
}

fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    let config = StorageConfig::from_env()?.with_overrides(cli.backend, cli.file, cli.root, cli.path);
    let path = config.path.clone();
    debug!(config = ?config, "Starting");

    let mut store = ConfigStore::new().with_backend(config.open_backend());
    store.load_preferences(&path);
    check_absorbed(&mut store, "load")?;

    match cli.command {
        Commands::List { json } => {
            let rows: Vec<EntryRow> = store
                .items()
                .map(|item| EntryRow {
                    key: item.key(),
                    meta: item.encode_meta(),
                    value: item.encoded(),
                })
                .collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for row in rows {
                    println!("{} {} = {}", row.meta, row.key, row.value);
                }
            }
        }
        Commands::Get { key } => {
            let item = store
                .item(&key)
                .with_context(|| format!("no entry for '{key}' under '{path}'"))?;
            println!("{}", item.encoded());
        }
        Commands::Set {
            key,
            value,
            value_type,
            no_reset,
            force,
        } => {
            apply_set(&mut store, &key, &value, &value_type, no_reset, force)?;
            store.store_preferences(&path);
            check_absorbed(&mut store, "store")?;
            info!(key = %key, path = %path, "Stored entry");
        }
        Commands::Remove { key } => {
            if store.remove(&key).is_none() {
                warn!(key = %key, path = %path, "Key not present, removing from storage anyway");
            }
            store.store_preferences(&path);
            check_absorbed(&mut store, "remove")?;
            info!(key = %key, path = %path, "Removed entry");
        }
        Commands::Clear => {
            let count = store.len();
            store.clear_all_settings(true);
            store.store_preferences(&path);
            check_absorbed(&mut store, "clear")?;
            info!(path = %path, count, "Cleared entries");
        }
    }

    Ok(())
}
