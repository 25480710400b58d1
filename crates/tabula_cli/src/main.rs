//! Inspection entry point.
//!
//! # Responsibility
//! - Open a database through `tabula_core` (migrations included).
//! - Print the core version and the table layout, one table per line.
//!
//! Usage: `tabula [db_path]`. Without a path, `TABULA_DB_PATH` decides and
//! an unset variable opens an empty in-memory database.

use log::error;
use std::process::ExitCode;
use tabula_core::{Context, DatabaseLocation, Storage, StorageConfig, StorageResult};

fn main() -> ExitCode {
    if let Err(err) = tabula_core::init_logging_from_env() {
        eprintln!("tabula: logging disabled: {err}");
    }

    match run(std::env::args().nth(1)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(
                "event=cli_run module=cli status=error error_code={} error={}",
                err.code(),
                err
            );
            eprintln!("tabula: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(db_path: Option<String>) -> StorageResult<()> {
    let config = with_path(StorageConfig::from_env()?, db_path);
    let storage = Storage::open(&config)?;

    println!("tabula_core version={}", tabula_core::core_version());
    let metadata = storage.metadata(&Context::background())?;
    for (table, columns) in metadata.list_tables_and_columns()? {
        println!("{table}: {}", columns.join(", "));
    }
    Ok(())
}

/// A path argument overrides only the location; tuning still comes from env.
fn with_path(mut config: StorageConfig, db_path: Option<String>) -> StorageConfig {
    if let Some(path) = db_path {
        config.location = DatabaseLocation::File(path.into());
    }
    config
}
