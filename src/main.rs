//! Opens (or creates) an item store, optionally runs housekeeping, and dumps
//! its live items to stdout.
//!
//! Usage: `itemstore [config.toml] [--housekeep]`
//!
//! Settings not found in the file are taken from `ITEMSTORE_*` environment
//! variables or the built-in defaults.
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use tracing::{error, info};

use itemstore::{init_logging, Database, DatabaseConfig, Result};

fn run(config_file: Option<PathBuf>, housekeep: bool) -> Result<()> {
    let config = DatabaseConfig::load(config_file.as_deref())?;
    info!(
        mode = ?config.persistence_mode(),
        readers = config.reader_threads,
        "opening database"
    );
    let database = Database::new(config);
    let started = Instant::now();
    database.start()?;
    info!(ms = started.elapsed().as_millis() as u64, icn = database.icn(), "database started");
    if housekeep {
        let purged = database.housekeep().wait()?;
        info!(purged, "housekeeping done");
    }
    let stdout = std::io::stdout();
    database.dump(&mut stdout.lock())?;
    database.stop();
    Ok(())
}

fn main() -> ExitCode {
    init_logging();
    let mut config_file = None;
    let mut housekeep = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--housekeep" => housekeep = true,
            flag if flag.starts_with("--") => {
                error!(flag, "unknown option");
                return ExitCode::from(2);
            }
            path => config_file = Some(PathBuf::from(path)),
        }
    }
    match run(config_file, housekeep) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "itemstore failed");
            ExitCode::FAILURE
        }
    }
}
