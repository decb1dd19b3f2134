//! `cod-custody`: serve ledger commands as JSON lines over stdin/stdout.
//!
//! Usage: `cod-custody [--config <file>]`

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::info;

use cod_custody::{commands, logging, CodLedger, LedgerConfig};

fn config_path() -> Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    let mut path = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let value = args.next().context("--config needs a file path")?;
                path = Some(PathBuf::from(value));
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(path.or_else(|| std::env::var("COD_CONFIG").ok().map(PathBuf::from)))
}

fn main() -> Result<()> {
    let path = config_path()?;
    let config = LedgerConfig::load(path.as_deref()).context("loading configuration")?;

    let _guard = logging::init_logging(&config.log_dir, &config.log_filter, config.max_log_files);
    info!("Starting cod-custody v{}", env!("CARGO_PKG_VERSION"));

    let ledger = CodLedger::from_config(&config).with_context(|| {
        format!("opening ledger at {}", config.database_path.display())
    })?;

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for line in stdin.lock().lines() {
        let line = line.context("reading command")?;
        if line.trim().is_empty() {
            continue;
        }
        let response = commands::handle_line(&ledger, &line);
        serde_json::to_writer(&mut out, &response).context("writing response")?;
        out.write_all(b"\n")?;
        out.flush()?;
    }

    info!("Input closed, shutting down");
    Ok(())
}
