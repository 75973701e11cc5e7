//! `quay-api` binary entrypoint.
//!
//! Loads configuration from environment variables, opens both stores and
//! starts the HTTP server.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use anyhow::{Context as _, Result};

use quay_api::config::Config;
use quay_api::server::{Server, Stores};
use quay_core::observability::{init_logging, LogFormat};

fn choose_log_format(config: &Config) -> LogFormat {
    if config.debug {
        LogFormat::Pretty
    } else {
        LogFormat::Json
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_logging(choose_log_format(&config));

    if config.uses_memory_stores() {
        if !config.debug {
            anyhow::bail!(
                "QUAY_DATABASE_PATH and QUAY_DOCUMENT_DB_PATH are required when QUAY_DEBUG=false"
            );
        }
        tracing::warn!("database paths not set; using in-memory stores (debug only)");
    }

    let stores = Stores::open(&config.storage, &config.sync).context("open stores")?;
    let server = Server::with_stores(config, stores);
    server.serve().await?;
    Ok(())
}
