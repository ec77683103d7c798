use std::path::Path;

use anyhow::Result;
use clap::Args;

use super::{load_config, open_store};
use crate::output::OutputMode;
use crate::server::{ServeConfig, ServerState, serve};

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Bind address. Defaults to `server.host`.
    #[arg(long)]
    pub host: Option<String>,

    /// Listen port. Defaults to `server.port`.
    #[arg(long, short)]
    pub port: Option<u16>,

    /// Page size for `GET /events/{id}` without `limit`.
    #[arg(long)]
    pub events_limit: Option<usize>,
}

/// Execute `quill serve`: the ingestion and replay API.
///
/// # Errors
///
/// Returns an error if the project is not initialized or the address
/// cannot be bound.
pub fn run_serve(args: &ServeArgs, output: OutputMode, project_root: &Path) -> Result<()> {
    let config = load_config(project_root, output)?;
    let store = open_store(project_root, output)?;

    let mut serve_config = ServeConfig::from(&config.server);
    if let Some(host) = &args.host {
        serve_config.host.clone_from(host);
    }
    if let Some(port) = args.port {
        serve_config.port = port;
    }
    if let Some(limit) = args.events_limit {
        serve_config.events_limit = limit.max(1);
    }

    let state = ServerState::new(store, &config, serve_config.events_limit);
    serve(&serve_config, state)
}
