pub mod attempt;
pub mod completions;
pub mod config;
pub mod events;
pub mod ingest;
pub mod init;
pub mod metrics;
pub mod record;
pub mod replay;
pub mod serve;
pub mod sim;
pub mod verify;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use quill_core::FileMap;
use quill_core::config::{self as core_config, PROJECT_DIR, ProjectConfig};
use quill_core::error::ErrorCode;
use quill_core::store::{EventStore, StoreError};

use crate::output::{CliError, OutputMode, fail};

/// Load `.quill/config.toml`, rendering a coded error when it is invalid.
pub fn load_config(project_root: &Path, output: OutputMode) -> Result<ProjectConfig> {
    core_config::load_project_config(project_root).map_err(|err| {
        let code = if err.chain().any(|cause| cause.is::<core_config::SettingsError>()) {
            ErrorCode::InvalidLoggingSettings
        } else {
            ErrorCode::ConfigParseError
        };
        fail(output, &CliError::coded(code, format!("{err:#}")))
    })
}

/// Open the project's event store.
///
/// Fails with `E1001` when the project has no `.quill` directory and no
/// `QUILL_DB` override points elsewhere.
pub fn open_store(project_root: &Path, output: OutputMode) -> Result<EventStore> {
    let path = core_config::store_path(project_root);
    let overridden = std::env::var_os("QUILL_DB").is_some();
    if !overridden && !project_root.join(PROJECT_DIR).is_dir() {
        return Err(fail(
            output,
            &CliError::coded(
                ErrorCode::NotInitialized,
                format!("no {PROJECT_DIR} directory in {}", project_root.display()),
            ),
        ));
    }
    EventStore::open(&path).map_err(|err| store_failure(output, &err))
}

/// Render a store error with its code.
pub fn store_failure(output: OutputMode, err: &StoreError) -> anyhow::Error {
    fail(output, &CliError::coded(err.code(), err.to_string()))
}

/// Build a file map from a JSON object file and `NAME=PATH` pairs.
///
/// Pairs are applied after the JSON file, so they win on conflicts.
pub fn read_file_map(json: Option<&Path>, pairs: &[String]) -> Result<FileMap> {
    let mut files = match json {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str::<FileMap>(&raw)
                .with_context(|| format!("{} is not a JSON object of strings", path.display()))?
        }
        None => FileMap::new(),
    };
    for pair in pairs {
        let (name, path) = pair
            .split_once('=')
            .with_context(|| format!("expected NAME=PATH, got '{pair}'"))?;
        let content = std::fs::read_to_string(PathBuf::from(path))
            .with_context(|| format!("Failed to read {path}"))?;
        files.insert(name.to_string(), content);
    }
    Ok(files)
}

/// Read a whole input file, or stdin for `-`.
pub fn read_input(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        std::io::read_to_string(std::io::stdin()).context("Failed to read stdin")
    } else {
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
    }
}

pub fn local_time(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// `1m 05s`-style duration for human output.
pub fn human_secs(secs: f64) -> String {
    if !secs.is_finite() || secs < 60.0 {
        return format!("{secs:.1}s");
    }
    let whole = secs.floor();
    let minutes = (whole / 60.0).floor();
    let rest = whole - minutes * 60.0;
    if minutes < 60.0 {
        format!("{minutes:.0}m {rest:02.0}s")
    } else {
        let hours = (minutes / 60.0).floor();
        format!("{hours:.0}h {:02.0}m", minutes - hours * 60.0)
    }
}
