use std::path::Path;

use anyhow::{Context as _, Result};
use clap::Args;
use quill_core::config::{PROJECT_DIR, STORE_FILE, store_path};
use quill_core::store::EventStore;
use serde::Serialize;

use crate::output::OutputMode;

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite the config template even if `.quill/` already exists.
    #[arg(long)]
    pub force: bool,
}

const CONFIG_TOML: &str = "[recorder]\n\
    ring_capacity = 1000\n\
    debounce_ms = 1000\n\
    default_file = \"main.py\"\n\
    \n\
    [logging]\n\
    log_level = \"standard\"\n\
    track_keystrokes = true\n\
    track_cursor_moves = true\n\
    track_paste_events = true\n\
    track_ai_interactions = true\n\
    track_run_events = true\n\
    cursor_tracking_interval = 5000\n\
    batch_interval = 5\n\
    \n\
    [uploader]\n\
    max_batch_size = 500\n\
    degraded_after_failures = 3\n\
    queue_warning_threshold = 5000\n\
    \n\
    [metrics]\n\
    idle_threshold_secs = 30.0\n\
    large_paste_threshold = 100\n\
    \n\
    [server]\n\
    host = \"127.0.0.1\"\n\
    port = 8787\n\
    events_limit = 10000\n";

const GITIGNORE: &str = "ledger.sqlite3\nledger.sqlite3-wal\nledger.sqlite3-shm\n";

#[derive(Debug, Serialize)]
struct InitOutput {
    project_dir: String,
    config: String,
    store: String,
}

/// Execute `quill init`. Creates:
///
/// ```text
/// .quill/
///   config.toml      (default project config)
///   .gitignore       (the ledger and its WAL files)
///   ledger.sqlite3   (migrated event store)
/// ```
///
/// # Errors
///
/// Returns an error if `.quill/` already exists and `--force` is not set,
/// or if any filesystem or store operation fails.
pub fn run_init(args: &InitArgs, output: OutputMode, project_root: &Path) -> Result<()> {
    let quill_dir = project_root.join(PROJECT_DIR);

    if quill_dir.exists() && !args.force {
        anyhow::bail!("{PROJECT_DIR}/ already exists. Use `quill init --force` to reinitialize.");
    }

    std::fs::create_dir_all(&quill_dir)
        .with_context(|| format!("Failed to create {}", quill_dir.display()))?;

    let config_path = quill_dir.join("config.toml");
    std::fs::write(&config_path, CONFIG_TOML)
        .with_context(|| format!("Failed to write config: {}", config_path.display()))?;

    let gitignore_path = quill_dir.join(".gitignore");
    std::fs::write(&gitignore_path, GITIGNORE)
        .with_context(|| format!("Failed to write .gitignore: {}", gitignore_path.display()))?;

    let db_path = store_path(project_root);
    EventStore::open(&db_path)
        .with_context(|| format!("Failed to create store: {}", db_path.display()))?;

    if output.is_json() {
        let out = InitOutput {
            project_dir: quill_dir.display().to_string(),
            config: config_path.display().to_string(),
            store: db_path.display().to_string(),
        };
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("✓ Initialized {PROJECT_DIR}/ project structure.");
    println!();
    println!("  Config:  {PROJECT_DIR}/config.toml");
    println!("  Ledger:  {}", db_path.display());
    println!();
    println!("Next steps:");
    println!("  Create an attempt and start the ingestion server:");
    println!("    quill attempt create --assignment hw1 --file main.py=./main.py");
    println!("    quill serve");
    println!();
    println!("  Default store file is {PROJECT_DIR}/{STORE_FILE}; set QUILL_DB to override.");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::config::{ProjectConfig, load_project_config};

    #[test]
    fn template_matches_defaults() {
        let parsed: ProjectConfig = toml::from_str(CONFIG_TOML).expect("template parses");
        let defaults = ProjectConfig::default();
        assert_eq!(parsed.recorder, defaults.recorder);
        assert_eq!(parsed.logging, defaults.logging);
        assert_eq!(parsed.uploader, defaults.uploader);
        assert_eq!(parsed.metrics, defaults.metrics);
        assert_eq!(parsed.server, defaults.server);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn fresh_init_creates_structure() {
        let root = tempfile::tempdir().expect("tempdir");
        run_init(&InitArgs { force: false }, OutputMode::Text, root.path()).expect("init");

        let quill_dir = root.path().join(PROJECT_DIR);
        assert!(quill_dir.join("config.toml").is_file());
        assert!(quill_dir.join(".gitignore").is_file());
        assert!(load_project_config(root.path()).is_ok());
    }

    #[test]
    fn second_init_requires_force() {
        let root = tempfile::tempdir().expect("tempdir");
        run_init(&InitArgs { force: false }, OutputMode::Text, root.path()).expect("init");

        let err = run_init(&InitArgs { force: false }, OutputMode::Text, root.path())
            .expect_err("second init must fail");
        assert!(err.to_string().contains("--force"));
        run_init(&InitArgs { force: true }, OutputMode::Text, root.path()).expect("forced");
    }
}
