use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Subcommand};
use quill_core::config::{EffectiveConfig, PROJECT_DIR, ProjectConfig, resolve_config};
use quill_core::error::ErrorCode;
use serde::Serialize;
use toml::Value;

use crate::output::{CliError, OutputMode, fail, pretty_kv, pretty_section};

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Show the resolved configuration
    Show,
    /// Set a project configuration key (e.g. logging.log_level minimal)
    Set(SetArgs),
}

#[derive(Args, Debug)]
struct SetArgs {
    /// Dot path key (e.g. logging.batch_interval)
    key: String,

    /// New value; booleans and numbers are detected, anything else is a string
    value: String,
}

pub fn run_config(args: &ConfigArgs, output: OutputMode, project_root: &Path) -> Result<()> {
    match &args.command {
        ConfigCommand::Show => {
            let effective = resolve_config(project_root, output.is_json()).map_err(|err| {
                fail(output, &CliError::coded(ErrorCode::ConfigParseError, format!("{err:#}")))
            })?;
            print_effective(&effective, output)
        }
        ConfigCommand::Set(set) => run_set(set, output, project_root),
    }
}

fn print_effective(effective: &EffectiveConfig, output: OutputMode) -> Result<()> {
    let stdout = std::io::stdout();
    let mut w = stdout.lock();
    match output {
        OutputMode::Json => {
            serde_json::to_writer_pretty(&mut w, effective)?;
            writeln!(w)?;
        }
        OutputMode::Text => {
            writeln!(w, "output={}", effective.resolved_output)?;
            writeln!(w, "store={}", effective.store_path.display())?;
            write!(w, "{}", toml::to_string(&effective.project)?)?;
        }
        OutputMode::Pretty => {
            pretty_section(&mut w, "Effective configuration")?;
            pretty_kv(&mut w, "Output", &effective.resolved_output)?;
            pretty_kv(&mut w, "Store", effective.store_path.display().to_string())?;
            writeln!(w)?;
            write!(w, "{}", toml::to_string_pretty(&effective.project)?)?;
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct SetOutput<'a> {
    key: &'a str,
    value: Value,
    path: String,
}

fn run_set(args: &SetArgs, output: OutputMode, project_root: &Path) -> Result<()> {
    let path = project_config_path(project_root);
    let mut root = load_toml_table(&path)?;
    let parsed = parse_value(&args.value);
    apply_set(&mut root, &args.key, parsed.clone())?;

    // Reject the edit before touching disk if it produces invalid settings.
    let candidate: ProjectConfig = root
        .clone()
        .try_into()
        .with_context(|| format!("`{}` has the wrong type for {}", args.value, args.key))?;
    if let Err(err) = candidate.validate() {
        return Err(fail(
            output,
            &CliError::coded(ErrorCode::InvalidLoggingSettings, err.to_string()),
        ));
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(&path, toml::to_string_pretty(&root)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    let out = SetOutput {
        key: &args.key,
        value: parsed,
        path: path.display().to_string(),
    };
    if output.is_json() {
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("✓ set {} = {}", out.key, out.value);
    }
    Ok(())
}

fn project_config_path(project_root: &Path) -> PathBuf {
    project_root.join(PROJECT_DIR).join("config.toml")
}

fn load_toml_table(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Ok(Value::Table(toml::map::Map::new()));
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

fn parse_value(raw: &str) -> Value {
    if let Ok(b) = raw.parse::<bool>() {
        Value::Boolean(b)
    } else if let Ok(i) = raw.parse::<i64>() {
        Value::Integer(i)
    } else if let Ok(f) = raw.parse::<f64>() {
        Value::Float(f)
    } else {
        Value::String(raw.to_string())
    }
}

fn apply_set(root: &mut Value, key: &str, value: Value) -> Result<()> {
    let (section, leaf) = key
        .split_once('.')
        .ok_or_else(|| anyhow!("Key must use section.key format"))?;
    if !matches!(section, "recorder" | "logging" | "uploader" | "metrics" | "server") {
        bail!("Unknown config section `{section}`");
    }

    let table = root
        .as_table_mut()
        .ok_or_else(|| anyhow!("Config root must be a TOML table"))?;
    let section_table = table
        .entry(section.to_string())
        .or_insert_with(|| Value::Table(toml::map::Map::new()))
        .as_table_mut()
        .ok_or_else(|| anyhow!("Section {section} must be a TOML table"))?;
    section_table.insert(leaf.to_string(), value);
    Ok(())
}
