#![forbid(unsafe_code)]

mod cmd;
mod output;
mod server;

use std::env;
use std::process;

use clap::{CommandFactory, Parser, Subcommand};
use output::{CliError, OutputMode, Reported};
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "quill: replayable coding-session capture",
    long_about = None
)]
struct Cli {
    /// Enable debug logging for quill.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Output format. Overrides `--json`, `FORMAT` and the user config.
    #[arg(long, global = true, value_enum)]
    format: Option<OutputMode>,

    /// Only log errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn output_mode(&self) -> OutputMode {
        output::resolve_output_mode(self.format, self.json)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Project",
        about = "Initialize a quill project",
        long_about = "Create .quill/ with a default config.toml and an empty event store.",
        after_help = "EXAMPLES:\n    # Initialize in the current directory\n    quill init\n\n    # Rewrite the config with defaults\n    quill init --force"
    )]
    Init(cmd::init::InitArgs),

    #[command(
        next_help_heading = "Project",
        about = "Show or change project configuration",
        long_about = "Show the effective configuration or set one key in .quill/config.toml.\nValues are validated before the file is written.",
        after_help = "EXAMPLES:\n    # Show effective config\n    quill config show\n\n    # Sample cursor moves every 5 seconds\n    quill config set logging.cursor_tracking_interval 5000\n\n    # Serve on another port\n    quill config set server.port 9000"
    )]
    Config(cmd::config::ConfigArgs),

    #[command(
        next_help_heading = "Attempts",
        about = "Create, list, finish and delete attempts",
        long_about = "Manage attempts: one student's session on one assignment.",
        after_help = "EXAMPLES:\n    # Start an attempt with a starter file\n    quill attempt create --assignment hw1 --file main.py=starter/main.py\n\n    # List attempts for an assignment\n    quill attempt list --assignment hw1\n\n    # Finish with the submitted files\n    quill attempt finish 3 --file main.py=submission/main.py"
    )]
    Attempt(cmd::attempt::AttemptArgs),

    #[command(
        next_help_heading = "Attempts",
        about = "Ingest event batches",
        long_about = "Store event batches from a file or stdin. Accepts one batch, an array\nof batches, or JSON Lines. Resends of stored events are duplicates, not errors.",
        after_help = "EXAMPLES:\n    # Ingest a captured batch\n    quill ingest batch.json\n\n    # Pipe JSON Lines\n    cat batches.jsonl | quill ingest -"
    )]
    Ingest(cmd::ingest::IngestArgs),

    #[command(
        next_help_heading = "Attempts",
        about = "Record a scripted editing session",
        long_about = "Drive the client recorder from a JSON Lines step script on a simulated\nclock, uploading into the local store or a running quill server.",
        after_help = "EXAMPLES:\n    # Record into a new attempt\n    quill record session.jsonl --assignment hw1\n\n    # Record against a server and finish\n    quill record session.jsonl --server http://127.0.0.1:8787 --finish"
    )]
    Record(cmd::record::RecordArgs),

    #[command(
        next_help_heading = "Inspect",
        about = "List an attempt's stored events",
        long_about = "List the ledger in sequence order, with a one-line summary per event.",
        after_help = "EXAMPLES:\n    # Whole ledger\n    quill events 3\n\n    # Page through\n    quill events 3 --after 100 --limit 50\n\n    # Tab-separated\n    quill events 3 --format text"
    )]
    Events(cmd::events::EventsArgs),

    #[command(
        next_help_heading = "Inspect",
        about = "Reconstruct files at a point in the session",
        long_about = "Replay the ledger from the starter state to any sequence or meaningful step.",
        after_help = "EXAMPLES:\n    # Final state\n    quill replay 3\n\n    # State after sequence 42\n    quill replay 3 --seq 42\n\n    # List meaningful steps\n    quill replay 3 --steps"
    )]
    Replay(cmd::replay::ReplayArgs),

    #[command(
        next_help_heading = "Inspect",
        about = "Show engagement metrics",
        long_about = "Compute typing time, pastes, AI exchanges and runs from the ledger.",
        after_help = "EXAMPLES:\n    # Human summary\n    quill metrics 3\n\n    # Machine-readable\n    quill metrics 3 --json"
    )]
    Metrics(cmd::metrics::MetricsArgs),

    #[command(
        next_help_heading = "Inspect",
        about = "Check ledger integrity",
        long_about = "Scan for sequence gaps, collisions and quarantined events, and check the\nsaved final state against a full replay. Exits non-zero when anything is off.",
        after_help = "EXAMPLES:\n    # Every attempt\n    quill verify\n\n    # One attempt\n    quill verify 3"
    )]
    Verify(cmd::verify::VerifyArgs),

    #[command(
        next_help_heading = "Service",
        about = "Run the HTTP ingestion and replay API",
        long_about = "Serve POST /events, attempt lifecycle and replay endpoints over the project store.",
        after_help = "EXAMPLES:\n    # Defaults from [server]\n    quill serve\n\n    # All interfaces on 9000\n    quill serve --host 0.0.0.0 --port 9000"
    )]
    Serve(cmd::serve::ServeArgs),

    #[command(
        next_help_heading = "Development",
        about = "Deterministic simulation campaigns",
        long_about = "Run seeded fault-injection campaigns against the real recorder and store."
    )]
    Sim(cmd::sim::SimArgs),

    #[command(
        next_help_heading = "Development",
        about = "Generate shell completions",
        after_help = "EXAMPLES:\n    # Bash\n    quill completions bash > ~/.local/share/bash-completion/completions/quill"
    )]
    Completions(cmd::completions::CompletionsArgs),
}

fn init_tracing(verbose: bool, quiet: bool) {
    let filter = EnvFilter::try_from_env("QUILL_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if quiet {
            "error"
        } else if verbose || env::var("DEBUG").is_ok() {
            "quill=debug,info"
        } else {
            "quill=info,warn"
        })
    });

    let format = env::var("QUILL_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let project_root = env::current_dir()?;
    let output = cli.output_mode();
    debug!(?output, root = %project_root.display(), "starting");

    let command_result = match &cli.command {
        Commands::Init(args) => cmd::init::run_init(args, output, &project_root),
        Commands::Config(args) => cmd::config::run_config(args, output, &project_root),
        Commands::Attempt(args) => cmd::attempt::run_attempt(args, output, &project_root),
        Commands::Ingest(args) => cmd::ingest::run_ingest(args, output, &project_root),
        Commands::Record(args) => cmd::record::run_record(args, output, &project_root),
        Commands::Events(args) => cmd::events::run_events(args, output, &project_root),
        Commands::Replay(args) => cmd::replay::run_replay(args, output, &project_root),
        Commands::Metrics(args) => cmd::metrics::run_metrics(args, output, &project_root),
        Commands::Verify(args) => cmd::verify::run_verify(args, output, &project_root),
        Commands::Serve(args) => cmd::serve::run_serve(args, output, &project_root),
        Commands::Sim(args) => cmd::sim::run_sim(args, output, &project_root),
        Commands::Completions(args) => {
            let mut command = Cli::command();
            cmd::completions::run_completions(args.shell, &mut command)
        }
    };

    if let Err(err) = command_result {
        if !err.is::<Reported>() {
            output::render_error(output, &CliError::new(format!("{err:#}")))?;
        }
        process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn json_flag_parses_before_subcommand() {
        let cli = Cli::parse_from(["quill", "--json", "verify"]);
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Verify(_)));
    }

    #[test]
    fn json_flag_after_subcommand() {
        let cli = Cli::parse_from(["quill", "metrics", "3", "--json"]);
        assert!(cli.json);
        assert!(cli.output_mode().is_json());
    }

    #[test]
    fn format_flag_wins_over_json() {
        let cli = Cli::parse_from(["quill", "events", "1", "--json", "--format", "text"]);
        assert_eq!(cli.output_mode(), OutputMode::Text);
    }

    #[test]
    fn quiet_and_verbose_conflict() {
        assert!(Cli::try_parse_from(["quill", "-q", "-v", "verify"]).is_err());
    }

    #[test]
    fn replay_seq_and_step_conflict() {
        assert!(Cli::try_parse_from(["quill", "replay", "1", "--seq", "2", "--step", "1"]).is_err());
        let cli = Cli::parse_from(["quill", "replay", "1", "--step", "4"]);
        match cli.command {
            Commands::Replay(args) => {
                assert_eq!(args.id, 1);
                assert_eq!(args.step, Some(4));
                assert_eq!(args.seq, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn sim_run_parses_seed_range_and_faults() {
        let cli = Cli::parse_from(["quill", "sim", "run", "--seeds", "10..20", "--drop", "30"]);
        match cli.command {
            Commands::Sim(cmd::sim::SimArgs {
                command: cmd::sim::SimCommand::Run(args),
            }) => {
                assert_eq!(args.seeds, 10..20);
                assert_eq!(args.session.drop, 30);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn serve_overrides_parse() {
        let cli = Cli::parse_from(["quill", "serve", "--port", "9000", "--events-limit", "50"]);
        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.port, Some(9000));
                assert_eq!(args.events_limit, Some(50));
                assert_eq!(args.host, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn record_server_and_attempt() {
        let cli = Cli::parse_from([
            "quill",
            "record",
            "s.jsonl",
            "--attempt",
            "7",
            "--server",
            "http://localhost:8787",
        ]);
        match cli.command {
            Commands::Record(args) => {
                assert_eq!(args.attempt, Some(7));
                assert_eq!(args.server.as_deref(), Some("http://localhost:8787"));
                assert!(!args.finish);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(
            Cli::try_parse_from(["quill", "record", "s.jsonl", "--attempt", "7", "--assignment", "x"])
                .is_err()
        );
    }
}
