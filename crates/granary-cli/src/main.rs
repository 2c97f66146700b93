use std::io::Read;
use std::path::PathBuf;

use atty::Stream;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use granary_core::{commands, CommandStatus, ExecutionOutcome, Settings};
use granary_domain::ContentStatus;
use serde_json::Value;

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = GranaryCli::parse();
    init_tracing(cli.trace, cli.verbose);

    let settings = Settings::from_env().map_err(|err| eyre!("{err:?}"))?;
    let outcome = run_command(&settings, &cli.command)?;
    let code = emit_output(&cli, &outcome)?;

    if code == 0 {
        Ok(())
    } else {
        std::process::exit(code);
    }
}

fn init_tracing(trace: bool, verbose: u8) {
    let level = if trace {
        "trace"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = format!("granary={level},granary_core={level},granary_cli={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn run_command(settings: &Settings, command: &GranaryCommand) -> Result<ExecutionOutcome> {
    let outcome = match command {
        GranaryCommand::Ingest(args) => {
            let inputs = read_inputs(&args.files)?;
            commands::ingest(settings, &args.source, inputs)
        }
        GranaryCommand::Get(args) => commands::record(settings, &args.hash),
        GranaryCommand::Mark(args) => commands::mark(settings, &args.hash, args.status.into()),
        GranaryCommand::Stats => commands::stats(settings),
        GranaryCommand::Sync(args) => {
            if args.daemon {
                commands::sync_daemon(settings)
            } else {
                commands::sync_once(settings)
            }
        }
        GranaryCommand::Maintain => commands::maintain(settings),
        GranaryCommand::Dump(args) => commands::dump(settings, &args.by),
        GranaryCommand::Doctor => commands::doctor(settings),
    };
    Ok(outcome)
}

fn read_inputs(files: &[PathBuf]) -> Result<Vec<commands::IngestInput>> {
    let mut inputs = Vec::new();
    for file in files {
        if file.as_os_str() == "-" {
            let mut bytes = Vec::new();
            std::io::stdin()
                .read_to_end(&mut bytes)
                .map_err(|err| eyre!("failed to read stdin: {err}"))?;
            inputs.push(commands::IngestInput {
                label: "<stdin>".to_string(),
                bytes,
            });
        } else {
            let bytes = std::fs::read(file)
                .map_err(|err| eyre!("failed to read {}: {err}", file.display()))?;
            inputs.push(commands::IngestInput {
                label: file.display().to_string(),
                bytes,
            });
        }
    }
    Ok(inputs)
}

fn emit_output(cli: &GranaryCli, outcome: &ExecutionOutcome) -> Result<i32> {
    let code = outcome.exit_code();

    if cli.json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
    } else if !cli.quiet {
        let prefix = match outcome.status {
            CommandStatus::Ok => "ok",
            CommandStatus::UserError => "error",
            CommandStatus::Failure => "failed",
        };
        let line = format!("{prefix}: {}", outcome.message);
        if use_color(cli) {
            let color = match outcome.status {
                CommandStatus::Ok => "\x1b[32m",
                CommandStatus::UserError => "\x1b[33m",
                CommandStatus::Failure => "\x1b[31m",
            };
            println!("{color}{line}\x1b[0m");
        } else {
            println!("{line}");
        }
        if let Some(hint) = hint_from_details(&outcome.details) {
            println!("Hint: {hint}");
        }
    }

    Ok(code)
}

fn use_color(cli: &GranaryCli) -> bool {
    !cli.no_color && atty::is(Stream::Stdout)
}

fn hint_from_details(details: &Value) -> Option<&str> {
    details
        .as_object()
        .and_then(|map| map.get("hint"))
        .and_then(Value::as_str)
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Deduplicating content store with a guarded git mirror",
    long_about = "granary ingests content from concurrent producers, deduplicates it by \
                  sha-256, and periodically folds the store into a version-controlled \
                  distribution mirror without ever losing committed data.",
    after_help = "Examples:\n  granary ingest page.html --source crawler-7\n  granary --json stats\n  granary sync\n"
)]
struct GranaryCli {
    #[arg(
        short,
        long,
        help = "Suppress human output (errors still print to stderr)"
    )]
    quiet: bool,
    #[arg(short, long, action = ArgAction::Count, help = "Increase logging (-vv reaches trace)")]
    verbose: u8,
    #[arg(long, help = "Force trace logging regardless of -v/-q")]
    trace: bool,
    #[arg(long, help = "Emit {status,message,details} JSON envelopes")]
    json: bool,
    #[arg(long, help = "Disable colored human output")]
    no_color: bool,
    #[command(subcommand)]
    command: GranaryCommand,
}

#[derive(Subcommand, Debug)]
enum GranaryCommand {
    #[command(
        about = "Store content blobs, deduplicated by hash.",
        override_usage = "granary ingest <FILE>... [--source ID]",
        after_help = "Examples:\n  granary ingest page.html\n  cat page.html | granary ingest - --source crawler-7\n"
    )]
    Ingest(IngestArgs),
    #[command(about = "Show the record for a content hash.")]
    Get(HashArgs),
    #[command(
        about = "Advance a record's processing status.",
        override_usage = "granary mark <HASH> <processing|completed|failed>"
    )]
    Mark(MarkArgs),
    #[command(about = "Point-in-time consistent record counts.")]
    Stats,
    #[command(
        about = "Run one protected sync cycle (or the daemon loop).",
        after_help = "Examples:\n  granary sync\n  granary sync --daemon\n"
    )]
    Sync(SyncArgs),
    #[command(about = "Run mirror size management out of band.")]
    Maintain,
    #[command(
        about = "Ratchet-gated bulk export of all records.",
        after_help = "Example:\n  granary dump --by nightly-exporter\n"
    )]
    Dump(DumpArgs),
    #[command(about = "Verify the store and reconcile the index with the blobs.")]
    Doctor,
}

#[derive(Args, Debug)]
struct IngestArgs {
    #[arg(value_name = "FILE", required = true, help = "Files to ingest ('-' reads stdin)")]
    files: Vec<PathBuf>,
    #[arg(long, default_value = "cli", help = "Producer identifier recorded on new records")]
    source: String,
}

#[derive(Args, Debug)]
struct HashArgs {
    #[arg(value_name = "HASH")]
    hash: String,
}

#[derive(Args, Debug)]
struct MarkArgs {
    #[arg(value_name = "HASH")]
    hash: String,
    #[arg(value_enum, value_name = "STATUS")]
    status: MarkStatus,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum MarkStatus {
    Processing,
    Completed,
    Failed,
}

impl From<MarkStatus> for ContentStatus {
    fn from(status: MarkStatus) -> Self {
        match status {
            MarkStatus::Processing => ContentStatus::Processing,
            MarkStatus::Completed => ContentStatus::Completed,
            MarkStatus::Failed => ContentStatus::Failed,
        }
    }
}

#[derive(Args, Debug)]
struct SyncArgs {
    #[arg(long, help = "Keep running cycles at the configured interval")]
    daemon: bool,
}

#[derive(Args, Debug)]
struct DumpArgs {
    #[arg(long, default_value = "cli", help = "Caller identity recorded in the ratchet audit")]
    by: String,
}
