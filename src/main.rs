use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use ram_extractor::cli::{expand_targets, Args, Command};
use ram_extractor::{ActionEvent, ActionReport, Orchestrator, Prerequisite};

fn main() {
    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Returns whether every action succeeded
fn run() -> Result<bool> {
    // Parse command line arguments
    let args = Args::parse();
    init_tracing(args.verbose);

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Invalid arguments: {}", e);
        std::process::exit(1);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;
    runtime.block_on(dispatch(args))
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ram_extractor={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn dispatch(args: Args) -> Result<bool> {
    let config = args.to_config();

    if let Command::Check = args.command {
        let report = Orchestrator::new(config).check();
        return print_prerequisites(&report, args.json);
    }

    // Console narration goes to stdout unless stdout is reserved for JSON
    let (tx, rx) = mpsc::channel(config.event_buffer);
    let printer = tokio::spawn(print_events(rx, args.json));
    let orchestrator = Orchestrator::new(config).with_events(tx);

    let registry = orchestrator.registry().clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let cancelled = registry.cancel_all();
            warn!(cancelled, "interrupted, cancelling running tools");
        }
    });

    let reports = match &args.command {
        Command::Find { tools } => orchestrator.run_finders(&expand_targets(tools)).await,
        Command::Extract { algorithm, capture } => {
            vec![
                orchestrator
                    .extract_existing((*algorithm).into(), capture.clone())
                    .await,
            ]
        }
        Command::Zeroize { name, hash, .. } => {
            vec![
                orchestrator
                    .run_zeroize(args.zeroize_selection(), name, *hash)
                    .await,
            ]
        }
        Command::Check => Vec::new(),
    };

    // Closing the last sender lets the printer drain and stop
    drop(orchestrator);
    interrupt.abort();
    printer.await.context("output printer task failed")?;

    print_reports(&reports, args.json)?;
    Ok(reports.iter().all(ActionReport::is_success))
}

async fn print_events(mut rx: mpsc::Receiver<ActionEvent>, json: bool) {
    while let Some(event) = rx.recv().await {
        let text = match event {
            ActionEvent::State { tool, state } => {
                debug!(%tool, ?state, "state");
                continue;
            }
            ActionEvent::Message { text, .. } => text,
            ActionEvent::Output { line, .. } => line,
        };
        if json {
            eprintln!("{text}");
        } else {
            println!("{text}");
        }
    }
}

fn print_reports(reports: &[ActionReport], json: bool) -> Result<()> {
    if json {
        let rendered = serde_json::to_string_pretty(reports).context("failed to serialize reports")?;
        println!("{rendered}");
        return Ok(());
    }

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout)?;
    writeln!(stdout, "{}", "=".repeat(60))?;
    for report in reports {
        let status = if report.is_success() { "OK" } else { "FAILED" };
        write!(stdout, "{:<16} {:<7} {} records", report.tool.to_string(), status, report.records.len())?;
        if let Some(path) = report.record_path.as_ref().or(report.destination.as_ref()) {
            write!(stdout, "  {}", path.display())?;
        }
        writeln!(stdout)?;
        if let Some(failure) = &report.failure {
            writeln!(stdout, "  {}", failure.message)?;
        }
        if let Some(digests) = &report.digests {
            writeln!(stdout, "  source sha256:      {}", digests.source_sha256)?;
            writeln!(stdout, "  destination sha256: {}", digests.destination_sha256)?;
        }
    }
    Ok(())
}

fn print_prerequisites(report: &[Prerequisite], json: bool) -> Result<bool> {
    if json {
        let rendered = serde_json::to_string_pretty(report).context("failed to serialize prerequisites")?;
        println!("{rendered}");
    } else {
        println!("Prerequisites:");
        for prerequisite in report {
            let location = prerequisite
                .location
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "not on PATH".to_string());
            let mark = if prerequisite.present { "found  " } else { "missing" };
            println!("  {:<14} {} {}", prerequisite.name, mark, location);
        }
    }
    Ok(report.iter().all(|p| p.present))
}
