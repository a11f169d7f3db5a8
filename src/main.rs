use anyhow::{Context, Result};
use clap::Parser;
use onwatch_populate::api::http::UreqTransport;
use onwatch_populate::cli::{Command, LoggingArgs, RootArgs, RunArgs, SetIpArgs, VerifyArgs};
use onwatch_populate::config::{self, set_ip, validate, Severity};
use onwatch_populate::ledger::ExportSnapshot;
use onwatch_populate::stages::{self, default_export_path, LiveConnector, RunOptions, Stage};
use onwatch_populate::verify::verify_export;
use std::fs::File;
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

fn init_logging(args: &LoggingArgs) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.level()));
    let file_layer = match &args.log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("create log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();
    Ok(())
}

fn main() -> Result<()> {
    let args = RootArgs::parse();
    init_logging(&args.logging)?;

    let code = match args.command {
        Command::Run(run) => run_command(&run)?,
        Command::Steps => {
            for stage in Stage::ALL {
                println!(
                    "{:>2}. {:<20} {}",
                    stage.number(),
                    stage.slug(),
                    stage.description()
                );
            }
            0
        }
        Command::Verify(verify) => verify_command(&verify)?,
        Command::SetIp(set_ip) => set_ip_command(&set_ip)?,
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn run_command(args: &RunArgs) -> Result<i32> {
    let loaded = config::load(&args.config)?;
    let issues = validate(&loaded);
    for issue in &issues {
        match issue.severity {
            Severity::Error => tracing::error!(path = %issue.path, "{}", issue.message),
            Severity::Warning => tracing::warn!(path = %issue.path, "{}", issue.message),
        }
    }
    if config::validate::has_errors(&issues) {
        tracing::error!(config = %args.config.display(), "configuration is invalid");
        return Ok(1);
    }
    if args.validate {
        tracing::info!(config = %args.config.display(), warnings = issues.len(), "configuration is valid");
        return Ok(0);
    }

    let mut options = RunOptions::new(args.export.clone().unwrap_or_else(default_export_path));
    options.only = args.step;
    let connector = LiveConnector::new(&loaded);
    let ledger = stages::run(&loaded, &connector, &options);
    ledger.log_summary();
    tracing::info!(export = %options.export_path.display(), "run export");
    Ok(if ledger.has_failed_steps() { 1 } else { 0 })
}

fn verify_command(args: &VerifyArgs) -> Result<i32> {
    let loaded = config::load(&args.config)?;
    let snapshot = ExportSnapshot::load(&args.export)?;
    let transport = UreqTransport::new(&loaded.config.onwatch.api_base_url());
    let report = verify_export(&loaded, &transport, &snapshot)?;
    report.log_summary();
    Ok(if report.failed() > 0 { 1 } else { 0 })
}

fn set_ip_command(args: &SetIpArgs) -> Result<i32> {
    let report = set_ip::update_ip_address(&args.config, &args.ip, !args.no_backup)?;
    println!(
        "Updated {} connection address(es) in {}",
        report.replacements,
        args.config.display()
    );
    if let Some(backup) = &report.backup {
        println!("Backup: {}", backup.display());
    }
    Ok(0)
}
