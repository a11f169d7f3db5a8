//! CLI argument parsing for the provisioning run and its companion commands.
use crate::config::DEFAULT_CONFIG_PATH;
use crate::stages::Stage;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "onwatch-populate",
    version,
    about = "Provision an OnWatch appliance from a declarative YAML config",
    after_help = "Examples:\n  onwatch-populate run --config config.yaml\n  onwatch-populate run --validate\n  onwatch-populate run --step populate-watchlist\n  onwatch-populate steps\n  onwatch-populate verify onwatch_data_export_2024-05-01_10-00-00.yaml\n  onwatch-populate set-ip 10.1.25.100 --config config.yaml",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone, Default)]
pub struct LoggingArgs {
    /// Log at debug level
    #[arg(long, short, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(long, short, global = true)]
    pub quiet: bool,

    /// Also write the log (without colours) to this file
    #[arg(long, value_name = "PATH", global = true)]
    pub log_file: Option<PathBuf>,
}

impl LoggingArgs {
    /// Default filter directive; `RUST_LOG` takes precedence when set.
    pub fn level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            "info"
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Run(RunArgs),
    Steps,
    Verify(VerifyArgs),
    SetIp(SetIpArgs),
}

/// Run the provisioning stages against the configured appliance.
#[derive(Parser, Debug)]
#[command(about = "Provision the appliance (all steps, or one with --step)")]
pub struct RunArgs {
    /// YAML config describing the appliance and what to provision
    #[arg(long, short, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Check the config and exit without contacting anything
    #[arg(long, visible_alias = "dry-run")]
    pub validate: bool,

    /// Run only this step (authentication always runs)
    #[arg(long, value_enum, value_name = "STEP")]
    pub step: Option<Stage>,

    /// Where to write the run export (default: timestamped file in the working directory)
    #[arg(long, value_name = "PATH")]
    pub export: Option<PathBuf>,
}

/// Verify a previous run's export against the live appliance.
#[derive(Parser, Debug)]
#[command(about = "Check that items recorded in an export exist on the appliance")]
pub struct VerifyArgs {
    /// Export written by `run`
    #[arg(value_name = "EXPORT")]
    pub export: PathBuf,

    /// Config holding the appliance address and credentials
    #[arg(long, short, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
}

/// Rewrite the connection addresses of a config file.
#[derive(Parser, Debug)]
#[command(about = "Point the config at a new appliance IP (camera URLs are left alone)")]
pub struct SetIpArgs {
    /// New IPv4 address
    #[arg(value_name = "IP")]
    pub ip: String,

    #[arg(long, short, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Do not keep a timestamped backup of the original file
    #[arg(long)]
    pub no_backup: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_names_and_dry_run_alias_parse() {
        let args = RootArgs::try_parse_from([
            "onwatch-populate",
            "run",
            "--dry-run",
            "--step",
            "configure-devices",
            "--verbose",
        ])
        .unwrap();
        assert_eq!(args.logging.level(), "debug");
        let Command::Run(run) = args.command else {
            panic!("expected run");
        };
        assert!(run.validate);
        assert_eq!(run.step, Some(Stage::ConfigureDevices));
        assert_eq!(run.config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn unknown_step_is_rejected() {
        assert!(RootArgs::try_parse_from(["onwatch-populate", "run", "--step", "nope"]).is_err());
    }

    #[test]
    fn set_ip_takes_address_and_backup_flag() {
        let args = RootArgs::try_parse_from([
            "onwatch-populate",
            "set-ip",
            "10.1.1.9",
            "--no-backup",
            "--quiet",
        ])
        .unwrap();
        assert_eq!(args.logging.level(), "error");
        let Command::SetIp(set_ip) = args.command else {
            panic!("expected set-ip");
        };
        assert_eq!(set_ip.ip, "10.1.1.9");
        assert!(set_ip.no_backup);
    }
}
