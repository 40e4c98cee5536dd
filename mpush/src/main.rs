//! mpush - push MicroPython applications to a board over its raw REPL.
//!
//! Selects local files, optionally cross-compiles them, plans the remote
//! writes, and drives the board's raw REPL over a serial port.

#![forbid(unsafe_code)]

mod compile;
mod port;
mod select;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use mpush_common::config::CONFIG_FILE_NAME;
use mpush_common::{
    CancelToken, CliOverrides, ConfigError, DeployConfig, DeployError, DeployReport, Deployer,
    ErrorCode, LogConfig, Outcome, RemoteCommand, ReplSession, RetryController, RunOutcome,
    Settings, StreamTransport, TransferPlan, init_logging, verbosity_level,
};
use mpush_common::plan::PlanError;
use tokio_serial::SerialStream;
use tracing::{debug, error, info, warn};

use crate::compile::CompileError;
use crate::port::PortError;
use crate::select::SelectError;

type Link = RetryController<StreamTransport<SerialStream>>;

/// Same code a deploy run uses for an unusable link.
const EXIT_LINK_UNUSABLE: i32 = 2;

#[derive(Parser)]
#[command(name = "mpush")]
#[command(author, version, about = "Push MicroPython applications to a board over its raw REPL")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Project config file
    #[arg(short, long, global = true, default_value = CONFIG_FILE_NAME, value_name = "FILE")]
    config: PathBuf,

    /// Serial device the board is attached to (default: from config, /dev/ttyACM0)
    #[arg(short = 'd', long = "device", global = true, value_name = "DEVICE")]
    device: Option<String>,

    /// Baud rate (default: from config, 115200)
    #[arg(long, global = true)]
    baud: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default deploy.toml
    Init,

    /// Upload the project files to the board
    Deploy {
        /// Directory the file patterns are matched against
        /// (default: the directory containing the config file)
        #[arg(long, value_name = "DIR")]
        root: Option<PathBuf>,

        /// Wipe the target root before writing
        #[arg(long)]
        clean: bool,

        /// Print the transfer plan as JSON without touching the board
        #[arg(long)]
        dry_run: bool,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a Python snippet on the board and print its output
    Exec {
        /// Code to run
        #[arg(required_unless_present = "file", conflicts_with = "file")]
        code: Option<String>,

        /// Run the contents of a local file instead
        #[arg(short, long, value_name = "PATH")]
        file: Option<PathBuf>,
    },

    /// Recursively delete a directory on the board
    Wipe {
        /// Remote directory; `/` clears the filesystem but keeps the root
        #[arg(long, default_value = "/")]
        target: String,
    },

    /// Reset the board
    Reset {
        /// machine.reset() instead of a soft reboot
        #[arg(long)]
        hard: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = LogConfig::from_env(verbosity_level(cli.verbose)).with_stderr();
    let logging_guards = init_logging(&log_config)?;

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };
    drop(logging_guards);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<i32> {
    let overrides = CliOverrides {
        port: cli.device.clone(),
        baud: cli.baud,
    };
    match cli.command {
        Commands::Init => {
            DeployConfig::write_default(&cli.config)?;
            println!("{} {}", "Wrote".green(), cli.config.display());
            Ok(0)
        }
        Commands::Deploy {
            root,
            clean,
            dry_run,
            json,
        } => {
            if !cli.config.exists() {
                DeployConfig::write_default(&cli.config)?;
                warn!(
                    path = %cli.config.display(),
                    "config file not found; wrote a default config, edit it and run again"
                );
                eprintln!(
                    "{} no config at {}; wrote defaults, edit it and run again",
                    "warning:".yellow().bold(),
                    cli.config.display()
                );
                return Ok(0);
            }
            let settings = load_settings(&cli.config, overrides)?;
            let root = root.unwrap_or_else(|| search_root(&cli.config));
            deploy(&settings, &root, clean, dry_run, json).await
        }
        Commands::Exec { code, file } => {
            let source = match (code, file) {
                (Some(code), _) => code,
                (None, Some(path)) => tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("failed to read {}", path.display()))?,
                (None, None) => anyhow::bail!("nothing to run"),
            };
            let settings = load_optional_settings(&cli.config, overrides)?;
            exec(&settings, source).await
        }
        Commands::Wipe { target } => {
            let settings = load_optional_settings(&cli.config, overrides)?;
            let plan = TransferPlan::wipe(target);
            let report = execute_plan(&settings, &plan).await?;
            print_report(&report, false)?;
            Ok(report.exit_code())
        }
        Commands::Reset { hard } => {
            let settings = load_optional_settings(&cli.config, overrides)?;
            let mut link = connect(&settings).await?;
            if hard {
                link.session_mut().hard_reset().await?;
                println!("{}", "Board reset".green());
            } else {
                link.session_mut().soft_reset().await?;
                println!("{}", "Soft reboot".green());
            }
            // Reset already left raw mode; dropping closes the port.
            let _port = link.into_session();
            Ok(0)
        }
    }
}

fn search_root(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn load_settings(path: &Path, overrides: CliOverrides) -> Result<Settings> {
    let (config, origin) = DeployConfig::load_with_origin(path)?;
    debug!(path = %path.display(), "loaded config");
    Ok(Settings::resolve(config, Some(&origin), overrides)?)
}

/// Commands other than `deploy` work without a config file.
fn load_optional_settings(path: &Path, overrides: CliOverrides) -> Result<Settings> {
    if path.exists() {
        load_settings(path, overrides)
    } else {
        debug!(path = %path.display(), "no config file, using defaults");
        Ok(Settings::resolve(DeployConfig::default(), None, overrides)?)
    }
}

async fn connect(settings: &Settings) -> Result<Link> {
    let policy = settings.retry_policy();
    let transport = port::open(&settings.port.value, settings.baud.value, &policy).await?;
    let session = ReplSession::new(transport, settings.session_config());
    Ok(RetryController::new(session, policy))
}

async fn deploy(settings: &Settings, root: &Path, clean: bool, dry_run: bool, json: bool) -> Result<i32> {
    let sources = select::select_sources(root, &settings.deploy)?;
    info!(files = sources.len(), root = %root.display(), "selected files");

    let payloads = compile::prepare_payloads(&sources, &compile::mpy_cross_program()).await?;
    let options = settings.plan_options(clean || settings.deploy.clean);
    let plan = TransferPlan::build(&payloads, &options)?;
    info!(
        steps = plan.len(),
        files = plan.file_count,
        bytes = plan.total_bytes,
        "transfer plan ready"
    );

    if dry_run {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(0);
    }

    let report = execute_plan(settings, &plan).await?;
    print_report(&report, json)?;
    Ok(report.exit_code())
}

/// Run `plan` against the board; Ctrl-C stops the run between steps.
async fn execute_plan(settings: &Settings, plan: &TransferPlan) -> Result<DeployReport> {
    let link = connect(settings).await?;

    let cancel = CancelToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping after the current step");
                cancel.cancel();
            }
        })
    };

    let mut deployer = Deployer::new(link, cancel);
    let report = deployer.run(plan).await;
    watcher.abort();

    let _port = deployer.into_executor().release().await;
    Ok(report)
}

async fn exec(settings: &Settings, source: String) -> Result<i32> {
    let mut link = connect(settings).await?;
    let result = link.run(&RemoteCommand::script(source)).await;
    let _port = link.release().await;

    let result = match result {
        Ok(result) => result,
        Err(err) if err.is_link_fatal() => {
            report_error(&anyhow::Error::from(err));
            return Ok(EXIT_LINK_UNUSABLE);
        }
        Err(err) => return Err(err.into()),
    };
    print!("{}", result.output);
    match result.outcome {
        Outcome::Ok => Ok(0),
        Outcome::RemoteError(traceback) => {
            eprint!("{}", traceback.red());
            Ok(1)
        }
        Outcome::Timeout => {
            report_error(&anyhow::Error::from(DeployError::LinkUnusable {
                reason: "no response to script".into(),
            }));
            Ok(EXIT_LINK_UNUSABLE)
        }
    }
}

fn print_report(report: &DeployReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    match &report.outcome {
        RunOutcome::Success => println!(
            "{} {} files, {} bytes ({} steps)",
            "Deployed".green().bold(),
            report.files_written,
            report.bytes_written,
            report.steps_completed
        ),
        RunOutcome::Cancelled { next_step } => println!(
            "{} before step {} of {}",
            "Cancelled".yellow().bold(),
            next_step + 1,
            report.steps_total
        ),
        RunOutcome::PartialFailure { step } | RunOutcome::LinkUnusable { step } => {
            error!(step = step.index, code = %step.code, "run failed");
            eprintln!(
                "{} step {} of {}: {}",
                "Failed".red().bold(),
                step.index + 1,
                report.steps_total,
                step.description
            );
            eprintln!("  {}", step.error);
            eprintln!(
                "  {} of {} steps completed; files already written were left in place",
                report.steps_completed, report.steps_total
            );
        }
    }
    Ok(())
}

fn report_error(err: &anyhow::Error) {
    error!("{err:#}");
    eprintln!("{} {err:#}", "error:".red().bold());
    if let Some(code) = error_code(err) {
        eprintln!("\n{}", code.entry().format_full());
    }
}

fn error_code(err: &anyhow::Error) -> Option<ErrorCode> {
    if let Some(e) = err.downcast_ref::<DeployError>() {
        return Some(e.code());
    }
    if let Some(e) = err.downcast_ref::<ConfigError>() {
        return Some(e.code());
    }
    if let Some(e) = err.downcast_ref::<PlanError>() {
        return Some(e.code());
    }
    if let Some(e) = err.downcast_ref::<SelectError>() {
        return Some(e.code());
    }
    if let Some(e) = err.downcast_ref::<CompileError>() {
        return Some(e.code());
    }
    err.downcast_ref::<PortError>().map(PortError::code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["mpush", "deploy", "-vv", "-d", "/dev/ttyUSB0", "--clean"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.device.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cli.config, PathBuf::from("deploy.toml"));
        assert!(matches!(cli.command, Commands::Deploy { clean: true, dry_run: false, .. }));
    }

    #[test]
    fn test_exec_requires_code_or_file() {
        assert!(Cli::try_parse_from(["mpush", "exec"]).is_err());
        assert!(Cli::try_parse_from(["mpush", "exec", "print(1)", "--file", "x.py"]).is_err());

        let cli = Cli::try_parse_from(["mpush", "exec", "--file", "x.py"]).unwrap();
        assert!(matches!(cli.command, Commands::Exec { code: None, file: Some(_) }));
    }

    #[test]
    fn test_wipe_defaults_to_root() {
        let cli = Cli::try_parse_from(["mpush", "wipe"]).unwrap();
        assert!(matches!(cli.command, Commands::Wipe { ref target } if target == "/"));
    }

    #[test]
    fn test_search_root() {
        assert_eq!(search_root(Path::new("deploy.toml")), PathBuf::from("."));
        assert_eq!(
            search_root(Path::new("proj/deploy.toml")),
            PathBuf::from("proj")
        );
    }

    #[test]
    fn test_error_code_through_context() {
        let err = anyhow::Error::new(ConfigError::Invalid(vec!["bad".into()])).context("loading");
        assert_eq!(error_code(&err), Some(ErrorCode::ConfigValidationError));

        let err = anyhow::anyhow!("plain");
        assert_eq!(error_code(&err), None);
    }
}
