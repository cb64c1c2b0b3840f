//! Chaos - fault-injection CLI for Nomad server clusters
//!
//! Runs YAML scenarios against a live cluster, or injects, heals and checks
//! single faults by hand.

#![forbid(unsafe_code)]

mod api;
mod commands;
mod config;
mod discovery;
mod driver;
mod output;
mod scenario_file;
#[cfg(unix)]
mod ssh;
mod state_file;

use anyhow::Result;
use chaos_core::{LogConfig, init_logging};
use clap::{Parser, Subcommand};
use output::ReportFormat;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "chaos")]
#[command(author, version, about = "Fault-injection testing for Nomad server clusters")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: nearest chaos.toml)
    #[arg(short, long, global = true, env = "CHAOS_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a chaos scenario
    ///
    /// The scenario may be a path to a YAML file or a name looked up in the
    /// scenario directories (`<name>`, `<name>.yaml`, `<name>.yml`).
    Run {
        scenario: String,

        /// Overall scenario budget
        #[arg(short, long, default_value = "5m", value_parser = humantime::parse_duration)]
        timeout: Duration,

        /// Extra directory to search first
        #[arg(short, long)]
        scenarios: Option<PathBuf>,

        /// Shorthand for --format json
        #[arg(long)]
        json: bool,

        #[arg(short, long, value_enum, default_value_t = ReportFormat::Table)]
        format: ReportFormat,

        /// Write the report to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Inject a single fault and remember it for `heal`
    Inject {
        action: String,

        /// Action argument as key=value (repeatable)
        #[arg(short, long = "arg", value_name = "KEY=VALUE")]
        args: Vec<String>,

        #[arg(short, long, default_value = "30s", value_parser = humantime::parse_duration)]
        timeout: Duration,
    },

    /// Roll back the fault recorded by the last `inject`
    Heal {
        #[arg(short, long, default_value = "30s", value_parser = humantime::parse_duration)]
        timeout: Duration,
    },

    /// Check cluster state with an assertion
    Assert {
        assertion: String,

        /// Assertion argument as key=value (repeatable)
        #[arg(short, long = "arg", value_name = "KEY=VALUE")]
        args: Vec<String>,

        /// Keep polling until the assertion passes or this much time elapses
        #[arg(long, value_parser = humantime::parse_duration)]
        within: Option<Duration>,

        #[arg(short, long, default_value = "30s", value_parser = humantime::parse_duration)]
        timeout: Duration,
    },

    /// Display or convert a saved JSON report
    Report {
        file: PathBuf,

        #[arg(short, long, value_enum, default_value_t = ReportFormat::Table)]
        format: ReportFormat,

        /// Write the rendering to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List available actions and assertions
    List,

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = init_logging(&log_config)?;

    let passed = match cli.command {
        Commands::List => commands::list()?,
        Commands::Report {
            file,
            format,
            output,
        } => commands::report(&file, format, output.as_deref())?,
        Commands::Version => {
            println!("chaos {}", env!("CARGO_PKG_VERSION"));
            true
        }
        command => {
            let config = config::Config::load(cli.config.as_deref())?;
            let app = commands::App::new(config, cli.verbose)?;
            match command {
                Commands::Run {
                    scenario,
                    timeout,
                    scenarios,
                    json,
                    format,
                    output,
                } => {
                    let format = if json { ReportFormat::Json } else { format };
                    app
                        .run(&scenario, timeout, scenarios, format, output.as_deref())
                        .await?
                }
                Commands::Inject {
                    action,
                    args,
                    timeout,
                } => app.inject(&action, &args, timeout).await?,
                Commands::Heal { timeout } => app.heal(timeout).await?,
                Commands::Assert {
                    assertion,
                    args,
                    within,
                    timeout,
                } => app.assert(&assertion, &args, within, timeout).await?,
                Commands::List | Commands::Version | Commands::Report { .. } => true,
            }
        }
    };

    Ok(if passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "chaos", "-v", "run", "leader-failover", "--timeout", "90s", "--json", "-o", "out.json",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Run {
                scenario,
                timeout,
                json,
                output,
                ..
            } => {
                assert_eq!(scenario, "leader-failover");
                assert_eq!(timeout, Duration::from_secs(90));
                assert!(json);
                assert_eq!(output, Some(PathBuf::from("out.json")));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_inject_args() {
        let cli = Cli::try_parse_from([
            "chaos",
            "inject",
            "partition",
            "--arg",
            "source=server-0",
            "-a",
            "target=server-1",
        ])
        .unwrap();
        match cli.command {
            Commands::Inject { action, args, timeout } => {
                assert_eq!(action, "partition");
                assert_eq!(args, vec!["source=server-0", "target=server-1"]);
                assert_eq!(timeout, Duration::from_secs(30));
            }
            _ => panic!("expected inject"),
        }
    }

    #[test]
    fn test_parse_assert_within() {
        let cli = Cli::try_parse_from(["chaos", "assert", "leader-elected", "--within", "1m"]).unwrap();
        match cli.command {
            Commands::Assert { within, .. } => assert_eq!(within, Some(Duration::from_secs(60))),
            _ => panic!("expected assert"),
        }
    }

    #[test]
    fn test_parse_report() {
        let cli = Cli::try_parse_from(["chaos", "report", "results.json", "-f", "md"]).unwrap();
        match cli.command {
            Commands::Report { file, format, output } => {
                assert_eq!(file, PathBuf::from("results.json"));
                assert_eq!(format, ReportFormat::Markdown);
                assert_eq!(output, None);
            }
            _ => panic!("expected report"),
        }
        assert!(Cli::try_parse_from(["chaos", "report", "r.json", "-f", "html"]).is_err());
    }

    #[test]
    fn test_bad_duration_rejected() {
        assert!(Cli::try_parse_from(["chaos", "heal", "--timeout", "soon"]).is_err());
    }
}
