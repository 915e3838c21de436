//! Aquatest CLI - Command-line interface
//!
//! Builds and flashes the device, then follows its console and reports test
//! progress. Exit codes are stable for CI use (`aquatest exit-codes`).

use aquatest_core::cli::{print_exit_codes, CliResult, ExitCodes};
use aquatest_core::config::{load_suite_dir, AppConfig, ConfigError, TestDefinition};
use aquatest_core::core::source::list_ports;
use aquatest_core::{
    BuildStep, FanoutSink, LineSource, NoBuild, ProcessSource, ReaderSource, Runner,
    SerialSource, SessionLog, ShellBuild, SourceError, TracingSink,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// CLI output format
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON format for scripting
    Json,
}

/// Aquatest CLI
#[derive(Parser, Debug)]
#[command(
    name = "aquatest",
    author = "Aquatest Team",
    version,
    about = "Hardware-in-the-loop acceptance test runner",
    long_about = None
)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true, env = "AQUATEST_CONFIG")]
    config: Option<PathBuf>,

    /// Directory of additional *.toml suite files
    #[arg(long, global = true)]
    suite_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Emit diagnostics as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Also write diagnostics to a daily log file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build, flash and test a device over its serial console
    Run {
        /// Serial port name (e.g., /dev/ttyUSB0, COM3)
        #[arg(short, long)]
        port: Option<String>,

        /// Baud rate
        #[arg(short, long)]
        baud: Option<u32>,

        /// Read the debug-probe RTT client instead of the serial port
        #[arg(long)]
        rtt: bool,

        /// Skip the build/flash step
        #[arg(long)]
        no_build: bool,

        /// Halt when no test triggers for this many seconds
        #[arg(long)]
        idle_timeout: Option<u64>,

        /// Finish once these tests have completed
        #[arg(long, value_delimiter = ',')]
        stop_after: Vec<String>,

        /// Write a JSON-lines session log into this directory
        #[arg(long)]
        session_log: Option<PathBuf>,

        /// Do not echo device output
        #[arg(long)]
        no_echo: bool,
    },

    /// Dispatch a captured console log ("-" for stdin)
    Replay {
        /// Log file
        file: PathBuf,

        /// Echo the log while replaying
        #[arg(long)]
        echo: bool,

        /// Write a JSON-lines session log into this directory
        #[arg(long)]
        session_log: Option<PathBuf>,
    },

    /// List available serial ports
    ListPorts {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Show the tests that would be registered
    ListTests {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Print the exit code table
    ExitCodes,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(parse_exit_code(&e));
        }
    };
    let _log_guard = init_logging(&cli);

    ctrlc::set_handler(|| {
        eprintln!("\nGracefully shutting down...");
        std::process::exit(i32::from(ExitCodes::CANCELLED));
    })
    .unwrap_or_else(|e| tracing::warn!("Failed to install Ctrl+C handler: {}", e));

    let result = match &cli.command {
        Commands::Run {
            port,
            baud,
            rtt,
            no_build,
            idle_timeout,
            stop_after,
            session_log,
            no_echo,
        } => {
            let overrides = RunOverrides {
                port: port.clone(),
                baud: *baud,
                no_build: *no_build,
                idle_timeout: *idle_timeout,
                stop_after: stop_after.clone(),
                session_log: session_log.clone(),
                echo: !*no_echo,
            };
            run_device(&cli, *rtt, overrides).await
        }
        Commands::Replay {
            file,
            echo,
            session_log,
        } => replay(&cli, file, *echo, session_log.as_deref()).await,
        Commands::ListPorts { format } => cli_result(show_ports(&cli, *format)),
        Commands::ListTests { format } => cli_result(show_tests(&cli, *format)),
        Commands::ExitCodes => {
            print_exit_codes();
            CliResult::success()
        }
    };

    match (&result, result.message()) {
        (CliResult::Success(_), Some(msg)) => tracing::info!("{}", msg),
        (CliResult::Error(code, _), Some(msg)) => tracing::error!(code, "{}", msg),
        _ => {}
    }
    result.to_exit_code()
}

/// Help and version requests succeed; anything else is a usage error
fn parse_exit_code(err: &clap::Error) -> u8 {
    if err.use_stderr() {
        ExitCodes::INVALID_ARGS
    } else {
        ExitCodes::SUCCESS
    }
}

fn init_logging(cli: &Cli) -> Option<WorkerGuard> {
    let level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (text, json) = if cli.json_logs {
        (None, Some(fmt::layer().json().with_writer(io::stderr)))
    } else {
        (Some(fmt::layer().with_target(false).with_writer(io::stderr)), None)
    };

    let (file, guard) = match &cli.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "aquatest.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
        .with(file)
        .init();
    guard
}

fn cli_result(result: anyhow::Result<()>) -> CliResult {
    match result {
        Ok(()) => CliResult::success(),
        Err(e) => CliResult::error(ExitCodes::ERROR, format!("{e:#}")),
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    if let Some(dir) = &cli.suite_dir {
        config.tests.extend(load_suite_dir(dir)?);
    }
    Ok(config)
}

fn event_sinks(config: &AppConfig, session_log: Option<&Path>) -> io::Result<FanoutSink> {
    let mut sinks = FanoutSink::new().with(TracingSink);

    let dir = session_log.map(Path::to_path_buf).or_else(|| {
        config
            .session_log
            .enabled
            .then(|| config.session_log.directory.clone())
            .flatten()
    });
    if let Some(dir) = dir {
        let log = SessionLog::create_in(&dir)?;
        tracing::info!(path = %log.path().display(), session = %log.session(), "Session log started");
        sinks.push(Box::new(log));
    }
    Ok(sinks)
}

fn build_step(config: &AppConfig) -> Box<dyn BuildStep> {
    if !config.build.enabled {
        return Box::new(NoBuild);
    }
    let mut build = ShellBuild::new(&config.build.script);
    if let Some(dir) = &config.build.working_dir {
        build = build.working_dir(dir);
    }
    if let Some(secs) = config.build.timeout_secs {
        build = build.timeout(Duration::from_secs(secs));
    }
    Box::new(build)
}

struct RunOverrides {
    port: Option<String>,
    baud: Option<u32>,
    no_build: bool,
    idle_timeout: Option<u64>,
    stop_after: Vec<String>,
    session_log: Option<PathBuf>,
    echo: bool,
}

async fn run_device(cli: &Cli, rtt: bool, overrides: RunOverrides) -> CliResult {
    let mut config = match load_config(cli) {
        Ok(config) => config,
        Err(e) => return CliResult::from(&e),
    };
    if let Some(port) = overrides.port {
        config.serial.port = port;
    }
    if let Some(baud) = overrides.baud {
        config.serial.baud_rate = baud;
    }
    if overrides.no_build {
        config.build.enabled = false;
    }
    if overrides.idle_timeout.is_some() {
        config.dispatch.idle_timeout_secs = overrides.idle_timeout;
    }
    if !overrides.stop_after.is_empty() {
        config.dispatch.stop_after = overrides.stop_after;
    }

    tracing::info!("Starting {} v{}", aquatest_core::NAME, aquatest_core::VERSION);
    let build = build_step(&config);

    if rtt {
        match ProcessSource::rtt() {
            Ok(source) => {
                execute(&config, source, build.as_ref(), overrides.session_log.as_deref(), overrides.echo).await
            }
            Err(e) => CliResult::from(&e),
        }
    } else {
        match SerialSource::open(&config.serial.port, config.serial.baud_rate) {
            Ok(source) => {
                execute(&config, source, build.as_ref(), overrides.session_log.as_deref(), overrides.echo).await
            }
            Err(e) => CliResult::from(&e),
        }
    }
}

async fn replay(cli: &Cli, file: &Path, echo: bool, session_log: Option<&Path>) -> CliResult {
    let config = match load_config(cli) {
        Ok(config) => config,
        Err(e) => return CliResult::from(&e),
    };

    if file == Path::new("-") {
        execute(&config, ReaderSource::stdin(), &NoBuild, session_log, echo).await
    } else {
        match ReaderSource::open(file) {
            Ok(source) => execute(&config, source, &NoBuild, session_log, echo).await,
            Err(SourceError::PortNotFound(path)) => {
                CliResult::error(ExitCodes::FILE_NOT_FOUND, format!("Log file not found: {path}"))
            }
            Err(e) => CliResult::from(&e),
        }
    }
}

async fn execute<S: LineSource>(
    config: &AppConfig,
    source: S,
    build: &dyn BuildStep,
    session_log: Option<&Path>,
    echo: bool,
) -> CliResult {
    let suite = match config.suite() {
        Ok(suite) => suite,
        Err(e) => return CliResult::from(&e),
    };
    let sinks = match event_sinks(config, session_log) {
        Ok(sinks) => sinks,
        Err(e) => return CliResult::error(ExitCodes::ERROR, format!("Failed to open session log: {e}")),
    };

    let mut runner = Runner::new(config.policy()).with_tests(suite);
    if echo {
        runner = runner.echo(Box::new(io::stdout()));
    }

    match runner.run(source, build, sinks).await {
        Ok(outcome) => {
            tracing::info!(
                phase = %outcome.report.phase,
                lines = outcome.report.lines_consumed,
                discarded = outcome.report.lines_discarded,
                "Run finished"
            );
            CliResult::from_outcome(&outcome)
        }
        Err(e) => CliResult::from(&e),
    }
}

fn show_ports(cli: &Cli, format: OutputFormat) -> anyhow::Result<()> {
    let ports = list_ports()?;

    if ports.is_empty() {
        if !cli.quiet {
            println!("No serial ports found.");
        }
        return Ok(());
    }

    match format {
        OutputFormat::Json => {
            let json: Vec<serde_json::Value> = ports
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "name": p.port_name,
                        "type": format!("{:?}", p.port_type)
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            for port in &ports {
                println!("{}", port.port_name);
            }
        }
    }

    Ok(())
}

fn show_tests(cli: &Cli, format: OutputFormat) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    let definitions: Vec<TestDefinition> = config.suite()?.iter().map(TestDefinition::from).collect();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&definitions)?),
        OutputFormat::Text => {
            for (i, def) in definitions.iter().enumerate() {
                println!("{}. {} (trigger: {:?})", i + 1, def.name, def.trigger);
                for marker in &def.markers {
                    println!("     - {marker}");
                }
                for marker in &def.fail_markers {
                    println!("     ! {marker}");
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_usage_errors_map_to_invalid_args() {
        let err = Cli::try_parse_from(["aquatest", "run", "--no-such-flag"]).unwrap_err();
        assert_eq!(parse_exit_code(&err), ExitCodes::INVALID_ARGS);

        let err = Cli::try_parse_from(["aquatest", "--help"]).unwrap_err();
        assert_eq!(parse_exit_code(&err), ExitCodes::SUCCESS);
    }

    #[test]
    fn test_run_flags() {
        let cli = Cli::try_parse_from([
            "aquatest",
            "run",
            "--port",
            "/dev/ttyACM0",
            "--stop-after",
            "BootupTest,CheckinTest",
            "--idle-timeout",
            "60",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                port,
                stop_after,
                idle_timeout,
                ..
            } => {
                assert_eq!(port.as_deref(), Some("/dev/ttyACM0"));
                assert_eq!(stop_after, vec!["BootupTest", "CheckinTest"]);
                assert_eq!(idle_timeout, Some(60));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
