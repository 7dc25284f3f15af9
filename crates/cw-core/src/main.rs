//! cpuwatch - watch an application's CPU usage and stop it when it misbehaves.
//!
//! The main entry point handles:
//! - Running the monitor against `top` (default command)
//! - Parsing a captured `top` burst for inspection
//! - Printing the effective configuration

use clap::{Args, Parser, Subcommand};
use cw_core::action::{DryRunRemediator, Remediator, SystemRemediator};
use cw_core::collect::{parse_frame, FrameCollector};
use cw_core::config::{resolve_config_path, ConfigSource, MonitorConfig};
use cw_core::daemon::escalation::Statistic;
use cw_core::daemon::Monitor;
use cw_core::exit_codes::ExitCode;
use cw_core::logging::{init_logging, LogConfig, LogFormat, LogLevel};
use cw_core::metrics::{MetricsSink, NullSink};
use cw_core::subject::{FixedProbe, ScriptProbe, StateProbe, SubjectState};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Monitor an application's background CPU usage and kill it if it misbehaves.
#[derive(Parser)]
#[command(name = "cpuwatch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Config file (default: $CPUWATCH_CONFIG, then ~/.config/cpuwatch/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log format on stderr (human, jsonl)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    /// Show every matching process each tick; repeat for debug (-vv) or trace (-vvv) logs
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the subject (default)
    Run(RunArgs),
    /// Parse one captured `top` burst and print its rows as JSON
    Parse(ParseArgs),
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args, Debug, Default, Clone)]
struct RunArgs {
    /// Interval in seconds with which to poll `top`
    #[arg(short = 's', long = "interval", value_name = "SECONDS")]
    interval: Option<u64>,

    /// CPU threshold while idling in the background
    #[arg(short = 'i', long = "idle-threshold", value_name = "CPU")]
    idle_threshold: Option<f64>,

    /// CPU threshold while playing
    #[arg(short = 'p', long = "busy-threshold", value_name = "CPU")]
    busy_threshold: Option<f64>,

    /// Sample window size
    #[arg(short = 'n', long = "window", value_name = "SAMPLES")]
    window: Option<usize>,

    /// Monitor CPU even if the subject is the frontmost window
    #[arg(short = 'f', long)]
    force: bool,

    /// Log stop and kill decisions without acting on them
    #[arg(long)]
    dry_run: bool,

    /// Command name of the process to watch
    #[arg(long, value_name = "NAME")]
    subject: Option<String>,

    /// Window statistic: mean, median, or a percentile such as p90
    #[arg(long, value_name = "STAT")]
    statistic: Option<Statistic>,

    /// Breaches before asking the subject to quit
    #[arg(long, value_name = "K")]
    allowance: Option<u32>,

    /// Further breaches before killing it
    #[arg(long, value_name = "G")]
    grace: Option<u32>,

    /// Quiet time that ends one burst of `top` output
    #[arg(long, value_name = "MS")]
    idle_after_ms: Option<u64>,

    /// InfluxDB base URL for metrics export
    #[arg(long, value_name = "URL")]
    influx_url: Option<String>,

    /// InfluxDB database name
    #[arg(long, value_name = "NAME")]
    influx_db: Option<String>,

    /// Skip the AppleScript state query and assume this state
    #[arg(long, value_name = "STATE")]
    assume_state: Option<SubjectState>,
}

#[derive(Args, Debug)]
struct ParseArgs {
    /// File holding one burst of `top -l` output
    file: PathBuf,
}

fn main() {
    let cli = Cli::parse();

    // The first -v selects the process table, not log verbosity.
    let log_level =
        LogLevel::from_verbosity(cli.global.verbose.saturating_sub(1), cli.global.quiet);
    init_logging(&LogConfig::from_env(log_level, cli.global.log_format));

    let exit_code = match cli.command {
        None => run_monitor(&cli.global, &cli.run),
        Some(Commands::Run(args)) => run_monitor(&cli.global, &args),
        Some(Commands::Parse(args)) => run_parse(&args),
        Some(Commands::Config) => run_config(&cli.global),
    };

    std::process::exit(exit_code.into());
}

fn report(err: cw_common::Error) -> ExitCode {
    let code = ExitCode::from(&err);
    debug!(category = %err.category(), exit_code = %code, error = %err, "cpuwatch failed");
    eprintln!("cpuwatch: {err}");
    eprintln!("  hint: {}", err.remediation());
    code
}

// ============================================================================
// Configuration
// ============================================================================

fn load_config(
    global: &GlobalOpts,
    args: Option<&RunArgs>,
) -> cw_common::Result<(MonitorConfig, ConfigSource)> {
    let source = resolve_config_path(global.config.as_deref());
    let mut config = MonitorConfig::from_source(&source)?;
    if let Some(args) = args {
        apply_overrides(&mut config, args, global.verbose > 0);
    }
    config.validate()?;
    Ok((config, source))
}

fn apply_overrides(config: &mut MonitorConfig, args: &RunArgs, verbose: bool) {
    if let Some(v) = args.interval {
        config.poll_interval_secs = v;
    }
    if let Some(v) = args.idle_threshold {
        config.escalation.idle_threshold = v;
    }
    if let Some(v) = args.busy_threshold {
        config.escalation.busy_threshold = v;
    }
    if let Some(v) = args.window {
        config.escalation.window = v;
    }
    if let Some(v) = args.statistic {
        config.escalation.statistic = v;
    }
    if let Some(v) = args.allowance {
        config.escalation.breach_allowance = v;
    }
    if let Some(v) = args.grace {
        config.escalation.grace_ticks = v;
    }
    if let Some(v) = args.idle_after_ms {
        config.idle_after_ms = v;
    }
    if let Some(v) = &args.subject {
        config.subject = v.clone();
    }
    if let Some(v) = &args.influx_url {
        config.metrics.influx_url = Some(v.clone());
    }
    if let Some(v) = &args.influx_db {
        config.metrics.database = v.clone();
    }
    config.escalation.force |= args.force;
    config.dry_run |= args.dry_run;
    config.verbose |= verbose;
}

fn build_sink(config: &MonitorConfig) -> cw_common::Result<Box<dyn MetricsSink>> {
    let Some(url) = &config.metrics.influx_url else {
        return Ok(Box::new(NullSink));
    };

    #[cfg(feature = "influx")]
    {
        let timeout = std::time::Duration::from_millis(config.metrics.timeout_ms);
        let sink = cw_core::metrics::InfluxSink::new(url, &config.metrics.database, timeout);
        info!(endpoint = sink.endpoint(), "exporting metrics");
        Ok(Box::new(sink))
    }

    #[cfg(not(feature = "influx"))]
    {
        Err(cw_common::Error::Config(format!(
            "metrics export to {url} needs cpuwatch built with the `influx` feature"
        )))
    }
}

// ============================================================================
// Commands
// ============================================================================

fn run_monitor(global: &GlobalOpts, args: &RunArgs) -> ExitCode {
    match monitor(global, args) {
        Ok(()) => ExitCode::Clean,
        Err(e) => report(e),
    }
}

fn monitor(global: &GlobalOpts, args: &RunArgs) -> cw_common::Result<()> {
    let (config, source) = load_config(global, Some(args))?;
    info!(
        %source,
        subject = %config.subject,
        interval_secs = config.poll_interval_secs,
        idle_threshold = config.escalation.idle_threshold,
        busy_threshold = config.escalation.busy_threshold,
        window = config.escalation.window,
        statistic = %config.escalation.statistic,
        force = config.escalation.force,
        dry_run = config.dry_run,
        "starting"
    );

    let probe: Box<dyn StateProbe> = match args.assume_state {
        Some(state) => Box::new(FixedProbe(state)),
        None => Box::new(ScriptProbe::osascript(&config.subject)),
    };
    let remediator: Box<dyn Remediator> = if config.dry_run {
        Box::new(DryRunRemediator)
    } else {
        Box::new(SystemRemediator::new())
    };
    let sink = build_sink(&config)?;

    let mut monitor = Monitor::new(&config, probe, remediator, sink)?;
    let collector = FrameCollector::spawn(&config.collector_config()?)?;

    // `top` runs in its own process group, so Ctrl-C only reaches us.
    let handle = collector.shutdown_handle();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("interrupted; stopping collector");
        handle.shutdown();
    }) {
        warn!(error = %e, "cannot install Ctrl-C handler");
    }

    let result = monitor.run(&collector);
    collector.shutdown();
    Ok(result?)
}

fn run_parse(args: &ParseArgs) -> ExitCode {
    match parse_file(&args.file) {
        Ok(json) => {
            println!("{json}");
            ExitCode::Clean
        }
        Err(e) => report(e),
    }
}

fn parse_file(path: &Path) -> cw_common::Result<String> {
    let text = std::fs::read_to_string(path)?;
    let frame = parse_frame(&text)?;
    Ok(serde_json::to_string_pretty(&frame)?)
}

fn run_config(global: &GlobalOpts) -> ExitCode {
    let rendered = load_config(global, None).and_then(|(config, source)| {
        let toml = config.to_toml_string()?;
        Ok(format!("# source: {source}\n{toml}"))
    });
    match rendered {
        Ok(text) => {
            print!("{text}");
            ExitCode::Clean
        }
        Err(e) => report(e),
    }
}
