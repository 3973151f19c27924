use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ponghub::alerts::Dispatcher;
use ponghub::config::{Config, ConfigError, MonitorConfig};
use ponghub::metrics::HistoryStore;
use ponghub::monitors::probe::Prober;
use ponghub::scheduler::{CycleReport, Engine, Trigger};
use ponghub::security::process_env;

#[derive(Parser, Debug)]
#[command(name = "ponghub")]
#[command(version, about = "Availability monitoring for HTTP(S) services", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Verbose output (-v, -vv, -vvv, -vvvv)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// History data file
    #[arg(long = "data")]
    data: Option<PathBuf>,

    /// Where to write the status snapshot after each cycle
    #[arg(long = "snapshot")]
    snapshot: Option<PathBuf>,

    /// Log file (appended)
    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,

    /// Keep running cycles until Ctrl-C
    #[arg(long = "watch")]
    watch: bool,

    /// Seconds between cycles in watch mode when no schedule is configured
    #[arg(long = "interval", default_value_t = 300)]
    interval: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    ponghub::init_tracing(args.verbose, args.log_file.clone());

    let config_path = args.config.clone().unwrap_or_else(Config::default_config_path);
    let env = process_env();
    let config = match MonitorConfig::load(&config_path, env.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            report_config_error(&config_path, &e);
            return ExitCode::from(2);
        }
    };

    for warning in &config.warnings {
        warn!("Config: {}", warning);
        eprintln!("Warning: {}", warning);
    }

    match run(args, config).await {
        Ok(true) => ExitCode::from(1),
        Ok(false) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

fn report_config_error(path: &Path, e: &ConfigError) {
    error!("Config: {:?} rejected: {}", path, e);
    match e {
        ConfigError::Invalid(problems) => {
            eprintln!("Invalid configuration {:?}:", path);
            for problem in problems {
                eprintln!("  - {}", problem);
            }
        }
        other => eprintln!("Invalid configuration {:?}: {}", path, other),
    }
}

/// Returns whether the CI signal tripped.
async fn run(args: Args, config: MonitorConfig) -> Result<bool> {
    let env = process_env();
    let data_path = args.data.clone().unwrap_or_else(Config::data_file_path);
    let snapshot_path = args.snapshot.clone().unwrap_or_else(Config::snapshot_file_path);

    let history = HistoryStore::load_from_disk(&data_path, &config.history)?;
    let (dispatcher, ci_flag) = Dispatcher::from_config(&config.notifications, Arc::clone(&env))
        .context("Failed to set up notification channels")?;
    let roots = config
        .ca_certificates
        .iter()
        .map(|path| std::fs::read(path).with_context(|| format!("Failed to read CA certificate {:?}", path)))
        .collect::<Result<Vec<_>>>()?;
    let prober = Prober::with_root_certificates(config.retry_policy(), Arc::clone(&env), &roots)?;

    let trigger = match config.schedule {
        Some(ref expression) => Trigger::cron(expression)
            .with_context(|| format!("Invalid schedule {:?}", expression))?,
        None => Trigger::Interval(Duration::from_secs(args.interval.max(1))),
    };

    let mut engine = Engine::new(config, history, prober, dispatcher);

    if args.watch {
        let shutdown = CancellationToken::new();
        let ctrl_c = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Scheduler: Ctrl-C received, stopping");
                ctrl_c.cancel();
            }
        });

        engine
            .run_forever(trigger, shutdown, |report, state| {
                print_report(report);
                persist(state.history(), report, &data_path, &snapshot_path);
            })
            .await;
    } else {
        let report = engine.run_cycle().await;
        print_report(&report);
        persist(engine.history(), &report, &data_path, &snapshot_path);
    }

    Ok(ci_flag.map(|flag| flag.load(Ordering::SeqCst)).unwrap_or(false))
}

fn persist(history: &HistoryStore, report: &CycleReport, data_path: &Path, snapshot_path: &Path) {
    if let Err(e) = history.save_to_disk(data_path) {
        error!("History: failed to save {:?}: {:#}", data_path, e);
    }
    if let Err(e) = report.snapshot.save_to_disk(snapshot_path) {
        error!("State: failed to save snapshot {:?}: {:#}", snapshot_path, e);
    }
}

fn print_report(report: &CycleReport) {
    for endpoint in &report.snapshot.endpoints {
        let latest = endpoint.latest.as_ref();
        let latency = latest
            .map(|o| format!("{}ms", o.result.latency_ms()))
            .unwrap_or_else(|| "-".to_string());
        let reason = latest.map(|o| o.verdict.reason.as_str()).unwrap_or("");
        let uptime = endpoint
            .summary_24h
            .uptime_ratio
            .map(|r| format!("{:.1}%", r * 100.0))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<9} {} {} [{} | 24h {}] {}",
            endpoint.status.state.as_str().to_uppercase(),
            endpoint.service,
            ponghub::logging::ellipse(&endpoint.endpoint, 80),
            latency,
            uptime,
            reason
        );
    }
}
