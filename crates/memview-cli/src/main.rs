use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use memview_core::{BackoffPolicy, ConnectionState, LogEntry, Strategy};
use memview_sync::{
    CommandError, CommandOutcome, ConnectionManager, FlowSignal, HttpApi, LogPoller, MemoryApi,
    OutcomeKind, ReconciliationCoordinator, StrategyPreference, TokioSleeper, ViewSnapshot,
    WsConnector, DEFAULT_POLL_INTERVAL, DEFAULT_TIMEOUT,
};
use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use url::Url;

const DEFAULT_BASE_URL: &str = "http://localhost:8000";
const CHANNEL_PATH: &str = "/ws";
const EXIT_VALIDATION: u8 = 2;

#[derive(Clone, Debug)]
struct Config {
    base_url: Url,
    ws_url: Url,
    timeout: Duration,
    log_dir: String,
    debug: bool,
}

#[derive(Parser, Debug)]
#[command(name = "memview", about = "Live view and commands for a memory allocation backend")]
struct Args {
    #[arg(long, global = true, default_value = "")]
    base_url: String,
    #[arg(long, global = true, default_value = "")]
    ws_url: String,
    /// Request timeout in seconds.
    #[arg(long, global = true)]
    timeout: Option<u64>,
    #[arg(long, global = true, default_value = "")]
    log_dir: String,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow the live channel and print a summary per snapshot.
    Watch,
    /// Fetch the current block list once.
    Snapshot,
    Allocate {
        pid: String,
        size: u64,
        #[arg(long, value_parser = parse_strategy)]
        strategy: Option<Strategy>,
    },
    Deallocate {
        pid: String,
    },
    /// Ask the backend which strategy fits a request of this size.
    Suggest {
        size: u64,
    },
    /// Poll the allocation history of one process.
    Log {
        pid: String,
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Stop after this many updates.
        #[arg(long)]
        count: Option<u64>,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Watch => "watch",
            Command::Snapshot => "snapshot",
            Command::Allocate { .. } => "allocate",
            Command::Deallocate { .. } => "deallocate",
            Command::Suggest { .. } => "suggest",
            Command::Log { .. } => "log",
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("memview: {err:#}");
            return ExitCode::from(EXIT_VALIDATION);
        }
    };
    let _log_file = init_logging(&config, args.command.name());
    info!(
        event = "memview_start",
        command = args.command.name(),
        base_url = %config.base_url,
        ws_url = %config.ws_url
    );

    match run(args.command, &config).await {
        Ok(code) => code,
        Err(err) => {
            error!(event = "command_failed", error = %format!("{err:#}"));
            eprintln!("memview: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config: &Config) -> Result<ExitCode> {
    let api = Arc::new(
        HttpApi::new(config.base_url.clone(), config.timeout).context("building backend client")?,
    );
    match command {
        Command::Watch => watch(config, api).await,
        Command::Snapshot => snapshot(api.as_ref()).await,
        Command::Allocate {
            pid,
            size,
            strategy,
        } => {
            let coordinator = ReconciliationCoordinator::new(api, StrategyPreference::default());
            Ok(report(coordinator.allocate(&pid, size, strategy).await))
        }
        Command::Deallocate { pid } => {
            let coordinator = ReconciliationCoordinator::new(api, StrategyPreference::default());
            Ok(report(coordinator.deallocate(&pid).await))
        }
        Command::Suggest { size } => {
            let coordinator = ReconciliationCoordinator::new(api, StrategyPreference::default());
            Ok(report(coordinator.suggest_strategy(size).await))
        }
        Command::Log {
            pid,
            interval_ms,
            count,
        } => {
            let interval = resolve_interval(interval_ms)?;
            follow_log(api, pid, interval, count).await
        }
    }
}

async fn watch(config: &Config, api: Arc<HttpApi>) -> Result<ExitCode> {
    let mut manager = ConnectionManager::new(
        WsConnector::new(config.ws_url.clone()),
        TokioSleeper,
        api,
        BackoffPolicy::default(),
    );
    let mut view = manager.view();
    let mut state = manager.watch_state();
    manager.connect();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let code = loop {
        tokio::select! {
            _ = &mut ctrl_c => break ExitCode::SUCCESS,
            snapshot = view.changed() => match snapshot {
                Some(snapshot) => println!("{}", format_summary(&snapshot)),
                None => break ExitCode::FAILURE,
            },
            changed = state.changed() => {
                if changed.is_err() {
                    break ExitCode::FAILURE;
                }
                let current = *state.borrow_and_update();
                eprintln!("connection: {current}");
                if current == ConnectionState::Exhausted {
                    break ExitCode::FAILURE;
                }
            }
        }
    };
    manager.shutdown().await;
    Ok(code)
}

async fn snapshot<A: MemoryApi>(api: &A) -> Result<ExitCode> {
    let report = api.fetch_snapshot().await.context("fetching snapshot")?;
    for record in &report.errors {
        warn!(event = "malformed_record", index = record.index, error = %record.error);
    }
    for block in &report.blocks {
        println!("{block}");
    }
    let metrics = memview_core::DerivedMetrics::compute(&report.blocks);
    println!(
        "total={} used={} free={} used%={} processes={}",
        metrics.total,
        metrics.used,
        metrics.free,
        metrics.used_percent_label(),
        metrics.process_count
    );
    Ok(ExitCode::SUCCESS)
}

async fn follow_log(
    api: Arc<HttpApi>,
    pid: String,
    interval: Duration,
    count: Option<u64>,
) -> Result<ExitCode> {
    let poller = LogPoller::start(api, TokioSleeper, pid, interval);
    let mut views = poller.subscribe();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut seen = 0u64;
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                println!(
                    "# {} generation {} ({} entries)",
                    view.pid,
                    view.generation,
                    view.entries.len()
                );
                for entry in &view.entries {
                    println!("{}", format_log_entry(entry));
                }
                seen += 1;
                if count.is_some_and(|limit| seen >= limit) {
                    break;
                }
            }
        }
    }
    poller.stop().await;
    Ok(ExitCode::SUCCESS)
}

fn report(result: Result<CommandOutcome, CommandError>) -> ExitCode {
    match result {
        Ok(outcome) => {
            println!("{}", format_outcome(&outcome));
            if outcome.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(err @ CommandError::Validation(_)) => {
            eprintln!("memview: {err}");
            ExitCode::from(EXIT_VALIDATION)
        }
        Err(err) => {
            error!(event = "command_failed", error = %err);
            eprintln!("memview: {err}");
            ExitCode::FAILURE
        }
    }
}

fn format_outcome(outcome: &CommandOutcome) -> String {
    let mut line = match outcome.kind {
        OutcomeKind::Success => outcome.message.clone(),
        OutcomeKind::SuccessWithWarning => format!("warning: {}", outcome.message),
        OutcomeKind::Failure => format!("failed: {}", outcome.message),
    };
    match &outcome.signal {
        Some(FlowSignal::NavigateToProcess(pid)) => {
            line.push_str(&format!(" (next: memview log {pid})"))
        }
        Some(FlowSignal::StrategySelected(strategy)) => {
            line.push_str(&format!(" (selected {strategy})"))
        }
        Some(FlowSignal::ClearAllocation(_)) | None => {}
    }
    line
}

fn format_summary(snapshot: &ViewSnapshot) -> String {
    let metrics = &snapshot.metrics;
    format!(
        "blocks={} total={} used={} free={} used%={} processes={}",
        snapshot.blocks.len(),
        metrics.total,
        metrics.used,
        metrics.free,
        metrics.used_percent_label(),
        metrics.process_count
    )
}

fn format_log_entry(entry: &LogEntry) -> String {
    format!(
        "{} {} size={} strategy={} {}",
        entry.timestamp.to_rfc3339(),
        entry.range,
        entry.size,
        entry.strategy,
        entry.status
    )
}

fn parse_strategy(raw: &str) -> Result<Strategy, String> {
    raw.parse().map_err(|err: String| {
        let choices: Vec<&str> = Strategy::ALL.iter().map(Strategy::as_str).collect();
        format!("{err} (expected one of {})", choices.join(", "))
    })
}

fn load_config(args: &Args) -> Result<Config> {
    let base_raw = resolve_string(&args.base_url, "MEMVIEW_BASE_URL")
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    let base_url =
        Url::parse(base_raw.trim()).with_context(|| format!("invalid base URL {base_raw}"))?;
    let ws_url = match resolve_string(&args.ws_url, "MEMVIEW_WS_URL") {
        Some(raw) => Url::parse(raw.trim()).with_context(|| format!("invalid channel URL {raw}"))?,
        None => derive_ws_url(&base_url)?,
    };
    let timeout = match resolve_u64(args.timeout, "MEMVIEW_TIMEOUT_SECS")? {
        Some(0) | None => DEFAULT_TIMEOUT,
        Some(secs) => Duration::from_secs(secs),
    };
    Ok(Config {
        base_url,
        ws_url,
        timeout,
        log_dir: resolve_string(&args.log_dir, "MEMVIEW_LOG_DIR").unwrap_or_default(),
        debug: args.debug || env_true("MEMVIEW_DEBUG"),
    })
}

fn resolve_interval(flag: Option<u64>) -> Result<Duration> {
    match resolve_u64(flag, "MEMVIEW_LOG_POLL_MS")? {
        Some(0) | None => Ok(DEFAULT_POLL_INTERVAL),
        Some(ms) => Ok(Duration::from_millis(ms)),
    }
}

fn derive_ws_url(base: &Url) -> Result<Url> {
    let mut url = base.clone();
    let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot derive channel URL from {base}"))?;
    url.set_path(CHANNEL_PATH);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn resolve_string(flag: &str, key: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.to_string());
    }
    if let Ok(value) = std::env::var(key) {
        if !value.trim().is_empty() {
            return Some(value);
        }
    }
    None
}

fn resolve_u64(flag: Option<u64>, key: &str) -> Result<Option<u64>> {
    if flag.is_some() {
        return Ok(flag);
    }
    match resolve_string("", key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{key} must be a non-negative integer, got {raw}")),
        None => Ok(None),
    }
}

fn env_true(key: &str) -> bool {
    std::env::var(key).map(|value| is_truthy(&value)).unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

type LogFile = Arc<Mutex<std::fs::File>>;

/// Installs the global subscriber. Events go to stderr, so stdout only
/// carries command results, and to `memview-<command>.log` when a log
/// directory is configured.
fn init_logging(config: &Config, command: &str) -> Option<LogFile> {
    let level = if let Ok(level) = std::env::var("MEMVIEW_LOG_LEVEL") {
        level
    } else if config.debug {
        "debug".to_string()
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let (file, file_error) = match open_log_file(&config.log_dir, command) {
        Ok(file) => (file, None),
        Err(err) => (None, Some(err)),
    };
    let sink = file.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(BoxMakeWriter::new(move || LogTee::new(sink.clone())))
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    // Reported once; the command keeps logging to stderr only.
    if let Some(err) = file_error {
        warn!(event = "log_file_unavailable", dir = %config.log_dir, error = %err);
    }
    file
}

struct LogTee {
    stderr: io::Stderr,
    file: Option<LogFile>,
}

impl LogTee {
    fn new(file: Option<LogFile>) -> Self {
        Self {
            stderr: io::stderr(),
            file,
        }
    }
}

impl Write for LogTee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stderr.write_all(buf);
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stderr.flush();
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            let _ = file.flush();
        }
        Ok(())
    }
}

/// `Ok(None)` when file logging is off. A directory that cannot be created
/// or a file that cannot be opened is an error for the caller to report.
fn open_log_file(log_dir: &str, command: &str) -> io::Result<Option<LogFile>> {
    if log_dir.trim().is_empty() {
        return Ok(None);
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("memview-{command}.log"));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Some(Arc::new(Mutex::new(file))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use memview_core::{LogStatus, MemoryBlock};

    #[test]
    fn channel_url_follows_base_scheme() {
        let plain = derive_ws_url(&Url::parse("http://localhost:8000").unwrap()).unwrap();
        assert_eq!(plain.as_str(), "ws://localhost:8000/ws");

        let secure =
            derive_ws_url(&Url::parse("https://sim.example.com/api?x=1").unwrap()).unwrap();
        assert_eq!(secure.as_str(), "wss://sim.example.com/ws");
    }

    #[test]
    fn explicit_flags_win_over_environment() {
        let args = Args::try_parse_from([
            "memview",
            "--base-url",
            "http://10.0.0.5:9000",
            "--timeout",
            "3",
            "snapshot",
        ])
        .unwrap();
        let config = load_config(&args).unwrap();
        assert_eq!(config.base_url.as_str(), "http://10.0.0.5:9000/");
        assert_eq!(config.timeout, Duration::from_secs(3));
        assert_eq!(args.command.name(), "snapshot");
    }

    #[test]
    fn allocate_accepts_loose_strategy_names() {
        let args = Args::try_parse_from([
            "memview",
            "allocate",
            "P1",
            "64",
            "--strategy",
            "Best-Fit",
        ])
        .unwrap();
        match args.command {
            Command::Allocate {
                pid,
                size,
                strategy,
            } => {
                assert_eq!(pid, "P1");
                assert_eq!(size, 64);
                assert_eq!(strategy, Some(Strategy::BestFit));
            }
            other => panic!("unexpected command {other:?}"),
        }

        let err = parse_strategy("next_fit").unwrap_err();
        assert!(err.contains("first_fit, best_fit, worst_fit"), "{err}");
    }

    #[test]
    fn log_flags_parse() {
        let args = Args::try_parse_from([
            "memview",
            "--debug",
            "log",
            "P3",
            "--interval-ms",
            "500",
            "--count",
            "2",
        ])
        .unwrap();
        assert!(args.debug);
        assert!(matches!(
            args.command,
            Command::Log {
                interval_ms: Some(500),
                count: Some(2),
                ..
            }
        ));
        assert_eq!(resolve_interval(Some(500)).unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn log_file_is_named_after_command() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("logs");
        let file = open_log_file(nested.to_str().unwrap(), "watch").unwrap();
        let mut writer = LogTee::new(file);
        writer.write_all(b"event=channel_open\n").unwrap();
        writer.flush().unwrap();

        let written = std::fs::read_to_string(nested.join("memview-watch.log")).unwrap();
        assert_eq!(written, "event=channel_open\n");
        assert!(open_log_file("  ", "watch").unwrap().is_none());
    }

    #[test]
    fn unusable_log_dir_is_an_error() {
        let blocker = tempfile::NamedTempFile::new().unwrap();
        let under_file = blocker.path().join("logs");

        assert!(open_log_file(blocker.path().to_str().unwrap(), "watch").is_err());
        assert!(open_log_file(under_file.to_str().unwrap(), "watch").is_err());
    }

    #[test]
    fn truthy_values() {
        for value in ["1", "true", " YES ", "on"] {
            assert!(is_truthy(value), "{value}");
        }
        assert!(!is_truthy("0"));
        assert!(!is_truthy(""));
    }

    #[test]
    fn outcome_lines_distinguish_warning_and_failure() {
        let warned = memview_sync::decide_allocation("P1", false, true, None);
        assert!(format_outcome(&warned).starts_with("warning: "));
        assert!(format_outcome(&warned).ends_with("(next: memview log P1)"));

        let failed =
            memview_sync::decide_allocation("P1", true, false, Some("No suitable block found"));
        assert_eq!(format_outcome(&failed), "failed: No suitable block found");
    }

    #[test]
    fn summary_line_carries_metrics() {
        let blocks = vec![
            MemoryBlock::free(0, 99).unwrap(),
            MemoryBlock::used(100, 149, "P2").unwrap(),
        ];
        let snapshot = ViewSnapshot {
            revision: 1,
            source: memview_sync::ViewSource::Channel,
            received_at: None,
            metrics: memview_core::DerivedMetrics::compute(&blocks),
            blocks,
        };
        assert_eq!(
            format_summary(&snapshot),
            "blocks=2 total=150 used=50 free=100 used%=33.3 processes=1"
        );
    }

    #[test]
    fn log_entry_line() {
        let entry: LogEntry = serde_json::from_value(serde_json::json!({
            "pid": 7,
            "range": "[0-9]",
            "size": 10,
            "timestamp": "2026-03-01T12:00:00",
            "strategy": "First Fit",
            "status": "released",
        }))
        .unwrap();
        assert_eq!(entry.status, LogStatus::Released);
        assert_eq!(
            format_log_entry(&entry),
            "2026-03-01T12:00:00+00:00 [0-9] size=10 strategy=first_fit released"
        );
    }
}
