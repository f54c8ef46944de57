use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use deckpipe_client::{ClientConfig, HttpPipelineApi, RunOrchestrator};
use deckpipe_core::{LogBody, MemoryResumeStore, ResumeStore, RunState, RunStatus, RunUpdate};
use deckpipe_storage::SqliteResumeStore;
use std::{
    fs::OpenOptions,
    io::{self, IsTerminal, Write},
    path::PathBuf,
    process::ExitCode,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "deckpipe-watch", about = "Follow a presentation run until it settles")]
struct Args {
    /// Run identifier to observe.
    run_id: String,
    #[arg(long, env = "DECKPIPE_BASE_URL")]
    base_url: Option<String>,
    #[arg(long, env = "DECKPIPE_TOKEN", hide_env_values = true)]
    token: Option<String>,
    #[arg(long, env = "DECKPIPE_CONFIG")]
    config: Option<PathBuf>,
    /// SQLite file for resume markers; markers stay in memory when unset.
    #[arg(long, env = "DECKPIPE_STATE_DB")]
    state_db: Option<PathBuf>,
    #[arg(long)]
    poll_secs: Option<u64>,
    /// Drop stored markers untouched for this many days; 0 keeps them.
    #[arg(long, env = "DECKPIPE_MARKER_TTL_DAYS", default_value_t = 7)]
    marker_ttl_days: i64,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, env = "DECKPIPE_LOG_DIR", default_value = "")]
    log_dir: String,
    /// Print the full state as JSON after every update.
    #[arg(long, default_value_t = false)]
    json: bool,
}

fn load_config(args: &Args) -> Result<ClientConfig> {
    let mut config = ClientConfig::load(args.config.as_deref()).context("load config")?;
    if let Some(base_url) = args.base_url.as_deref() {
        config.set_base_url(base_url).context("--base-url")?;
    }
    if let Some(token) = args.token.as_deref() {
        if !token.trim().is_empty() {
            config.token = Some(token.to_string());
        }
    }
    if let Some(secs) = args.poll_secs {
        config.poll_interval = Duration::from_secs(secs);
    }
    config.validate().context("validate config")?;
    Ok(config)
}

fn open_store(args: &Args) -> Result<Arc<dyn ResumeStore>> {
    match args.state_db.as_deref() {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            let store = SqliteResumeStore::open(path)
                .with_context(|| format!("open resume store {}", path.display()))?;
            if args.marker_ttl_days > 0 {
                let cutoff = Utc::now() - chrono::Duration::days(args.marker_ttl_days);
                let removed = store
                    .prune_older_than(cutoff)
                    .context("prune resume markers")?;
                debug!("resume_markers_pruned: removed={removed}");
            }
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryResumeStore::new())),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let _log_guard = init_logging(&args);
    match run(args).await {
        Ok(status) => exit_code(status),
        Err(err) => {
            error!("watch_failed: {err:#}");
            eprintln!("deckpipe-watch: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<RunStatus> {
    let config = load_config(&args)?;
    let store = open_store(&args)?;
    let api = Arc::new(HttpPipelineApi::new(config.clone()).context("build http client")?);
    info!(
        "watch_start: run_id={} base_url={}",
        args.run_id, config.base_url
    );

    let mut orchestrator = RunOrchestrator::new(api, store, config);
    let (tx, mut rx) = mpsc::channel(256);
    let mut state = RunState::new(args.run_id.clone());
    orchestrator.start(args.run_id.clone(), tx).await;

    let mut stdout = io::stdout();
    loop {
        tokio::select! {
            update = rx.recv() => {
                let Some(update) = update else { break };
                let status_changed = matches!(update, RunUpdate::Status { .. });
                state.apply(update);
                if args.json {
                    serde_json::to_writer(&mut stdout, &state).context("encode state")?;
                    writeln!(stdout)?;
                } else {
                    writeln!(stdout, "{}", progress_line(&state))?;
                }
                stdout.flush()?;
                if status_changed && state.status.is_terminal() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("watch_interrupted: run_id={}", args.run_id);
                break;
            }
        }
    }

    orchestrator.stop().await;
    debug!("watch_stop: status={}", state.status);
    Ok(state.status)
}

fn progress_line(state: &RunState) -> String {
    let research = state
        .logs
        .iter()
        .filter(|log| matches!(log.body, LogBody::Research { .. }))
        .count();
    let mut line = format!(
        "[{}] {} | slides {}/{} | research {} | logs {}",
        state.status,
        state.title,
        state.completed_slides(),
        state.total_steps,
        research,
        state.logs.len()
    );
    if let Some(error) = state.error.as_deref() {
        line.push_str(" | error: ");
        line.push_str(error);
    }
    line
}

fn exit_code(status: RunStatus) -> ExitCode {
    if is_failure(status) {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn is_failure(status: RunStatus) -> bool {
    matches!(status, RunStatus::Error | RunStatus::Failed)
}

/// Level comes from `--debug`, then `RUST_LOG`, then `DECKPIPE_LOG_LEVEL`.
fn log_filter(debug: bool) -> EnvFilter {
    if debug {
        return EnvFilter::new("debug");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(std::env::var("DECKPIPE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()))
    })
}

fn init_logging(args: &Args) -> Option<LogGuard> {
    let guard = match LogGuard::open(&args.log_dir, &args.run_id) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard::default()
        }
    };
    let sink = guard.file.clone();
    // Escape codes would end up in the log file.
    let ansi = sink.is_none() && io::stderr().is_terminal();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(log_filter(args.debug))
        .with_target(false)
        .with_ansi(ansi)
        .with_writer(BoxMakeWriter::new(move || RunLogWriter {
            file: sink.clone(),
        }))
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok()?;
    Some(guard)
}

type SharedFile = Arc<Mutex<std::fs::File>>;

/// Keeps the per-run log file open for the life of the process.
#[derive(Default)]
struct LogGuard {
    file: Option<SharedFile>,
}

impl LogGuard {
    /// `<log_dir>/deckpipe-watch-<run>-<yyyymmdd>.log`, appended to. An empty
    /// `log_dir` logs to stderr only.
    fn open(log_dir: &str, run_id: &str) -> io::Result<Self> {
        if log_dir.trim().is_empty() {
            return Ok(Self::default());
        }
        let dir = PathBuf::from(log_dir);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(log_file_name(run_id, Utc::now()));
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Some(Arc::new(Mutex::new(file))),
        })
    }
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            let _ = file.flush();
        }
    }
}

/// Stderr plus the optional run log; stdout carries progress output only.
struct RunLogWriter {
    file: Option<SharedFile>,
}

impl Write for RunLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stderr().lock().write_all(buf);
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stderr().lock().flush();
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            file.flush()?;
        }
        Ok(())
    }
}

fn log_file_name(run_id: &str, now: DateTime<Utc>) -> String {
    format!(
        "deckpipe-watch-{}-{}.log",
        sanitize_component(run_id),
        now.format("%Y%m%d")
    )
}

fn sanitize_component(input: &str) -> String {
    input
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
