//! The long-running suggestion service.
//!
//! Lifecycle: `Init -> Running -> ShuttingDown -> Stopped`. While running the
//! daemon accepts one connection at a time and handles it to completion
//! before accepting the next, so store writes are never concurrent. The
//! accept waits only briefly, which lets the loop notice a stop request.
//!
//! Shutdown retrains: recent successful commands are re-encoded into a fresh
//! index snapshot that replaces the old one and is written to disk.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::embedding::{EmbeddingProvider, HashingEmbedder};
use crate::engine::{SuggestionEngine, DEFAULT_CONTEXT_WINDOW};
use crate::index::{EntryMetadata, IndexEntry, IndexSnapshot, SimilarityIndex, SnapshotIndex};
use crate::monitor::ResourceMonitor;
use crate::privacy::{PatternFilter, PrivacyFilter};
use crate::protocol::{
    decode_request, encode_line, ProtocolError, Request, Response, SearchFormat, MAX_REQUEST_BYTES,
};
use crate::store::{CommandStore, NewCommand};
use crate::util::{current_user, epoch_now};

/// Retraining on fewer commands than this is not worth it.
pub const MIN_RETRAIN_COMMANDS: usize = 10;
/// Sequences seen fewer times than this are not habits yet.
pub const MIN_SEQUENCE_FREQUENCY: i64 = 2;

const READ_TIMEOUT: Duration = Duration::from_secs(2);
const READ_CHUNK_SIZE: usize = 4096;

/// Everything the daemon depends on, built once at startup.
pub struct DaemonContext {
    pub config: Config,
    pub store: Arc<CommandStore>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub index: Arc<SnapshotIndex>,
    pub engine: Option<SuggestionEngine>,
    pub privacy: Box<dyn PrivacyFilter>,
}

impl DaemonContext {
    /// Open the store and wire the default providers. Any failure here is
    /// fatal to startup.
    pub fn from_config(config: Config) -> Result<DaemonContext> {
        let store = Arc::new(CommandStore::open(&config.database.path)?);
        if config.database.retention_days > 0 {
            store
                .cleanup_old_data(config.database.retention_days)
                .context("Pruning history past retention")?;
        }
        let privacy = Box::new(PatternFilter::from_config(&config.privacy)?);
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashingEmbedder::default());

        let index = Arc::new(SnapshotIndex::new());
        let index_path = &config.daemon.index_path;
        if index_path.exists() {
            match IndexSnapshot::load(index_path) {
                Ok(snapshot) if snapshot.dimensions() == embedder.dimensions() => {
                    info!(entries = snapshot.len(), path = %index_path.display(), "Loaded index snapshot");
                    index.swap(snapshot)?;
                }
                Ok(snapshot) => warn!(
                    dimensions = snapshot.dimensions(),
                    "Ignoring index snapshot built for a different embedder"
                ),
                Err(err) => warn!(error = %err, "Ignoring unreadable index snapshot"),
            }
        }

        Ok(DaemonContext::new(config, store, embedder, index, privacy))
    }

    pub fn new(
        config: Config,
        store: Arc<CommandStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<SnapshotIndex>,
        privacy: Box<dyn PrivacyFilter>,
    ) -> DaemonContext {
        let engine = config.suggestions.enabled.then(|| {
            let searchable: Arc<dyn SimilarityIndex> = index.clone();
            SuggestionEngine::new(
                Arc::clone(&store),
                config.suggestions.max_suggestions,
                config.suggestions.min_confidence,
            )
            .with_semantic(Arc::clone(&embedder), searchable)
        });
        DaemonContext {
            config,
            store,
            embedder,
            index,
            engine,
            privacy,
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    Init,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Counters {
    pub requests_handled: u64,
    pub commands_logged: u64,
    pub commands_filtered: u64,
    pub suggestions_generated: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetrainOutcome {
    Skipped { available: usize },
    Rebuilt { commands: usize, entries: usize },
    Failed(String),
}

pub struct Daemon {
    ctx: DaemonContext,
    state: DaemonState,
    session_id: String,
    shell: Option<String>,
    counters: Counters,
    started: Instant,
    stop_requested: bool,
    monitor: ResourceMonitor,
}

impl Daemon {
    pub fn new(ctx: DaemonContext) -> Result<Daemon> {
        let shell = std::env::var("SHELL").ok().and_then(|s| {
            Path::new(&s)
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
        });
        let cwd = std::env::current_dir()
            .ok()
            .map(|p| p.display().to_string());
        let session_id = ctx
            .store
            .create_session(shell.as_deref(), cwd.as_deref())
            .context("Creating daemon session")?;

        Ok(Daemon {
            ctx,
            state: DaemonState::Init,
            session_id,
            shell,
            counters: Counters::default(),
            started: Instant::now(),
            stop_requested: false,
            monitor: ResourceMonitor::new(),
        })
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    pub fn context(&self) -> &DaemonContext {
        &self.ctx
    }

    /// Run one request. Never fails: errors become error responses.
    pub fn handle_request(&mut self, request: Request) -> Response {
        self.counters.requests_handled += 1;
        let action = request.action();
        match self.dispatch(request) {
            Ok(response) => response,
            Err(err) => {
                self.counters.errors += 1;
                let message = format!("{:#}", err);
                warn!(action, error = %message, "Request failed");
                Response::error(message)
            }
        }
    }

    fn dispatch(&mut self, request: Request) -> Result<Response> {
        match request {
            Request::Suggest {
                partial,
                cwd,
                history,
            } => Ok(self.suggest(&partial, cwd.as_deref(), &history)),
            Request::LogCommand {
                command,
                exit_code,
                duration,
                cwd,
                session_id,
            } => self.log_command(&command, exit_code, duration, &cwd, session_id.as_deref()),
            Request::Search {
                query,
                limit,
                format,
                cwd,
            } => self.search(&query, limit, format, cwd.as_deref()),
            Request::Sequences { limit } => {
                let sequences = self
                    .ctx
                    .store
                    .frequent_sequences(MIN_SEQUENCE_FREQUENCY, limit)?;
                Ok(Response::ok(json!({ "sequences": sequences })))
            }
            Request::Context { command_id, window } => {
                match self.ctx.store.get_command_context(command_id, window)? {
                    Some(context) => Ok(Response::ok(json!({ "context": context }))),
                    None => Ok(Response::error(format!("No command with id {}", command_id))),
                }
            }
            Request::Ping => Ok(Response::ok(json!({
                "pong": true,
                "pid": std::process::id(),
                "version": crate::GIT_VERSION,
            }))),
            Request::Status => Ok(self.status()),
            Request::Shutdown => {
                info!("Shutdown requested by client");
                self.stop_requested = true;
                Ok(Response::ok(json!({ "stopping": true })))
            }
        }
    }

    fn suggest(&mut self, partial: &str, cwd: Option<&str>, history: &[String]) -> Response {
        let engine = match &self.ctx.engine {
            Some(engine) => engine,
            None => return Response::ok(json!({ "suggestions": [] })),
        };
        let suggestions = engine.get_suggestions(partial, cwd, history, DEFAULT_CONTEXT_WINDOW);
        self.counters.suggestions_generated += suggestions.len() as u64;
        debug!(partial, count = suggestions.len(), "Generated suggestions");

        if self.ctx.config.suggestions.rerank {
            let ranked = engine.rank_suggestions(suggestions, cwd);
            Response::ok(json!({ "suggestions": ranked }))
        } else {
            Response::ok(json!({ "suggestions": suggestions }))
        }
    }

    fn log_command(
        &mut self,
        command: &str,
        exit_code: i32,
        duration: Option<f64>,
        cwd: &str,
        session_id: Option<&str>,
    ) -> Result<Response> {
        if self.ctx.privacy.should_filter(command, cwd) {
            self.counters.commands_filtered += 1;
            debug!("Command withheld by privacy filter");
            return Ok(Response::filtered("privacy"));
        }

        let session_id = session_id.unwrap_or(&self.session_id);
        let user = current_user();
        let entry = NewCommand {
            duration,
            shell: self.shell.as_deref(),
            user: user.as_deref(),
            hostname: Some(crate::MYHOSTNAME.as_str()),
            ..NewCommand::new(command, cwd, exit_code, session_id)
        };
        let store = &self.ctx.store;
        let command_id = store
            .insert_command(&entry)
            .context("Inserting into history database")?;
        self.counters.commands_logged += 1;

        if exit_code == 0 {
            store.update_pattern_statistics(cwd, command, true, duration)?;
            if let Some(previous) = store.previous_successful(session_id, command_id)? {
                if previous != command {
                    store.record_sequence(&format!("{} && {}", previous, command))?;
                }
            }
        }

        Ok(Response::ok(json!({ "command_id": command_id })))
    }

    fn search(
        &mut self,
        query: &str,
        limit: usize,
        format: SearchFormat,
        cwd: Option<&str>,
    ) -> Result<Response> {
        let records = self.ctx.store.search(query, limit, cwd)?;
        let results = match format {
            SearchFormat::Client => {
                json!(records.into_iter().map(|r| r.command).collect::<Vec<_>>())
            }
            SearchFormat::Dashboard => json!(records),
        };
        Ok(Response::ok(json!({ "results": results })))
    }

    fn status(&mut self) -> Response {
        let store = match self.ctx.store.get_statistics() {
            Ok(stats) => json!(stats),
            Err(err) => {
                warn!(error = %err, "Failed to collect store statistics");
                json!(null)
            }
        };
        let index_entries = self.ctx.index.snapshot().map(|s| s.len()).unwrap_or(0);
        Response::ok(json!({
            "state": self.state,
            "version": crate::GIT_VERSION,
            "pid": std::process::id(),
            "session_id": self.session_id,
            "uptime_seconds": self.started.elapsed().as_secs_f64(),
            "requests_handled": self.counters.requests_handled,
            "commands_logged": self.counters.commands_logged,
            "commands_filtered": self.counters.commands_filtered,
            "suggestions_generated": self.counters.suggestions_generated,
            "errors": self.counters.errors,
            "suggestions_enabled": self.ctx.engine.is_some(),
            "index_built": self.ctx.index.is_built(),
            "index_entries": index_entries,
            "store": store,
            "resources": self.monitor.sample(),
        }))
    }

    /// Re-encode recent successful commands into a new index snapshot, swap
    /// it in and persist it.
    pub fn retrain(&self) -> RetrainOutcome {
        match self.try_retrain() {
            Ok(outcome) => outcome,
            Err(err) => {
                let message = format!("{:#}", err);
                error!(error = %message, "Retraining failed");
                RetrainOutcome::Failed(message)
            }
        }
    }

    fn try_retrain(&self) -> Result<RetrainOutcome> {
        let ctx = &self.ctx;
        let recent = ctx
            .store
            .get_recent_commands(ctx.config.daemon.retrain_sample, true)?;
        if recent.len() < MIN_RETRAIN_COMMANDS {
            info!(
                available = recent.len(),
                required = MIN_RETRAIN_COMMANDS,
                "Too few successful commands; skipping retrain"
            );
            return Ok(RetrainOutcome::Skipped {
                available: recent.len(),
            });
        }

        let corpus: Vec<String> = recent.iter().map(|r| r.command.clone()).collect();
        ctx.embedder.retrain(&corpus)?;

        // newest first, so the first sighting carries last_used
        let mut order = Vec::new();
        let mut seen: HashMap<&str, EntryMetadata> = HashMap::new();
        for record in &recent {
            seen.entry(record.command.as_str())
                .and_modify(|m| m.frequency += 1)
                .or_insert_with(|| {
                    order.push(record.command.as_str());
                    EntryMetadata {
                        frequency: 1,
                        last_used: record.timestamp,
                    }
                });
        }

        let mut entries = Vec::with_capacity(order.len());
        for command in order {
            match ctx.embedder.encode(command) {
                Ok(vector) => entries.push(IndexEntry {
                    command: command.to_string(),
                    vector,
                    metadata: seen.remove(command).unwrap_or_default(),
                }),
                Err(err) => debug!(command, error = %err, "Skipping command that failed to encode"),
            }
        }
        for entry in entries {
            ctx.index.stage(entry)?;
        }
        let snapshot = ctx.index.rebuild(ctx.embedder.dimensions(), epoch_now())?;
        snapshot
            .save(&ctx.config.daemon.index_path)
            .with_context(|| {
                format!(
                    "Writing index snapshot {}",
                    ctx.config.daemon.index_path.display()
                )
            })?;

        info!(
            commands = recent.len(),
            entries = snapshot.len(),
            "Rebuilt similarity index"
        );
        Ok(RetrainOutcome::Rebuilt {
            commands: recent.len(),
            entries: snapshot.len(),
        })
    }

    /// Every step runs even if an earlier one failed.
    pub fn shutdown(&mut self) -> RetrainOutcome {
        self.state = DaemonState::ShuttingDown;
        info!("Daemon shutting down");

        let socket_path = &self.ctx.config.daemon.socket_path;
        if socket_path.exists() {
            if let Err(err) = std::fs::remove_file(socket_path) {
                warn!(error = %err, path = %socket_path.display(), "Failed to remove socket");
            }
        }

        let outcome = self.retrain();

        if let Err(err) = self.ctx.store.end_session(&self.session_id) {
            warn!(error = %err, session = %self.session_id, "Failed to close session");
        }

        let pid_path = &self.ctx.config.daemon.pid_path;
        if pid_path.exists() {
            if let Err(err) = std::fs::remove_file(pid_path) {
                warn!(error = %err, path = %pid_path.display(), "Failed to remove PID marker");
            }
        }

        info!(
            uptime_seconds = self.started.elapsed().as_secs(),
            requests = self.counters.requests_handled,
            logged = self.counters.commands_logged,
            filtered = self.counters.commands_filtered,
            suggestions = self.counters.suggestions_generated,
            errors = self.counters.errors,
            "Daemon stopped"
        );
        self.state = DaemonState::Stopped;
        outcome
    }

    /// Bind the socket, write the PID marker and serve until a signal or a
    /// shutdown request arrives.
    pub async fn run(mut self) -> Result<()> {
        // handlers first: nothing is left on disk if either step fails
        let started = install_signal_handlers()
            .and_then(|signals| Ok((signals, self.bind()?)));
        let ((mut sigterm, mut sigint), listener) = match started {
            Ok(started) => started,
            Err(err) => {
                if let Err(close_err) = self.ctx.store.end_session(&self.session_id) {
                    warn!(error = %close_err, "Failed to close session after failed start");
                }
                return Err(err);
            }
        };

        self.state = DaemonState::Running;
        info!(
            socket = %self.ctx.config.daemon.socket_path.display(),
            db = %self.ctx.config.database.path.display(),
            session = %self.session_id,
            pid = std::process::id(),
            "Suggestion daemon running"
        );

        let accept_timeout = Duration::from_millis(self.ctx.config.daemon.accept_timeout_ms.max(10));
        while !self.stop_requested {
            tokio::select! {
                accepted = tokio::time::timeout(accept_timeout, listener.accept()) => match accepted {
                    // timing out is how the loop gets to re-check the stop flag
                    Err(_) => self.monitor.log_if_due(),
                    Ok(Ok((stream, _))) => self.serve(stream).await,
                    Ok(Err(err)) => warn!(error = %err, "Failed to accept connection"),
                },
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    self.stop_requested = true;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    self.stop_requested = true;
                }
            }
        }

        drop(listener);
        self.shutdown();
        Ok(())
    }

    fn bind(&self) -> Result<UnixListener> {
        let daemon = &self.ctx.config.daemon;
        prepare_socket(&daemon.socket_path)?;
        let listener = UnixListener::bind(&daemon.socket_path)
            .with_context(|| format!("Binding daemon socket {}", daemon.socket_path.display()))?;
        if let Err(err) = write_pid_marker(&daemon.pid_path) {
            let _ = std::fs::remove_file(&daemon.socket_path);
            return Err(err);
        }
        Ok(listener)
    }

    async fn serve(&mut self, mut stream: UnixStream) {
        let response = match tokio::time::timeout(READ_TIMEOUT, read_request(&mut stream)).await {
            Ok(Ok(request)) => {
                debug!(action = request.action(), "Daemon request received");
                self.handle_request(request)
            }
            Ok(Err(err)) => {
                self.counters.errors += 1;
                warn!(error = %err, "Rejected request");
                Response::error(err.to_string())
            }
            Err(_) => {
                self.counters.errors += 1;
                Response::error(ProtocolError::Timeout.to_string())
            }
        };

        match encode_line(&response) {
            Ok(bytes) => {
                if let Err(err) = stream.write_all(&bytes).await {
                    debug!(error = %err, "Client went away before the response");
                }
            }
            Err(err) => error!(error = %err, "Failed to serialize response"),
        }
    }
}

fn install_signal_handlers() -> Result<(Signal, Signal)> {
    let sigterm = signal(SignalKind::terminate()).context("Installing SIGTERM handler")?;
    let sigint = signal(SignalKind::interrupt()).context("Installing SIGINT handler")?;
    Ok((sigterm, sigint))
}

async fn read_request(stream: &mut UnixStream) -> Result<Request, ProtocolError> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if buffer.len() > MAX_REQUEST_BYTES {
            return Err(ProtocolError::TooLarge);
        }
        if chunk[..n].contains(&b'\n') {
            break;
        }
    }

    if buffer.is_empty() {
        return Err(ProtocolError::Empty);
    }
    decode_request(&buffer)
}

fn prepare_socket(socket_path: &Path) -> Result<()> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Creating socket directory {}", parent.display()))?;
    }
    if socket_path.exists() {
        if std::os::unix::net::UnixStream::connect(socket_path).is_ok() {
            anyhow::bail!(
                "Another daemon is already listening on {}",
                socket_path.display()
            );
        }
        std::fs::remove_file(socket_path)
            .with_context(|| format!("Removing stale socket {}", socket_path.display()))?;
    }
    Ok(())
}

fn write_pid_marker(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{}\n", std::process::id()))
        .with_context(|| format!("Writing PID marker {}", path.display()))
}
