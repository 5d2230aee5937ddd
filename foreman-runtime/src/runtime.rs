//! Coordinator runtime: one process owning the store, sink, authority, and
//! pool actors, plus the socket services workers talk to.
//!
//! Startup order follows the ownership rules: the store and sink come up
//! first, the authority opens them, the pool only ever talks to the
//! authority. Every task gets a shutdown receiver and re-broadcasts
//! shutdown when it exits, so the first failure (or a `stop` command, or
//! ctrl-c) winds the whole coordinator down.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, watch};

use foreman_authority::{
    AuthorityConfig, AuthorityHandle, LocalSpawner, SpawnTemplate, WorkerAuthority,
};
use foreman_core::settings::Settings;
use foreman_core::types::{ConfigVersion, EntryPoint};
use foreman_pool::{PoolConfig, PoolHandle, PoolManager};
use foreman_sink::{JsonLinesExporter, LogSink, SinkConfig};
use foreman_store::{
    watch_config_file, ConfigBackend, ConfigStore, FileBackend, StoreError, StoreHandle,
    SubscriptionFilter,
};
use foreman_transport::Endpoint;

use crate::control::{ControlRequest, ControlResponse};
use crate::error::{io_err, RuntimeError};
use crate::gateway::{gateway_task, serve_task_connection, CompletionReport, GatewayMsg};
use crate::paths;

/// What the coordinator runs with.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Runtime root directory (sockets, logs, persisted config).
    pub root: PathBuf,
    pub settings: Settings,
    /// What spawned workers execute.
    pub entry_point: EntryPoint,
    /// Persist the config store to `<root>/config.json`.
    pub persist_config: bool,
    /// Fold external edits of the config document back into the store.
    pub watch_config: bool,
}

impl RuntimeOptions {
    /// Options with settings loaded from `<root>/config.yaml`.
    pub fn load(root: PathBuf, entry_point: EntryPoint) -> Result<RuntimeOptions, RuntimeError> {
        let settings = Settings::load_at(&paths::settings_path(&root))?;
        Ok(RuntimeOptions {
            root,
            settings,
            entry_point,
            persist_config: true,
            watch_config: true,
        })
    }
}

/// Start the coordinator runtime and block the current thread until it
/// exits.
pub fn start_blocking(options: RuntimeOptions) -> Result<(), RuntimeError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(options))
}

/// Run the coordinator runtime.
pub async fn run(options: RuntimeOptions) -> Result<(), RuntimeError> {
    ensure_runtime_dirs(&options.root)?;
    let root = options.root.clone();
    let settings = options.settings.clone();
    let started_at_unix = unix_seconds_now();

    // Config store, restored from disk when persistence is on.
    let backend: Option<Box<dyn ConfigBackend + Send>> = if options.persist_config {
        Some(Box::new(FileBackend::new(paths::config_document_path(
            &root,
        ))))
    } else {
        None
    };
    let (store, _store_actor) =
        ConfigStore::spawn(settings.config.subscriber_queue_limit, backend)?;

    // Version feed: the pool pins new workers at whatever this carries.
    let initial_version = store.snapshot().await?.version;
    let (version_tx, version_rx) = watch::channel(initial_version);
    let control_version_rx = version_rx.clone();

    // Log sink and its file exporter.
    let (sink, drain, _sink_actor) = LogSink::spawn(SinkConfig::from(&settings.log));
    let sink = Arc::new(sink);

    // The authority opens the store and holds the template environment.
    let template = SpawnTemplate {
        base_env: Vec::new(),
        cwd: None,
        store_socket: Some(paths::store_socket_path(&root)),
        sink_socket: Some(paths::sink_socket_path(&root)),
        tasks_socket: Some(paths::tasks_socket_path(&root)),
        snapshot_dir: Some(paths::run_dir(&root)),
    };
    let (authority, _authority_actor) = WorkerAuthority::spawn(
        AuthorityConfig::from(&settings.worker),
        template,
        Arc::new(LocalSpawner),
        Some(store.clone()),
    );

    // The pool holds only a request handle on the authority.
    let (pool, assignments_rx, _pool_actor) = PoolManager::spawn(
        PoolConfig::from_settings(&settings.pool, &settings.worker, options.entry_point.clone()),
        authority.clone(),
        version_rx,
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    let (gateway_tx, gateway_rx) = mpsc::channel::<GatewayMsg>(64);
    let (completions_tx, completions_rx) = mpsc::channel::<CompletionReport>(64);

    let version_handle = {
        let shutdown = shutdown_tx.clone();
        let store = store.clone();
        tokio::spawn(async move {
            let result = version_feed_task(store, version_tx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let store = store.clone();
        let document = paths::config_document_path(&root);
        let enabled = options.watch_config;
        tokio::spawn(async move {
            let result = if enabled {
                watch_config_file(document, store, shutdown.subscribe())
                    .await
                    .map_err(RuntimeError::from)
            } else {
                wait_for_shutdown(shutdown.subscribe()).await
            };
            let _ = shutdown.send(());
            result
        })
    };

    let gateway_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let result = gateway_task(assignments_rx, gateway_rx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let completions_handle = {
        let shutdown = shutdown_tx.clone();
        let pool = pool.clone();
        tokio::spawn(async move {
            let result = completions_task(completions_rx, pool, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let store_server_handle = {
        let shutdown = shutdown_tx.clone();
        let store = store.clone();
        let socket = paths::store_socket_path(&root);
        tokio::spawn(async move {
            let result = store_server_task(socket, store, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let sink_server_handle = {
        let shutdown = shutdown_tx.clone();
        let sink = sink.clone();
        let socket = paths::sink_socket_path(&root);
        tokio::spawn(async move {
            let result = sink_server_task(socket, sink, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let tasks_server_handle = {
        let shutdown = shutdown_tx.clone();
        let gateway_tx = gateway_tx.clone();
        let completions_tx = completions_tx.clone();
        let socket = paths::tasks_socket_path(&root);
        tokio::spawn(async move {
            let result =
                tasks_server_task(socket, gateway_tx, completions_tx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let exporter_handle = {
        let shutdown = shutdown_tx.clone();
        let log_path = paths::log_file_path(&root);
        tokio::spawn(async move {
            let exporter = JsonLinesExporter::new(log_path);
            let mut shutdown_rx = shutdown.subscribe();
            let result = tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                result = exporter.run(drain) => result.map(|written| {
                    tracing::info!(written, "log export finished");
                }).map_err(RuntimeError::from),
            };
            let _ = shutdown.send(());
            result
        })
    };

    let control_handle = {
        let shutdown = shutdown_tx.clone();
        let socket = paths::control_socket_path(&root);
        let pool = pool.clone();
        let authority = authority.clone();
        let sink = sink.clone();
        tokio::spawn(async move {
            let result = control_server_task(
                socket,
                pool,
                authority,
                sink,
                control_version_rx,
                shutdown.clone(),
                started_at_unix,
            )
            .await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down coordinator");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(RuntimeError::Protocol(format!(
                            "ctrl-c handler failed: {err}"
                        ))),
                    }
                }
            }
        })
    };

    let (
        version_result,
        watcher_result,
        gateway_result,
        completions_result,
        store_server_result,
        sink_server_result,
        tasks_server_result,
        exporter_result,
        control_result,
        signal_result,
    ) = tokio::join!(
        version_handle,
        watcher_handle,
        gateway_handle,
        completions_handle,
        store_server_handle,
        sink_server_handle,
        tasks_server_handle,
        exporter_handle,
        control_handle,
        signal_handle,
    );

    handle_join("version_feed", version_result)?;
    handle_join("config_watcher", watcher_result)?;
    handle_join("task_gateway", gateway_result)?;
    handle_join("completions", completions_result)?;
    handle_join("store_server", store_server_result)?;
    handle_join("sink_server", sink_server_result)?;
    handle_join("tasks_server", tasks_server_result)?;
    handle_join("log_exporter", exporter_result)?;
    handle_join("control_server", control_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

/// Mirror committed store versions into the pool's watch channel.
async fn version_feed_task(
    store: StoreHandle,
    version_tx: watch::Sender<ConfigVersion>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), RuntimeError> {
    let mut subscription = store.subscribe(SubscriptionFilter::All).await?;
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = subscription.next() => {
                match event {
                    Ok(Some(change)) => {
                        let _ = version_tx.send(change.version);
                    }
                    Ok(None) => break,
                    Err(StoreError::SubscriberOverflow) => {
                        // Versions only matter at their latest value, so an
                        // overflow just means resync and resubscribe.
                        let snapshot = store.snapshot().await?;
                        let _ = version_tx.send(snapshot.version);
                        subscription = store.subscribe(SubscriptionFilter::All).await?;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
    }
    Ok(())
}

/// Relay worker completion reports to the pool.
async fn completions_task(
    mut completions_rx: mpsc::Receiver<CompletionReport>,
    pool: PoolHandle,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), RuntimeError> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            report = completions_rx.recv() => {
                let Some(CompletionReport { worker, task }) = report else { break };
                // A completion can race a crash report; the pool already
                // forgot the worker then, which is not fatal.
                if let Err(err) = pool.complete(worker, task.clone()).await {
                    tracing::warn!(worker = %worker, task = %task, error = %err, "completion not recorded");
                }
            }
        }
    }
    Ok(())
}

async fn store_server_task(
    socket: PathBuf,
    store: StoreHandle,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), RuntimeError> {
    let listener = bind_socket(&socket)?;
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let store = store.clone();
                tokio::spawn(async move {
                    if let Err(err) =
                        foreman_store::serve_connection(Endpoint::from_unix(stream), store).await
                    {
                        tracing::error!(error = %err, "store client error");
                    }
                });
            }
        }
    }
    remove_socket(&socket);
    Ok(())
}

async fn sink_server_task(
    socket: PathBuf,
    sink: Arc<LogSink>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), RuntimeError> {
    let listener = bind_socket(&socket)?;
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let producer = sink.producer();
                tokio::spawn(async move {
                    if let Err(err) =
                        foreman_sink::serve_connection(Endpoint::from_unix(stream), producer).await
                    {
                        tracing::error!(error = %err, "sink client error");
                    }
                });
            }
        }
    }
    remove_socket(&socket);
    Ok(())
}

async fn tasks_server_task(
    socket: PathBuf,
    gateway_tx: mpsc::Sender<GatewayMsg>,
    completions_tx: mpsc::Sender<CompletionReport>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), RuntimeError> {
    let listener = bind_socket(&socket)?;
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let gateway_tx = gateway_tx.clone();
                let completions_tx = completions_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_task_connection(
                        Endpoint::from_unix(stream),
                        gateway_tx,
                        completions_tx,
                    )
                    .await
                    {
                        tracing::error!(error = %err, "task client error");
                    }
                });
            }
        }
    }
    remove_socket(&socket);
    Ok(())
}

async fn control_server_task(
    socket: PathBuf,
    pool: PoolHandle,
    authority: AuthorityHandle,
    sink: Arc<LogSink>,
    version_rx: watch::Receiver<ConfigVersion>,
    shutdown_tx: broadcast::Sender<()>,
    started_at_unix: u64,
) -> Result<(), RuntimeError> {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let listener = bind_socket(&socket)?;
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let pool = pool.clone();
                let authority = authority.clone();
                let sink = sink.clone();
                let version_rx = version_rx.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_control_client(
                        stream,
                        pool,
                        authority,
                        sink,
                        version_rx,
                        shutdown_tx,
                        started_at_unix,
                    )
                    .await
                    {
                        tracing::error!(error = %err, "control client error");
                    }
                });
            }
        }
    }
    remove_socket(&socket);
    Ok(())
}

async fn handle_control_client(
    stream: UnixStream,
    pool: PoolHandle,
    authority: AuthorityHandle,
    sink: Arc<LogSink>,
    version_rx: watch::Receiver<ConfigVersion>,
    shutdown_tx: broadcast::Sender<()>,
    started_at_unix: u64,
) -> Result<(), RuntimeError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("control socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: Result<ControlRequest, _> = serde_json::from_str(&line);
        let request = match request {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &ControlResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = match request.cmd.as_str() {
            "status" => {
                match build_status_payload(&pool, &authority, &sink, &version_rx, started_at_unix)
                    .await
                {
                    Ok(payload) => ControlResponse::ok(payload),
                    Err(err) => ControlResponse::error(err.to_string()),
                }
            }
            "dispatch" => match request.task {
                Some(task) => match pool.dispatch(task).await {
                    Ok(foreman_pool::DispatchOutcome::Assigned(worker)) => {
                        ControlResponse::ok(json!({ "outcome": "assigned", "worker": worker }))
                    }
                    Ok(foreman_pool::DispatchOutcome::Queued) => {
                        ControlResponse::ok(json!({ "outcome": "queued" }))
                    }
                    Err(err) => ControlResponse::error(err.to_string()),
                },
                None => ControlResponse::error("dispatch requires a task"),
            },
            "stop" => {
                let _ = shutdown_tx.send(());
                ControlResponse::ok(json!({ "stopping": true }))
            }
            other => ControlResponse::error(format!("unknown command '{other}'")),
        };

        write_response(&mut writer, &response).await?;
        if request.cmd == "stop" {
            break;
        }
    }

    Ok(())
}

async fn build_status_payload(
    pool: &PoolHandle,
    authority: &AuthorityHandle,
    sink: &LogSink,
    version_rx: &watch::Receiver<ConfigVersion>,
    started_at_unix: u64,
) -> Result<serde_json::Value, RuntimeError> {
    let health = pool.health().await?;
    let workers = authority.list().await?;

    Ok(json!({
        "running": true,
        "started_at_unix": started_at_unix,
        "config_version": version_rx.borrow().0,
        "log_records_accepted": sink.accepted(),
        "pool": health,
        "workers": workers,
    }))
}

async fn wait_for_shutdown(mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), RuntimeError> {
    let _ = shutdown_rx.recv().await;
    Ok(())
}

/// Bind a Unix socket, clearing a stale file from a previous run first.
fn bind_socket(socket: &Path) -> Result<UnixListener, RuntimeError> {
    prepare_socket_for_bind(socket)?;
    let listener = UnixListener::bind(socket).map_err(|e| io_err(socket, e))?;
    set_socket_permissions(socket)?;
    Ok(listener)
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), RuntimeError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(RuntimeError::Protocol(format!(
                "socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn remove_socket(socket: &Path) {
    if socket.exists() {
        let _ = fs::remove_file(socket);
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &ControlResponse,
) -> Result<(), RuntimeError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("control socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("control socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("control socket flush", e))?;
    Ok(())
}

fn ensure_runtime_dirs(root: &Path) -> Result<(), RuntimeError> {
    for dir in [root.to_path_buf(), paths::run_dir(root), paths::logs_dir(root)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), RuntimeError>, tokio::task::JoinError>,
) -> Result<(), RuntimeError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(RuntimeError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), RuntimeError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), RuntimeError> {
    Ok(())
}
