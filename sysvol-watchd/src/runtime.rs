use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use sysvol_core::WatchConfig;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use crate::error::{io_err, DaemonError};
use crate::paths::{socket_path, sysvol_root};
use crate::protocol::{DaemonRequest, DaemonResponse};
use crate::watcher::WatcherHandle;

/// How to run the watch daemon.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    /// Base for the runtime directory holding the control socket.
    pub home: PathBuf,
    pub dirs: Vec<PathBuf>,
    /// Accepted `update-dirs` requests are saved here.
    pub config_path: Option<PathBuf>,
    pub grace: Duration,
}

/// Shared by every socket client.
#[derive(Clone)]
struct DaemonContext {
    options: DaemonOptions,
    watcher: WatcherHandle,
    shutdown_tx: broadcast::Sender<()>,
    started_at_unix: u64,
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(options: DaemonOptions) -> Result<(), DaemonError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(options))
}

/// Run the daemon until `stop` is requested or Ctrl-C is received.
///
/// Pending marker bumps are flushed before returning.
pub async fn run(options: DaemonOptions) -> Result<(), DaemonError> {
    let root = sysvol_root(&options.home);
    if !root.exists() {
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
    }

    let watcher = WatcherHandle::spawn(options.grace);
    watcher.start(options.dirs.clone()).await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    let context = DaemonContext {
        options,
        watcher: watcher.clone(),
        shutdown_tx: shutdown_tx.clone(),
        started_at_unix: unix_seconds_now(),
    };

    let socket_handle = {
        let context = context.clone();
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let result = socket_server_task(context, shutdown.subscribe()).await;
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
                            tracing::info!("received ctrl-c, shutting down watcher");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (socket_result, signal_result) = tokio::join!(socket_handle, signal_handle);

    let stopped = match watcher.stop().await {
        Ok(()) | Err(DaemonError::NotRunning) => Ok(()),
        Err(err) => Err(err),
    };
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    stopped
}

async fn socket_server_task(
    context: DaemonContext,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&context.options.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::debug!(socket = %socket.display(), "listening for control requests");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let context = context.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, context).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(stream: UnixStream, context: DaemonContext) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("watchd socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<DaemonRequest>(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let stopping = request.cmd == "stop";
        let response = dispatch(&context, request).await;
        write_response(&mut writer, &response).await?;
        if stopping {
            break;
        }
    }

    Ok(())
}

async fn dispatch(context: &DaemonContext, request: DaemonRequest) -> DaemonResponse {
    match request.cmd.as_str() {
        "status" => match build_status_payload(context).await {
            Ok(payload) => DaemonResponse::ok(payload),
            Err(err) => DaemonResponse::error(err.to_string()),
        },
        "dirs" => match context.watcher.dirs().await {
            Ok(dirs) => DaemonResponse::ok(json!({ "dirs": dirs })),
            Err(err) => DaemonResponse::error(err.to_string()),
        },
        "update-dirs" => {
            let Some(dirs) = request.dirs else {
                return DaemonResponse::error("update-dirs needs a \"dirs\" list");
            };
            match update_dirs(context, dirs).await {
                Ok(dirs) => DaemonResponse::ok(json!({ "dirs": dirs })),
                Err(err) => DaemonResponse::error(err.to_string()),
            }
        }
        "stop" => {
            let _ = context.shutdown_tx.send(());
            DaemonResponse::ok(json!({ "stopping": true }))
        }
        other => DaemonResponse::error(format!("unknown command '{other}'")),
    }
}

/// Restart the watcher on `dirs` and persist them when a config file is in
/// use.
async fn update_dirs(context: &DaemonContext, dirs: Vec<PathBuf>) -> Result<Vec<PathBuf>, DaemonError> {
    context.watcher.update_dirs(dirs.clone()).await?;
    if let Some(path) = &context.options.config_path {
        let mut config = WatchConfig::load(path);
        config.dirs = dirs.clone();
        config.save(path)?;
        tracing::info!(config = %path.display(), "saved watched directories");
    }
    Ok(dirs)
}

async fn build_status_payload(context: &DaemonContext) -> Result<Value, DaemonError> {
    let state = context.watcher.state().await?;
    let dirs = context.watcher.dirs().await?;
    Ok(json!({
        "running": true,
        "state": state,
        "dirs": dirs,
        "grace_ms": u64::try_from(context.options.grace.as_millis()).unwrap_or(u64::MAX),
        "started_at_unix": context.started_at_unix,
        "socket": socket_path(&context.options.home).display().to_string(),
        "config": context.options.config_path.as_ref().map(|p| p.display().to_string()),
    }))
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "watchd socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale watchd socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("watchd socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("watchd socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("watchd socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
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

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn context(home: &Path, dirs: Vec<PathBuf>, config_path: Option<PathBuf>) -> DaemonContext {
        let (shutdown_tx, _) = broadcast::channel(1);
        DaemonContext {
            options: DaemonOptions {
                home: home.to_path_buf(),
                dirs,
                config_path,
                grace: Duration::from_millis(50),
            },
            watcher: WatcherHandle::spawn(Duration::from_millis(50)),
            shutdown_tx,
            started_at_unix: 1_000_000,
        }
    }

    #[tokio::test]
    async fn status_reports_state_and_dirs() {
        let home = TempDir::new().expect("home");
        let watched = TempDir::new().expect("watched");
        let ctx = context(home.path(), vec![], None);
        ctx.watcher
            .start(vec![watched.path().to_path_buf()])
            .await
            .expect("start");

        let payload = build_status_payload(&ctx).await.expect("status");
        assert_eq!(payload["running"], json!(true));
        assert_eq!(payload["state"], json!("running"));
        assert_eq!(payload["grace_ms"], json!(50));
        assert_eq!(payload["dirs"], json!([watched.path()]));
        assert_eq!(payload["config"], Value::Null);

        ctx.watcher.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn accepted_update_is_saved_to_config() {
        let home = TempDir::new().expect("home");
        let first = TempDir::new().expect("first");
        let second = TempDir::new().expect("second");
        let config_path = home.path().join("watchd.yaml");
        WatchConfig {
            verbose: 2,
            dirs: vec![first.path().to_path_buf()],
        }
        .save(&config_path)
        .expect("seed config");

        let ctx = context(home.path(), vec![], Some(config_path.clone()));
        ctx.watcher
            .start(vec![first.path().to_path_buf()])
            .await
            .expect("start");

        let response = dispatch(
            &ctx,
            DaemonRequest {
                cmd: "update-dirs".into(),
                dirs: Some(vec![second.path().to_path_buf()]),
            },
        )
        .await;
        assert!(response.ok, "got: {response:?}");

        let saved = WatchConfig::load(&config_path);
        assert_eq!(saved.dirs, vec![second.path().to_path_buf()]);
        assert_eq!(saved.verbose, 2, "other settings survive");

        ctx.watcher.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn rejected_update_leaves_config_alone() {
        let home = TempDir::new().expect("home");
        let first = TempDir::new().expect("first");
        let config_path = home.path().join("watchd.yaml");

        let ctx = context(home.path(), vec![], Some(config_path.clone()));
        ctx.watcher
            .start(vec![first.path().to_path_buf()])
            .await
            .expect("start");

        let response = dispatch(
            &ctx,
            DaemonRequest {
                cmd: "update-dirs".into(),
                dirs: Some(vec![home.path().join("missing")]),
            },
        )
        .await;
        assert!(!response.ok);
        assert!(response.error.unwrap_or_default().contains("missing"));
        assert!(!config_path.exists());
        assert_eq!(ctx.watcher.dirs().await.expect("dirs"), vec![first.path().to_path_buf()]);

        ctx.watcher.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn unknown_command_is_reported() {
        let home = TempDir::new().expect("home");
        let ctx = context(home.path(), vec![], None);
        let response = dispatch(&ctx, DaemonRequest::command("sync")).await;
        assert!(!response.ok);
        assert_eq!(response.error.as_deref(), Some("unknown command 'sync'"));
    }
}
