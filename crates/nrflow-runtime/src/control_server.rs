//! Control socket.
//!
//! A Unix-domain socket served by a tokio task in the parent. Each line on a
//! connection is one JSON `ControlRequest`; each reply is one JSON
//! `ControlResponse` line. The worker pool is not `Sync`, so requests are
//! forwarded over a `crossbeam-channel` to whichever thread owns it, which
//! answers them with `dispatch_pending`.

use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use nrflow_core::control::Command;
use nrflow_core::stats::StatsSnapshot;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::worker_pool::{BroadcastOutcome, WorkerPool};

/// How long a connection waits for the pool owner to answer
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// A control command for one worker or all of them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    /// Command to send
    pub command: Command,
    /// Target worker, `None` for every worker
    #[serde(default)]
    pub worker: Option<u32>,
}

/// Reply to a `ControlRequest`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    /// Every addressed worker acknowledged
    pub ok: bool,
    /// Workers that acknowledged
    #[serde(default)]
    pub acked: Vec<u32>,
    /// Workers that did not
    #[serde(default)]
    pub missing: Vec<u32>,
    /// Aggregated statistics (STATS_REQUEST only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<serde_json::Value>,
    /// Failure description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResponse {
    /// Response for a delivered command
    pub fn from_outcome(outcome: BroadcastOutcome) -> Self {
        Self {
            ok: outcome.all_acked(),
            acked: outcome.acked,
            missing: outcome.missing,
            ..Default::default()
        }
    }

    /// Response carrying a statistics snapshot
    pub fn with_stats(outcome: BroadcastOutcome, snapshot: &StatsSnapshot) -> Self {
        let stats = match serde_json::to_value(snapshot) {
            Ok(value) => Some(value),
            Err(e) => return Self::error(format!("cannot encode statistics: {e}")),
        };
        Self {
            ok: true,
            acked: outcome.acked,
            missing: outcome.missing,
            stats,
            error: None,
        }
    }

    /// Failed request
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

/// A request waiting for the pool owner, with its reply channel
#[derive(Debug)]
pub struct ControlEnvelope {
    /// The request
    pub request: ControlRequest,
    /// Where the response goes
    pub reply: Sender<ControlResponse>,
}

/// Answer every queued request against `pool`; returns how many were served
pub fn dispatch_pending(pool: &mut WorkerPool, requests: &Receiver<ControlEnvelope>) -> usize {
    let mut served = 0;
    while let Ok(envelope) = requests.try_recv() {
        debug!(
            "Control request {} for {:?}",
            envelope.request.command, envelope.request.worker
        );
        let response = pool.handle_request(&envelope.request);
        if envelope.reply.send(response).is_err() {
            debug!("Control client went away before the reply");
        }
        served += 1;
    }
    served
}

/// Running control socket
pub struct ControlServer {
    path: PathBuf,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ControlServer {
    /// Bind `path` and serve it on `runtime`
    ///
    /// A stale socket at `path` is replaced; any other file there is an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns the bind error.
    pub fn spawn(
        runtime: &Handle,
        path: impl Into<PathBuf>,
        requests: Sender<ControlEnvelope>,
    ) -> io::Result<Self> {
        let path = path.into();
        remove_stale_socket(&path)?;

        let _guard = runtime.enter();
        let listener = UnixListener::bind(&path)?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        runtime.spawn(serve(listener, requests, shutdown_rx));

        info!("Control socket listening on {}", path.display());
        Ok(Self {
            path,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Socket path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting connections and remove the socket file
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove {}: {}", self.path.display(), e);
                }
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => std::fs::remove_file(path),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

async fn serve(
    listener: UnixListener,
    requests: Sender<ControlEnvelope>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let requests = requests.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, requests).await {
                            debug!("Control connection ended: {}", e);
                        }
                    });
                }
                Err(e) => warn!("Control socket accept failed: {}", e),
            },
            _ = &mut shutdown_rx => {
                debug!("Control socket shutting down");
                break;
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, requests: Sender<ControlEnvelope>) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(request) => forward(&requests, request).await,
            Err(e) => ControlResponse::error(format!("invalid request: {e}")),
        };
        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        writer.write_all(&out).await?;
    }
    Ok(())
}

async fn forward(requests: &Sender<ControlEnvelope>, request: ControlRequest) -> ControlResponse {
    let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
    let envelope = ControlEnvelope {
        request,
        reply: reply_tx,
    };
    if requests.send(envelope).is_err() {
        return ControlResponse::error("worker pool is gone");
    }

    match tokio::task::spawn_blocking(move || reply_rx.recv_timeout(REPLY_TIMEOUT)).await {
        Ok(Ok(response)) => response,
        Ok(Err(_)) => ControlResponse::error("no reply from the worker pool"),
        Err(e) => ControlResponse::error(e.to_string()),
    }
}

/// Send one request to the control socket at `path`
///
/// # Errors
///
/// Returns connection, I/O or decoding errors.
pub async fn request(path: &Path, request: &ControlRequest) -> io::Result<ControlResponse> {
    let stream = UnixStream::connect(path).await?;
    let (reader, mut writer) = stream.into_split();

    let mut line = serde_json::to_vec(request)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.shutdown().await?;

    let mut lines = BufReader::new(reader).lines();
    match lines.next_line().await? {
        Some(reply) => Ok(serde_json::from_str(&reply)?),
        None => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "control socket closed without a reply",
        )),
    }
}
