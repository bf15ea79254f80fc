//! Lifecycle of the external streaming gateway.
//!
//! One long-lived task owns the child process. It spawns the gateway on the
//! current port, forwards its output to the log, and when the process exits
//! on its own it retries on the next port. Once the port passes the
//! configured ceiling the supervisor gives up for good. Readers only ever
//! touch atomics, so `available()` and `port()` never block.

use std::{
    process::{ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering},
        Arc,
    },
};

use metrics::{counter, gauge};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::Mutex,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::{ConfigError, GatewayOptions},
    error::LensError,
};

const GATEWAY_LOG_TARGET: &str = "beach_lens::gateway";

struct Shared {
    port: AtomicU16,
    running: AtomicBool,
    fatal: AtomicBool,
    restarts: AtomicU64,
    cancel: CancellationToken,
}

impl Shared {
    fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
        gauge!("beach_lens_gateway_available", if running { 1.0 } else { 0.0 });
    }
}

pub struct ProcessSupervisor {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

enum Attempt {
    Exited(std::io::Result<ExitStatus>),
    SpawnFailed(std::io::Error),
    Cancelled,
}

impl ProcessSupervisor {
    /// Validates `options` and starts supervising on a background task.
    /// Must be called from within a Tokio runtime.
    pub fn start(options: GatewayOptions) -> Result<Self, ConfigError> {
        options.validate()?;

        let shared = Arc::new(Shared {
            port: AtomicU16::new(options.base_port),
            running: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
            restarts: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        });
        let task = tokio::spawn(supervise(options, Arc::clone(&shared)));

        Ok(Self {
            shared,
            task: Mutex::new(Some(task)),
        })
    }

    /// True while a child is alive and supervision has not failed.
    pub fn available(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst) && !self.shared.fatal.load(Ordering::SeqCst)
    }

    /// Port of the current (or last) attempt.
    pub fn port(&self) -> u16 {
        self.shared.port.load(Ordering::SeqCst)
    }

    pub fn is_fatal(&self) -> bool {
        self.shared.fatal.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> u64 {
        self.shared.restarts.load(Ordering::SeqCst)
    }

    /// Stops supervision and terminates the child. Safe to call repeatedly.
    pub async fn stop(&self) {
        self.shared.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "gateway supervisor task ended abnormally");
            }
            info!("gateway supervisor stopped");
        }
        self.shared.set_running(false);
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

async fn supervise(options: GatewayOptions, shared: Arc<Shared>) {
    let mut port = options.base_port;

    while !shared.cancel.is_cancelled() {
        shared.port.store(port, Ordering::SeqCst);
        gauge!("beach_lens_gateway_port", f64::from(port));

        match run_once(&options, port, &shared).await {
            Attempt::Cancelled => break,
            Attempt::SpawnFailed(err) => {
                error!(
                    program = %options.program.display(),
                    error = %err,
                    outcome = %LensError::ProcessFatal,
                    "failed to launch gateway"
                );
                shared.fatal.store(true, Ordering::SeqCst);
                break;
            }
            Attempt::Exited(Ok(status)) => {
                warn!(port, status = %status, "gateway exited");
            }
            Attempt::Exited(Err(err)) => {
                warn!(port, error = %err, "failed to wait for gateway");
            }
        }

        if shared.cancel.is_cancelled() {
            break;
        }

        match port.checked_add(1).filter(|next| *next <= options.port_ceiling) {
            Some(next) => {
                port = next;
                shared.restarts.fetch_add(1, Ordering::SeqCst);
                counter!("beach_lens_gateway_restarts_total", 1);
            }
            None => {
                error!(
                    port,
                    ceiling = options.port_ceiling,
                    outcome = %LensError::ProcessFatal,
                    "gateway keeps exiting; giving up"
                );
                shared.fatal.store(true, Ordering::SeqCst);
                break;
            }
        }
    }

    shared.set_running(false);
}

async fn run_once(options: &GatewayOptions, port: u16, shared: &Shared) -> Attempt {
    let mut command = Command::new(&options.program);
    command
        .args(options.command_args(port))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => return Attempt::SpawnFailed(err),
    };
    shared.set_running(true);
    info!(pid = ?child.id(), port, "gateway started");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let drain = async {
        tokio::join!(drain_lines(stdout, "stdout"), drain_lines(stderr, "stderr"));
    };

    // End of output is treated as the process going away.
    tokio::select! {
        _ = drain => {}
        _ = shared.cancel.cancelled() => {
            terminate(&mut child).await;
            return Attempt::Cancelled;
        }
    }

    let status = tokio::select! {
        status = child.wait() => status,
        _ = shared.cancel.cancelled() => {
            terminate(&mut child).await;
            return Attempt::Cancelled;
        }
    };
    shared.set_running(false);
    Attempt::Exited(status)
}

async fn terminate(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        debug!(error = %err, "gateway already gone");
    }
    match child.wait().await {
        Ok(status) => info!(status = %status, "gateway terminated"),
        Err(err) => warn!(error = %err, "failed to reap gateway"),
    }
}

async fn drain_lines<R>(reader: Option<R>, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(target: GATEWAY_LOG_TARGET, stream, "{line}"),
            Ok(None) => break,
            Err(err) => {
                debug!(target: GATEWAY_LOG_TARGET, stream, error = %err, "output read failed");
                break;
            }
        }
    }
}
