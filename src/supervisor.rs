//! Process lifecycle: capture thread, viewer listener and the shutdown sequence.

use log::{debug, error, info, warn};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;

use crate::broadcast::{BroadcastHub, HubStats};
use crate::capture::{run_capture_loop, CaptureError, CaptureSnapshot, CaptureStats, FrameSource};
use crate::config::{Config, ConfigError};
use crate::session::{CloseReason, SessionSummary, SubscriberSession};
use crate::utils::formatting::{format_count, format_duration};

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Cannot listen on {0}: {1}")]
    Bind(SocketAddr, std::io::Error),

    #[error("Cannot start capture thread: {0}")]
    Spawn(std::io::Error),

    #[error(transparent)]
    Capture(#[from] CaptureError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub sessions_closed: usize,
    pub sessions_aborted: usize,
    pub capture: CaptureSnapshot,
    pub hub: HubStats,
}

pub struct Supervisor {
    config: Config,
    listener: TcpListener,
    local_addr: SocketAddr,
    hub: Arc<BroadcastHub>,
}

impl Supervisor {
    pub async fn bind(config: Config) -> Result<Self, SupervisorError> {
        config.validate()?;
        let addr = config.socket_addr()?;
        let listener = TcpListener::bind(addr).await.map_err(|e| SupervisorError::Bind(addr, e))?;
        let local_addr = listener.local_addr().map_err(|e| SupervisorError::Bind(addr, e))?;

        Ok(Self {
            config,
            listener,
            local_addr,
            hub: Arc::new(BroadcastHub::new()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn hub(&self) -> Arc<BroadcastHub> {
        Arc::clone(&self.hub)
    }

    /// Runs until `shutdown` resolves or capture terminates, then tears
    /// everything down. Capture termination is returned as an error after the
    /// teardown has completed.
    pub async fn run<S, F>(self, source: S, shutdown: F) -> Result<ShutdownReport, SupervisorError>
    where
        S: FrameSource + 'static,
        F: Future<Output = ()>,
    {
        let Supervisor { config, listener, local_addr, hub } = self;
        let started = Instant::now();

        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(CaptureStats::default());
        let (capture_done_tx, mut capture_done) = oneshot::channel();
        let report_every = match config.capture.stats_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let capture_thread = {
            let (hub, stats, stop) = (Arc::clone(&hub), Arc::clone(&stats), Arc::clone(&stop));
            std::thread::Builder::new()
                .name("frame-source".to_string())
                .spawn(move || {
                    let result = run_capture_loop(source, &hub, &stats, &stop, report_every);
                    let _ = capture_done_tx.send(result);
                })
                .map_err(SupervisorError::Spawn)?
        };

        info!("Listening for viewers on ws://{}", local_addr);

        let handshake_timeout = Duration::from_millis(config.server.handshake_timeout_ms);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut sessions: JoinSet<SessionSummary> = JoinSet::new();
        let mut sessions_closed = 0;
        tokio::pin!(shutdown);

        let outcome: Result<(), CaptureError> = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                },
                result = &mut capture_done => {
                    break match result {
                        Ok(Ok(())) => Err(CaptureError::Terminated("capture loop exited".to_string())),
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(CaptureError::Terminated("capture thread exited unexpectedly".to_string())),
                    };
                },
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        let session = SubscriberSession::new(peer, Arc::clone(&hub), config.server.subscriber_buffer)
                            .with_handshake_timeout(handshake_timeout);
                        sessions.spawn(session.run(stream, shutdown_rx.clone()));
                    },
                    Err(e) => accept_failed(e).await,
                },
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if finished.is_ok() {
                        sessions_closed += 1;
                    }
                    log_session_end(finished);
                },
            }
        };

        if let Err(e) = &outcome {
            error!("{}", e);
        }

        // Stop accepting, stop capture, then release every session.
        drop(listener);
        stop.store(true, Ordering::Release);
        let _ = shutdown_tx.send(true);
        let unregistered = hub.unregister_all();
        debug!("Unregistered {} subscribers", unregistered);

        let (closed, sessions_aborted) =
            drain_sessions(&mut sessions, Duration::from_millis(config.server.shutdown_grace_ms)).await;
        sessions_closed += closed;

        match tokio::task::spawn_blocking(move || capture_thread.join()).await {
            Ok(Ok(())) => {},
            Ok(Err(_)) => error!("Capture thread panicked"),
            Err(e) => error!("Failed to join capture thread: {}", e),
        }

        let report = ShutdownReport {
            sessions_closed,
            sessions_aborted,
            capture: stats.snapshot(),
            hub: hub.stats(),
        };
        info!(
            "Stopped after {}: {}; {} deliveries, {} drops; {} sessions closed, {} aborted",
            format_duration(started.elapsed().as_secs()),
            report.capture.summary(),
            format_count(report.hub.deliveries),
            format_count(report.hub.drops),
            report.sessions_closed,
            report.sessions_aborted,
        );

        outcome?;
        Ok(report)
    }
}

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

// Persistent accept errors (EMFILE and friends) would otherwise spin the loop.
async fn accept_failed(e: std::io::Error) {
    warn!("Failed to accept viewer connection: {}", e);
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

fn log_session_end(finished: Result<SessionSummary, tokio::task::JoinError>) {
    match finished {
        Ok(summary) => {
            if let CloseReason::Failed(e) = &summary.reason {
                debug!("Session for {} ended with error: {}", summary.peer, e);
            }
        },
        Err(e) => warn!("Session task failed: {}", e),
    }
}

/// Waits up to `grace` for sessions to finish, aborting the rest.
/// Returns (closed, aborted).
async fn drain_sessions(sessions: &mut JoinSet<SessionSummary>, grace: Duration) -> (usize, usize) {
    let mut closed = 0;
    let mut aborted = 0;
    let deadline = tokio::time::sleep(grace);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            next = sessions.join_next() => match next {
                None => return (closed, aborted),
                Some(Ok(_)) => closed += 1,
                Some(Err(e)) => {
                    warn!("Session task failed during shutdown: {}", e);
                    aborted += 1;
                },
            },
            _ = &mut deadline => {
                warn!("{} sessions did not close within {:?}, aborting", sessions.len(), grace);
                sessions.abort_all();
                while let Some(next) = sessions.join_next().await {
                    match next {
                        Ok(_) => closed += 1,
                        Err(_) => aborted += 1,
                    }
                }
                return (closed, aborted);
            },
        }
    }
}
