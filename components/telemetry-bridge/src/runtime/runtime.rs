// Local crates
use crate::{
    broadcaster::broadcaster::Broadcaster,
    decoder::{decoder::FrameDecoder, pump::run_pump},
    helpers::{
        load_config::Config,
        shutdown::{Shutdown, ShutdownReason},
    },
    instrumentation::tracing::init_tracing,
    metrics::http::start_metrics_server,
    runtime::coordinator::{BridgeState, ShutdownCoordinator, TeardownPlan, TeardownReport},
    server::{control::serve_control, data::serve_data},
    source::source::{self, NotificationSource, SourceError},
};

// External crates
use anyhow::{Context, Result, bail};
use bytes::Bytes;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::{
    net::TcpListener,
    signal,
    sync::{mpsc, watch},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, instrument};

/// A bridge with both listeners bound, ready to run.
///
/// Binding is separate from running so callers can learn the actual
/// addresses (e.g. when configured with port 0) before traffic flows.
#[derive(Debug)]
pub struct Bridge {
    config: Config,
    data_listener: TcpListener,
    control_listener: TcpListener,
    data_addr: SocketAddr,
    control_addr: SocketAddr,
    broadcaster: Arc<Broadcaster>,
    shutdown: Shutdown,
    coordinator: ShutdownCoordinator,
}

impl Bridge {
    /// Bind the data and control ports from `config`.
    #[instrument(name = "bridge_runtime::bind", target = "runtime", skip_all, level = "debug")]
    pub async fn bind(config: Config) -> Result<Self> {
        let data_listener = TcpListener::bind(&config.data.bind_addr)
            .await
            .with_context(|| format!("Failed to bind data port {}", config.data.bind_addr))?;
        let control_listener = TcpListener::bind(&config.control.bind_addr)
            .await
            .with_context(|| format!("Failed to bind control port {}", config.control.bind_addr))?;

        let data_addr = data_listener.local_addr()?;
        let control_addr = control_listener.local_addr()?;

        Ok(Self {
            config,
            data_listener,
            control_listener,
            data_addr,
            control_addr,
            broadcaster: Arc::new(Broadcaster::new()),
            shutdown: Shutdown::new(),
            coordinator: ShutdownCoordinator::new(),
        })
    }

    /// Address consumers connect to for payloads.
    pub fn data_addr(&self) -> SocketAddr {
        self.data_addr
    }

    /// Address of the control port.
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    /// Handle to the global shutdown latch.
    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Shared fan-out set of connected consumers.
    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        self.broadcaster.clone()
    }

    /// Observe `Running -> ShuttingDown -> Stopped`.
    pub fn state(&self) -> watch::Receiver<BridgeState> {
        self.coordinator.subscribe()
    }

    /// Serve until the shutdown latch fires, then tear everything down.
    ///
    /// Both listeners are up before `source` is polled, so consumers can
    /// connect and shutdown can be requested while the upstream is still
    /// being located. Opening the source and subscribing to it both race the
    /// shutdown latch. If the source cannot be opened, or cannot start
    /// notifications, the bridge stays up in degraded mode with no payloads
    /// until shutdown.
    #[instrument(name = "bridge_runtime::run", target = "runtime", skip_all, level = "debug")]
    pub async fn run<F>(self, source: F) -> Result<TeardownReport>
    where
        F: Future<Output = Result<Box<dyn NotificationSource>, SourceError>> + Send,
    {
        let Self {
            config,
            data_listener,
            control_listener,
            broadcaster,
            shutdown,
            coordinator,
            ..
        } = self;

        let tracker = TaskTracker::new();
        let listeners_cancel = CancellationToken::new();

        let listeners = vec![
            tokio::spawn(serve_data(
                data_listener,
                broadcaster.clone(),
                config.data.sink_queue_capacity,
                tracker.clone(),
                listeners_cancel.clone(),
            )),
            tokio::spawn(serve_control(
                control_listener,
                shutdown.clone(),
                config.control.read_timeout(),
                tracker.clone(),
                listeners_cancel.clone(),
            )),
        ];

        let opened = tokio::select! {
            opened = source => Some(opened),
            _ = shutdown.wait_for_shutdown() => {
                info!("Shutdown requested while opening upstream source");
                None
            }
        };

        let pump_cancel = CancellationToken::new();
        let (source, pump) = match opened {
            Some(Ok(mut source)) => match Self::start_notify(source.as_mut(), &shutdown).await {
                None => {
                    info!(
                        upstream = %source.describe(),
                        "Shutdown requested while subscribing to upstream"
                    );
                    (Some(source), None)
                }
                Some(Ok(chunks)) => {
                    info!(upstream = %source.describe(), "Listening for notifications");
                    let pump = tokio::spawn(run_pump(
                        chunks,
                        FrameDecoder::new(),
                        broadcaster.clone(),
                        pump_cancel.clone(),
                    ));
                    (Some(source), Some(pump))
                }
                Some(Err(e)) => {
                    tracing::warn!(
                        upstream = %source.describe(),
                        error = %e,
                        "Failed to start notifications, waiting for shutdown command"
                    );
                    (Some(source), None)
                }
            },
            Some(Err(e)) => {
                tracing::warn!(error = %e, "No upstream source, waiting for shutdown command");
                (None, None)
            }
            None => (None, None),
        };

        shutdown.wait_for_shutdown().await;
        info!(reason = ?shutdown.reason(), "Leaving running state");

        let plan = TeardownPlan {
            source,
            pump,
            pump_cancel,
            listeners_cancel,
            listeners,
            broadcaster,
            tracker,
            disconnect_timeout: config.source.disconnect_timeout(),
            drain_timeout: config.shutdown.drain_timeout(),
        };

        match coordinator.teardown(plan).await {
            Some(report) => Ok(report),
            None => bail!("Bridge teardown already performed"),
        }
    }

    /// Subscribe to upstream notifications unless shutdown fires first.
    /// `None` means the subscription was abandoned.
    async fn start_notify(
        source: &mut dyn NotificationSource,
        shutdown: &Shutdown,
    ) -> Option<Result<mpsc::Receiver<Bytes>, SourceError>> {
        tokio::select! {
            started = source.start_notify() => Some(started),
            _ = shutdown.wait_for_shutdown() => None,
        }
    }
}

/// Bridge runtime initialization and setup.
pub async fn run_bridge(config_path: PathBuf) -> Result<()> {
    // Load bridge configuration
    let cfg = Config::load(&config_path)?;

    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = init_tracing(&cfg.logging)?;
    info!(config = %config_path.display(), "Starting telemetry bridge");

    let metrics_cancel = CancellationToken::new();
    if cfg.metrics.enabled {
        let addr = cfg.metrics.bind_addr.clone();
        let cancel = metrics_cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(&addr, cancel).await {
                tracing::error!(error = %e, "Metrics server failed");
            }
        });
    }

    let source_cfg = cfg.source.clone();
    let bridge = Bridge::bind(cfg).await?;

    let shutdown = bridge.shutdown();
    tokio::spawn(async move {
        tokio::select! {
            result = wait_for_signal() => match result {
                Ok(()) => {
                    info!("Termination signal received");
                    shutdown.trigger(ShutdownReason::Signal);
                }
                Err(e) => tracing::error!(error = %e, "Failed to listen for termination signals"),
            },
            _ = shutdown.wait_for_shutdown() => {}
        }
    });

    let report = bridge
        .run(async move { source::connect(&source_cfg).await })
        .await?;
    metrics_cancel.cancel();

    if let Some(stats) = report.decode_stats {
        info!(
            frames_decoded = stats.frames_decoded,
            checksum_errors = stats.checksum_errors,
            "Final decode statistics"
        );
    }
    if !report.is_clean() {
        tracing::warn!(?report, "Teardown finished with errors");
    }
    info!("Telemetry bridge stopped");
    Ok(())
}

/// Resolve on Ctrl-C, or SIGTERM on unix.
async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await
    }
}
