//! Lifecycle state and ordered, best-effort teardown.
//!
//! ```text
//! Running --(shutdown latch fires)--> ShuttingDown --(teardown done)--> Stopped
//! ```
//!
//! Teardown runs these steps in order. Each one is bounded and independent:
//! a failure or timeout is logged and recorded in the [`TeardownReport`],
//! and the next step still runs.
//!
//! 1. stop upstream notifications and stop the decode pump
//! 2. disconnect the upstream source (bounded by the disconnect timeout)
//! 3. stop the data and control listeners
//! 4. close every remaining sink
//! 5. wait for connection tasks to finish (bounded by the drain timeout)

// Local crates
use crate::broadcaster::broadcaster::Broadcaster;
use crate::decoder::decoder::DecodeStats;
use crate::metrics::metrics::SHUTDOWN_INVOCATIONS_TOTAL;
use crate::source::source::NotificationSource;

// External crates
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::instrument;

/// Interval for polling `is_connected` after a disconnect request.
const DISCONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lifecycle of a bridge, published on a `watch` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Serving consumers; the shutdown latch has not fired.
    Running,
    /// Teardown in progress.
    ShuttingDown,
    /// Teardown finished.
    Stopped,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Result of a single teardown step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing to do, e.g. no upstream source in degraded mode.
    Skipped,
    /// Finished within its bound.
    Completed,
    /// The step returned an error, kept as text.
    Failed(String),
    /// The step was abandoned after this bound.
    TimedOut(Duration),
}

impl StepOutcome {
    /// Skipped or completed.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Skipped | Self::Completed)
    }
}

/// Everything teardown needs to release, handed over by the runtime.
#[derive(Debug)]
pub struct TeardownPlan {
    /// `None` in degraded mode.
    pub source: Option<Box<dyn NotificationSource>>,
    /// Decode pump task, if notifications were started.
    pub pump: Option<JoinHandle<DecodeStats>>,
    /// Stops the decode pump.
    pub pump_cancel: CancellationToken,
    /// Stops the data and control accept loops.
    pub listeners_cancel: CancellationToken,
    /// Data and control accept loops.
    pub listeners: Vec<JoinHandle<()>>,
    /// Consumers still attached.
    pub broadcaster: Arc<Broadcaster>,
    /// Tracks per-connection tasks for the final drain.
    pub tracker: TaskTracker,
    /// Bound on stop_notify, the pump join and disconnect.
    pub disconnect_timeout: Duration,
    /// Bound on the listener join and on the drain.
    pub drain_timeout: Duration,
}

/// What each teardown step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    /// Step 1: stop upstream notifications.
    pub stop_notify: StepOutcome,
    /// Step 2: disconnect the upstream.
    pub disconnect: StepOutcome,
    /// Step 3: join the accept loops.
    pub listeners: StepOutcome,
    /// Sinks still attached when teardown closed them.
    pub sinks_closed: usize,
    /// Step 5: wait for connection tasks.
    pub drain: StepOutcome,
    /// Final decoder counters, if the pump ran and stopped in time.
    pub decode_stats: Option<DecodeStats>,
}

impl TeardownReport {
    /// Whether every step completed or had nothing to do.
    pub fn is_clean(&self) -> bool {
        self.stop_notify.is_clean()
            && self.disconnect.is_clean()
            && self.listeners.is_clean()
            && self.drain.is_clean()
    }
}

/// Publishes [`BridgeState`] and runs teardown exactly once.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    state: watch::Sender<BridgeState>,
}

impl ShutdownCoordinator {
    /// Coordinator in the `Running` state.
    pub fn new() -> Self {
        let (state, _) = watch::channel(BridgeState::Running);
        Self { state }
    }

    /// Current state.
    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    /// Run the teardown sequence. A second call while or after the first
    /// runs does nothing and returns `None`.
    #[instrument(
        name = "bridge_shutdown::teardown",
        target = "runtime::coordinator",
        skip_all,
        level = "debug"
    )]
    pub async fn teardown(&self, plan: TeardownPlan) -> Option<TeardownReport> {
        let started = self.state.send_if_modified(|state| {
            if *state == BridgeState::Running {
                *state = BridgeState::ShuttingDown;
                true
            } else {
                false
            }
        });
        if !started {
            tracing::debug!(state = %self.state(), "Teardown already performed, ignoring");
            return None;
        }

        SHUTDOWN_INVOCATIONS_TOTAL.inc();
        tracing::info!("Shutting down bridge");

        let TeardownPlan {
            mut source,
            pump,
            pump_cancel,
            listeners_cancel,
            listeners,
            broadcaster,
            tracker,
            disconnect_timeout,
            drain_timeout,
        } = plan;

        // 1. upstream notifications and the decode pump
        let stop_notify = match source.as_mut() {
            Some(source) => bounded("stop_notify", disconnect_timeout, async {
                source.stop_notify().await.map_err(|e| e.to_string())
            })
            .await,
            None => StepOutcome::Skipped,
        };
        pump_cancel.cancel();
        let decode_stats = match pump {
            Some(pump) => match tokio::time::timeout(disconnect_timeout, pump).await {
                Ok(Ok(stats)) => Some(stats),
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Decode pump task failed");
                    None
                }
                Err(_) => {
                    tracing::warn!("Decode pump did not stop in time");
                    None
                }
            },
            None => None,
        };

        // 2. upstream link
        let disconnect = match source.as_mut() {
            Some(source) if source.is_connected() => {
                tracing::info!(upstream = %source.describe(), "Disconnecting upstream source");
                bounded("disconnect", disconnect_timeout, async {
                    source.disconnect().await.map_err(|e| e.to_string())?;
                    while source.is_connected() {
                        tokio::time::sleep(DISCONNECT_POLL_INTERVAL).await;
                    }
                    Ok(())
                })
                .await
            }
            _ => StepOutcome::Skipped,
        };
        drop(source);

        // 3. listeners
        listeners_cancel.cancel();
        let listeners = bounded("listeners", drain_timeout, async {
            for result in futures::future::join_all(listeners).await {
                if let Err(e) = result {
                    return Err(e.to_string());
                }
            }
            Ok(())
        })
        .await;

        // 4. sinks
        let sinks_closed = broadcaster.close_all();
        tracing::info!(sinks_closed, "Closed consumer connections");

        // 5. connection tasks
        tracker.close();
        let drain = bounded("drain", drain_timeout, async {
            tracker.wait().await;
            Ok(())
        })
        .await;

        let report = TeardownReport {
            stop_notify,
            disconnect,
            listeners,
            sinks_closed,
            drain,
            decode_stats,
        };

        self.state.send_replace(BridgeState::Stopped);
        tracing::info!(clean = report.is_clean(), "Bridge stopped");
        Some(report)
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

async fn bounded<F>(step: &'static str, limit: Duration, fut: F) -> StepOutcome
where
    F: Future<Output = Result<(), String>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(())) => {
            tracing::debug!(step, "Teardown step completed");
            StepOutcome::Completed
        }
        Ok(Err(e)) => {
            tracing::warn!(step, error = %e, "Teardown step failed, continuing");
            StepOutcome::Failed(e)
        }
        Err(_) => {
            tracing::warn!(step, timeout = ?limit, "Teardown step timed out, continuing");
            StepOutcome::TimedOut(limit)
        }
    }
}
