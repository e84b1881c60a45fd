// External crates
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Why the bridge left the `Running` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// `SHUTDOWN` received on the control port.
    ControlCommand,
    /// The process received Ctrl-C or SIGTERM.
    Signal,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ControlCommand => "control-command",
            Self::Signal => "signal",
        };
        f.write_str(s)
    }
}

/// Global single-fire shutdown latch.
///
/// - Clones share the same latch; hand one to every component.
/// - `trigger` flips the latch false -> true exactly once; later calls are
///   ignored and report `false`.
/// - Waiters block on the underlying `CancellationToken`, so a waiter that
///   subscribes after the latch fired still observes it immediately.
#[derive(Debug, Clone)]
pub struct Shutdown {
    token: CancellationToken,
    reason: Arc<OnceLock<ShutdownReason>>,
}

impl Shutdown {
    /// Creates a new, unfired shutdown latch.
    #[instrument(name = "bridge_shutdown_latch", target = "helpers::shutdown", level = "trace")]
    pub fn new() -> Self {
        tracing::trace!("Creating new global shutdown latch");
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
        }
    }

    /// Returns a token that is cancelled when the latch fires. Used inside
    /// `tokio::select!` by serve loops.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Fire the latch. Returns `true` only for the call that actually
    /// performed the transition.
    #[instrument(
        name = "bridge_shutdown_trigger",
        target = "helpers::shutdown",
        level = "trace"
    )]
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        if self.reason.set(reason).is_err() {
            tracing::trace!(
                %reason,
                first_reason = ?self.reason.get(),
                "Shutdown already triggered, ignoring"
            );
            return false;
        }

        tracing::info!(%reason, "Shutdown triggered");
        self.token.cancel();
        true
    }

    /// Whether the latch has fired.
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The reason recorded by the first successful `trigger`.
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().copied()
    }

    /// Block until `trigger` has been called.
    #[instrument(
        name = "bridge_shutdown_waiter",
        target = "helpers::shutdown",
        skip_all,
        level = "trace"
    )]
    pub async fn wait_for_shutdown(&self) {
        tracing::trace!("Waiting for shutdown signal");
        self.token.cancelled().await;
        tracing::trace!(reason = ?self.reason(), "Shutdown signal received");
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
