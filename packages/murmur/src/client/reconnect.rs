//! The retry loop around connection attempts.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{ClientError, ConnectionState};

/// One connection lifetime, from dialing to hang-up.
#[async_trait]
pub(crate) trait Connector: Send {
    /// Connect and serve until the connection ends. `Ok` means the peer
    /// closed cleanly.
    async fn attempt(&mut self) -> Result<(), ClientError>;
}

/// Run attempts until a fatal error or `stop`. Attempt starts are never
/// closer together than `min_interval`.
pub(crate) async fn run<C: Connector>(
    connector: &mut C,
    min_interval: Duration,
    state: &watch::Sender<ConnectionState>,
    stop: &CancellationToken,
) -> Result<(), ClientError> {
    loop {
        let started = Instant::now();
        let outcome = tokio::select! {
            _ = stop.cancelled() => Ok(()),
            outcome = connector.attempt() => outcome,
        };
        state.send_replace(ConnectionState::Disconnected);

        if stop.is_cancelled() {
            return Ok(());
        }
        match outcome {
            Err(e) if e.is_fatal() => {
                warn!(code = e.code(), "giving up: {}", e);
                return Err(e);
            }
            Err(e) => warn!(code = e.code(), "connection lost: {}", e),
            Ok(()) => info!("server closed the connection"),
        }

        let next = started + min_interval;
        let wait = next.saturating_duration_since(Instant::now());
        info!("reconnecting in {:?}...", wait);
        tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            _ = tokio::time::sleep_until(next) => {}
        }
    }
}
