//! Periodic session keep-alive.
//!
//! Some portals drop a session that stops calling `get_events`; the watchdog
//! replays the call the real firmware makes. Failures are logged and never
//! propagate: the watchdog is best-effort background work, not part of the
//! request-serving path.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::PortalSession;

/// Spawn the watchdog ticker for a session, or nothing when the interval is
/// disabled. The returned task runs until `shutdown` is cancelled.
pub fn spawn_watchdog(
    session: Arc<PortalSession>,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    let Some(interval) = session.watchdog_interval() else {
        info!("proceeding without watchdog updates");
        return None;
    };
    info!(minutes = interval.as_secs() / 60, "enabling watchdog updates");

    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("watchdog stopped");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = session.watchdog_tick().await {
                        warn!(error = %e, "watchdog update failed");
                    }
                }
            }
        }
    }))
}
