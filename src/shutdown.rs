//! Process termination requests.

use std::future::Future;

use tracing::warn;

/// Resolves on ctrl-c, or SIGTERM on unix.
///
/// The SIGTERM handler is installed when this is called, not when the
/// future is first polled, so a signal arriving in between is not lost.
/// Must be called from inside a tokio runtime.
pub fn requested() -> impl Future<Output = ()> {
    #[cfg(unix)]
    let term = {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate())
            .map_err(|e| warn!(error = %e, "Cannot listen for SIGTERM"))
            .ok()
    };

    async move {
        #[cfg(unix)]
        {
            if let Some(mut term) = term {
                tokio::select! {
                    _ = term.recv() => return,
                    _ = tokio::signal::ctrl_c() => return,
                }
            }
        }

        let _ = tokio::signal::ctrl_c().await;
    }
}
