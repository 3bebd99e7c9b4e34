use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancellation token wired to SIGTERM and SIGINT.
///
/// The embedding process passes this to [`proxy::serve`](crate::proxy::serve)
/// and, once it fires, stops any [`Connector`](crate::overlay::Connector) it
/// owns. Handler installation happens on the first poll of the spawned
/// listener task.
pub fn signal_shutdown() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                return;
            }
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "SIGINT handler unavailable");
                return;
            }
        };

        tokio::select! {
            _ = term.recv() => tracing::info!(signal = "SIGTERM", "shutting down"),
            _ = int.recv() => tracing::info!(signal = "SIGINT", "shutting down"),
        }
        trigger.cancel();
    });

    token
}
