use tokio::signal::unix::{signal, SignalKind};

/// Block until SIGTERM or SIGINT arrives.
///
/// The ordered stop sequence runs from the main task, so there is no token
/// hand-off here: callers await this, then tear the agent down themselves.
/// Every internal loop is cancelled through the agent's own token.
pub async fn wait_for_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    let received = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    tracing::info!(signal = received, "shutdown signal received");
}
