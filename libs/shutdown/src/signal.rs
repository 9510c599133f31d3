use tokio::signal;
use tracing::{error, info};

use crate::coordinator::{ShutdownCoordinator, ShutdownState};

/// Starts draining on SIGINT or SIGTERM. Later signals are logged and
/// ignored. Returns once the coordinator stops.
pub async fn listen_for_signals(coordinator: ShutdownCoordinator) {
    loop {
        tokio::select! {
            received = wait_for_signal() => {
                match received {
                    Ok(name) => {
                        info!(signal = name, "shutdown signal received");
                        coordinator.begin_draining();
                    }
                    Err(err) => {
                        error!(error = %err, "failed to install signal handlers, draining now");
                        coordinator.begin_draining();
                        break;
                    }
                }
            }
            _ = coordinator.stopped() => break,
        }
        if coordinator.state() == ShutdownState::Stopped {
            break;
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = signal::ctrl_c() => result.map(|()| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    signal::ctrl_c().await.map(|()| "ctrl-c")
}
