// Unix signal handling for the daemon loop

use crate::error::{FretError, Result};
use tokio::signal::unix::{signal, Signal as TokioSignal, SignalKind};

/// Signals the daemon reacts to, as received
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonSignal {
    Terminate,
    Interrupt,
    Hangup,
    /// SIGUSR1: re-run strategy auto-selection
    Reselect,
}

impl DaemonSignal {
    pub fn should_shutdown(self) -> bool {
        matches!(self, Self::Terminate | Self::Interrupt | Self::Hangup)
    }

    pub fn should_reselect(self) -> bool {
        self == Self::Reselect
    }
}

pub struct SignalHandler {
    sigterm: TokioSignal,
    sigint: TokioSignal,
    sighup: TokioSignal,
    sigusr1: TokioSignal,
}

impl SignalHandler {
    /// Install handlers for SIGTERM, SIGINT, SIGHUP and SIGUSR1
    pub fn new() -> Result<Self> {
        Ok(Self {
            sigterm: install(SignalKind::terminate(), "SIGTERM")?,
            sigint: install(SignalKind::interrupt(), "SIGINT")?,
            sighup: install(SignalKind::hangup(), "SIGHUP")?,
            sigusr1: install(SignalKind::user_defined1(), "SIGUSR1")?,
        })
    }

    pub async fn wait(&mut self) -> DaemonSignal {
        tokio::select! {
            _ = self.sigterm.recv() => {
                tracing::info!("Received SIGTERM");
                DaemonSignal::Terminate
            }
            _ = self.sigint.recv() => {
                tracing::info!("Received SIGINT");
                DaemonSignal::Interrupt
            }
            _ = self.sighup.recv() => {
                tracing::info!("Received SIGHUP");
                DaemonSignal::Hangup
            }
            _ = self.sigusr1.recv() => {
                tracing::info!("Received SIGUSR1");
                DaemonSignal::Reselect
            }
        }
    }
}

fn install(kind: SignalKind, name: &str) -> Result<TokioSignal> {
    signal(kind).map_err(|e| FretError::Io {
        source: e,
        context: format!("Failed to setup {} handler", name),
    })
}
