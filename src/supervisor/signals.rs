//! OS signal handling for the master
//!
//! | Signal           | Action            |
//! |------------------|-------------------|
//! | SIGINT, SIGTERM  | graceful shutdown |
//! | SIGUSR2          | rolling restart   |

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::control::SupervisorHandle;
use super::error::{SupervisorError, SupervisorResult};

/// Forward master signals to the Supervisor until it stops
pub fn spawn_signal_listener(handle: SupervisorHandle) -> SupervisorResult<JoinHandle<()>> {
    let mut sigint = signal(SignalKind::interrupt()).map_err(SupervisorError::Signal)?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(SupervisorError::Signal)?;
    let mut sigusr2 = signal(SignalKind::user_defined2()).map_err(SupervisorError::Signal)?;

    Ok(tokio::spawn(async move {
        loop {
            let result = tokio::select! {
                _ = sigint.recv() => {
                    info!("SIGINT received, shutting down");
                    handle.terminate()
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received, shutting down");
                    handle.terminate()
                }
                _ = sigusr2.recv() => {
                    info!("SIGUSR2 received, rolling restart");
                    handle.restart()
                }
            };

            if result.is_err() {
                break;
            }
        }
    }))
}

/// Keep SIGINT from killing a worker process.
///
/// A terminal Ctrl-C reaches the whole process group; the worker waits for
/// the master's `Stop` instead.
pub fn ignore_interrupts() -> SupervisorResult<JoinHandle<()>> {
    let mut sigint = signal(SignalKind::interrupt()).map_err(SupervisorError::Signal)?;

    Ok(tokio::spawn(async move {
        while sigint.recv().await.is_some() {
            warn!("SIGINT ignored, waiting for the master");
        }
    }))
}

/// Which control command to deliver to a running master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Reload,
    Stop,
}

impl ControlSignal {
    fn signal(self) -> Signal {
        match self {
            Self::Reload => Signal::SIGUSR2,
            Self::Stop => Signal::SIGTERM,
        }
    }
}

/// Deliver `control` to the master with process id `pid`
pub fn notify_master(pid: i32, control: ControlSignal) -> SupervisorResult<()> {
    kill(Pid::from_raw(pid), control.signal()).map_err(|e| SupervisorError::Notify {
        pid,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_signal_mapping() {
        assert_eq!(ControlSignal::Reload.signal(), Signal::SIGUSR2);
        assert_eq!(ControlSignal::Stop.signal(), Signal::SIGTERM);
    }

    #[test]
    fn test_notify_missing_process_fails() {
        // pid_max on Linux is at most 2^22
        let err = notify_master(i32::MAX, ControlSignal::Reload).unwrap_err();
        assert!(matches!(err, SupervisorError::Notify { .. }));
    }
}
