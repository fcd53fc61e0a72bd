//! Module process ownership and exit monitoring
//!
//! The monitor task is the only owner of a module's [`Child`]. It reports
//! unexpected exits to the supervisor and performs graceful-then-forced
//! termination when asked to stop.

use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// An exit nobody asked for
#[derive(Debug)]
pub struct ExitNotice {
    pub name: String,
    /// Launch generation the exited process belonged to
    pub generation: u64,
    pub status: Option<ExitStatus>,
}

/// Handle to a monitored process
#[derive(Debug)]
pub struct ProcessControl {
    stop_tx: Option<oneshot::Sender<Duration>>,
    done_rx: oneshot::Receiver<Option<ExitStatus>>,
    pid: Option<u32>,
}

impl ProcessControl {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the process to exit within `grace`, then force it, and wait
    ///
    /// An exit during the grace period is not reported as a crash.
    pub async fn stop(mut self, grace: Duration) -> Option<ExitStatus> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(grace);
        }
        self.done_rx.await.ok().flatten()
    }
}

/// Hand `child` to a new monitor task
pub fn watch(
    name: String,
    generation: u64,
    mut child: Child,
    exit_tx: mpsc::UnboundedSender<ExitNotice>,
) -> ProcessControl {
    let (stop_tx, stop_rx) = oneshot::channel::<Duration>();
    let (done_tx, done_rx) = oneshot::channel();
    let pid = child.id();

    tokio::spawn(async move {
        let (status, requested) = tokio::select! {
            status = child.wait() => (status.ok(), false),
            grace = stop_rx => match grace {
                Ok(grace) => (terminate(&name, &mut child, grace).await, true),
                // Control dropped without a stop request: keep watching
                Err(_) => (child.wait().await.ok(), false),
            },
        };

        if requested {
            info!("Module {} stopped ({:?})", name, status);
        } else {
            warn!("Module {} exited unexpectedly ({:?})", name, status);
            let _ = exit_tx.send(ExitNotice {
                name,
                generation,
                status,
            });
        }
        let _ = done_tx.send(status);
    });

    ProcessControl {
        stop_tx: Some(stop_tx),
        done_rx,
        pid,
    }
}

async fn terminate(name: &str, child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => {
            debug!("Module {} did not exit within {:?}, killing", name, grace);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill module process {}: {}", name, e);
            }
            child.wait().await.ok()
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn sh(script: &str) -> Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_reported() {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        let _control = watch("widget".to_string(), 7, sh("exit 3"), exit_tx);

        let notice = exit_rx.recv().await.unwrap();
        assert_eq!(notice.name, "widget");
        assert_eq!(notice.generation, 7);
        assert_eq!(notice.status.and_then(|s| s.code()), Some(3));
    }

    #[tokio::test]
    async fn test_stop_forces_after_grace() {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        let control = watch("widget".to_string(), 1, sh("sleep 30"), exit_tx);

        let started = std::time::Instant::now();
        control.stop(Duration::from_millis(100)).await;

        assert!(started.elapsed() < Duration::from_secs(10));
        // A requested stop is not a crash
        assert!(exit_rx.try_recv().is_err());
    }
}
