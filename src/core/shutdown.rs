//! Cooperative shutdown flag.
//!
//! The termination signal handler holds a [`ShutdownTrigger`]; the request
//! loop holds a [`Shutdown`] and checks it at every iteration boundary.

use crate::utils::error::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Shutdown {
    pub fn is_running(&self) -> bool {
        !*self.rx.borrow()
    }

    /// Resolves once shutdown has been requested. A dropped trigger counts
    /// as a request.
    pub async fn wait(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Spawns a task that fires `trigger` on the first SIGTERM or SIGINT.
pub fn install_signal_handlers(trigger: ShutdownTrigger) -> Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, stopping"),
            _ = sigint.recv() => tracing::info!("received SIGINT, stopping"),
        }
        trigger.trigger();
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_clears_run_flag() {
        let (trigger, mut shutdown) = channel();
        assert!(shutdown.is_running());

        trigger.trigger();
        assert!(!shutdown.is_running());
        tokio::time::timeout(Duration::from_secs(1), shutdown.wait())
            .await
            .expect("wait should resolve after trigger");
    }

    #[tokio::test]
    async fn test_wait_wakes_on_later_trigger() {
        let (trigger, shutdown) = channel();
        let mut waiter = shutdown.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());
        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_wait_is_pending_until_triggered() {
        let (trigger, mut shutdown) = channel();
        let mut wait = tokio_test::task::spawn(shutdown.wait());
        tokio_test::assert_pending!(wait.poll());

        trigger.trigger();
        assert!(wait.is_woken());
        tokio_test::assert_ready!(wait.poll());
    }

    #[tokio::test]
    async fn test_dropped_trigger_releases_waiters() {
        let (trigger, mut shutdown) = channel();
        drop(trigger);
        tokio::time::timeout(Duration::from_secs(1), shutdown.wait())
            .await
            .expect("wait should resolve when trigger is dropped");
    }
}
