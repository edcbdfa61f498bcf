//! Writer-side flow-control latch.
//!
//! A stream's writers park here while the peer has PAUSEd the stream and
//! resume when it RESUMEs. Closing the latch wakes everyone with a
//! closed-pipe error so writers never wait on a stream that is gone.

use crate::error::{TunnelError, TunnelResult};
use std::sync::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct State {
    paused: bool,
    closed: bool,
}

#[derive(Debug, Default)]
pub(crate) struct BackPressure {
    state: Mutex<State>,
    notify: Notify,
}

impl BackPressure {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the stream is running. Errors once the latch is closed.
    pub async fn wait(&self) -> TunnelResult<()> {
        loop {
            // Register interest before checking state so a RESUME arriving
            // between the check and the wait is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.state.lock().unwrap();
                if state.closed {
                    return Err(TunnelError::ClosedPipe);
                }
                if !state.paused {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Peer sent PAUSE.
    pub fn on_pause(&self) {
        self.state.lock().unwrap().paused = true;
    }

    /// Peer sent RESUME.
    pub fn on_resume(&self) {
        self.state.lock().unwrap().paused = false;
        self.notify.notify_waiters();
    }

    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    pub fn is_paused(&self) -> bool {
        self.state.lock().unwrap().paused
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_passes_when_running() {
        let bp = BackPressure::new();
        bp.wait().await.unwrap();
    }

    #[tokio::test]
    async fn wait_blocks_until_resume() {
        let bp = Arc::new(BackPressure::new());
        bp.on_pause();
        assert!(bp.is_paused());

        let waiter = {
            let bp = bp.clone();
            tokio::spawn(async move { bp.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        bp.on_resume();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn close_wakes_waiters_with_error() {
        let bp = Arc::new(BackPressure::new());
        bp.on_pause();
        let waiter = {
            let bp = bp.clone();
            tokio::spawn(async move { bp.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        bp.close();
        match waiter.await.unwrap() {
            Err(TunnelError::ClosedPipe) => {}
            other => panic!("unexpected {other:?}"),
        }
    }
}
