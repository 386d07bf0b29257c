//! Worker-side view of the run state.
//!
//! Workers call [`SafePoint::checkpoint`] between actions: it returns
//! immediately while the run is in progress, blocks while it is paused and
//! fails once the run was stopped or finished. Long external calls go
//! through [`SafePoint::guard`], which bounds them by a timeout and aborts
//! them as soon as the run is cancelled.

use shared_types::RunState;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Interrupted {
    #[error("run was stopped")]
    Cancelled,

    #[error("run already finished with {0}")]
    Finished(RunState),

    #[error("external call timed out after {0:?}")]
    TimedOut(Duration),

    #[error("run coordinator is gone")]
    CoordinatorGone,
}

impl Interrupted {
    fn from_terminal(state: RunState) -> Self {
        match state {
            RunState::Cancelled => Interrupted::Cancelled,
            other => Interrupted::Finished(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SafePoint {
    state: watch::Receiver<RunState>,
    call_timeout: Duration,
}

impl SafePoint {
    pub fn new(state: watch::Receiver<RunState>, call_timeout: Duration) -> Self {
        Self {
            state,
            call_timeout,
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Honor pause/stop between actions.
    pub async fn checkpoint(&mut self) -> Result<(), Interrupted> {
        loop {
            let state = *self.state.borrow_and_update();
            match state {
                RunState::Pending | RunState::InProgress => return Ok(()),
                RunState::Paused => {
                    tracing::debug!("Run paused; waiting at safe point");
                    if self.state.changed().await.is_err() {
                        return Err(Interrupted::CoordinatorGone);
                    }
                }
                terminal => return Err(Interrupted::from_terminal(terminal)),
            }
        }
    }

    /// Run an external call bounded by the call timeout and by cancellation.
    pub async fn guard<F>(&mut self, fut: F) -> Result<F::Output, Interrupted>
    where
        F: Future,
    {
        self.checkpoint().await?;

        let call_timeout = self.call_timeout;
        let mut watcher = self.state.clone();
        let terminal = async move {
            loop {
                let state = *watcher.borrow_and_update();
                if state.is_terminal() {
                    return Interrupted::from_terminal(state);
                }
                if watcher.changed().await.is_err() {
                    return Interrupted::CoordinatorGone;
                }
            }
        };

        tokio::select! {
            result = tokio::time::timeout(call_timeout, fut) => {
                result.map_err(|_| Interrupted::TimedOut(call_timeout))
            }
            interrupted = terminal => Err(interrupted),
        }
    }
}
