use std::sync::{Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

/// Failure of a single fetch attempt against the device.
#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("fetch failed after {attempts} attempts: {last}")]
    Fetch { attempts: u32, last: FetchError },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("storage connection error: {0}")]
    Connect(String),
    #[error("handoff channel closed")]
    ChannelClosed,
    #[error("config error: {0}")]
    Config(String),
}

/// A long-running unit of work owned by the supervisor.
///
/// `serve` runs until the service is stopped or fails; returning at all is
/// treated as an exit and the supervisor may call `serve` again.
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    async fn serve(&self) -> Result<(), PipelineError>;

    /// Ask the current (or next) run to exit.
    fn stop(&self);
}

#[derive(Debug, Default)]
enum RunState {
    #[default]
    Idle,
    Running(CancellationToken),
    StopRequested,
}

/// Start/stop bookkeeping for a [`Service`].
///
/// The lock is only held while swapping tokens, never across I/O.
#[derive(Debug, Default)]
pub struct Lifecycle {
    state: Mutex<RunState>,
}

impl Lifecycle {
    /// Called at the top of `serve`; the run lasts as long as the guard.
    ///
    /// A stop that arrived before this run started yields a token that is
    /// already cancelled.
    pub fn begin(&self) -> RunGuard<'_> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let token = CancellationToken::new();
        if matches!(*state, RunState::StopRequested) {
            token.cancel();
        }
        *state = RunState::Running(token.clone());
        RunGuard {
            lifecycle: self,
            token,
        }
    }

    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &*state {
            RunState::Running(token) => token.cancel(),
            RunState::Idle | RunState::StopRequested => *state = RunState::StopRequested,
        }
    }

    fn finish(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*state, RunState::Running(_)) {
            *state = RunState::Idle;
        }
    }
}

/// Marks one run of a service. Dropping it (including on panic) returns the
/// lifecycle to idle so a later `stop` is remembered for the next run.
#[derive(Debug)]
pub struct RunGuard<'a> {
    lifecycle: &'a Lifecycle,
    token: CancellationToken,
}

impl RunGuard<'_> {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.lifecycle.finish();
    }
}
