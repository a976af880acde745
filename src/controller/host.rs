//! Collaborators the controller calls out to: the host environment and time.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Commands the host environment can run on the controller's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCommand {
    /// Reveal the chat panel and focus its input. Takes no arguments.
    FocusChatInput,
}

impl HostCommand {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FocusChatInput => "tether.focusChatInput",
        }
    }
}

/// The process embedding the host (an editor, a terminal, a test harness).
#[async_trait]
pub trait HostEnvironment: Send + Sync {
    async fn execute_command(&self, command: HostCommand) -> Result<()>;

    /// Show a human-readable error to the end user.
    async fn show_error_message(&self, message: &str);
}

/// Host with no UI of its own. Commands are no-ops and errors go to the log.
#[derive(Debug, Clone, Default)]
pub struct HeadlessHost;

#[async_trait]
impl HostEnvironment for HeadlessHost {
    async fn execute_command(&self, command: HostCommand) -> Result<()> {
        tracing::debug!(command = command.as_str(), "host command ignored (headless)");
        Ok(())
    }

    async fn show_error_message(&self, message: &str) {
        tracing::error!("{message}");
    }
}

/// Time source for bounded waits.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Time elapsed since the clock was created.
    fn now(&self) -> Duration;

    async fn sleep(&self, duration: Duration);
}

/// Wall-clock time via tokio.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

impl Default for TokioClock {
    fn default() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Clock that only moves when slept on. Sleeping advances it instantly.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}
