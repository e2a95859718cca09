//! Readiness polling.
//!
//! After the container starts, the server spends a while initializing (and
//! running the initial script) before it accepts connections. The poller
//! probes it on a fixed interval until one of three things happens:
//!
//! ```text
//!              probe ok
//!   Polling ─────────────▶ Ready
//!      │  deadline passed
//!      ├─────────────────▶ TimedOut
//!      │  exited signal
//!      └─────────────────▶ ExitedEarly
//! ```

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::time::Instant;

use crate::error::{BoxError, Result};

/// Delay between two probes.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How long the server gets to become reachable.
pub const READY_DEADLINE: Duration = Duration::from_secs(30);

/// Upper bound on a single probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// A single "is the server up yet?" check.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Succeeds once the server accepts connections. The error text is kept
    /// as the reason reported on timeout.
    async fn probe(&self) -> std::result::Result<(), String>;
}

/// Where the poller currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessState {
    Polling,
    Ready,
    TimedOut { last_error: String },
    ExitedEarly,
}

impl ReadinessState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReadinessState::Polling)
    }

    /// The terminal outcome, or the state itself while still polling.
    pub fn into_outcome(self) -> std::result::Result<ReadinessOutcome, ReadinessState> {
        match self {
            ReadinessState::Polling => Err(self),
            ReadinessState::Ready => Ok(ReadinessOutcome::Ready),
            ReadinessState::TimedOut { last_error } => {
                Ok(ReadinessOutcome::TimedOut { last_error })
            }
            ReadinessState::ExitedEarly => Ok(ReadinessOutcome::ExitedEarly),
        }
    }
}

/// How polling ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessOutcome {
    Ready,
    TimedOut { last_error: String },
    ExitedEarly,
}

/// Polls a [`ReadinessProbe`] until the server is ready, the deadline
/// passes, or the container exits.
#[derive(Debug, Clone)]
pub struct ReadinessPoller {
    interval: Duration,
    deadline: Duration,
    probe_timeout: Duration,
}

impl Default for ReadinessPoller {
    fn default() -> Self {
        Self {
            interval: POLL_INTERVAL,
            deadline: READY_DEADLINE,
            probe_timeout: PROBE_TIMEOUT,
        }
    }
}

impl ReadinessPoller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Run the state machine to a terminal state.
    ///
    /// `exited` fires when the container's log stream ends on its own; it is
    /// raced against both the probe in flight and the delay between probes.
    /// If its sender is dropped without firing, the exit watch is abandoned
    /// and polling continues until ready or timed out.
    pub async fn wait(
        &self,
        probe: &dyn ReadinessProbe,
        exited: &mut oneshot::Receiver<()>,
    ) -> ReadinessOutcome {
        let started = Instant::now();
        let mut watch_exit = true;
        let mut attempts = 0u32;
        let mut state = ReadinessState::Polling;

        loop {
            state = match state.into_outcome() {
                Ok(outcome) => return outcome,
                Err(polling) => polling,
            };

            if watch_exit {
                match exited.try_recv() {
                    Ok(()) => {
                        state = ReadinessState::ExitedEarly;
                        continue;
                    }
                    Err(TryRecvError::Closed) => {
                        tracing::debug!("Exit signal dropped, polling without it");
                        watch_exit = false;
                    }
                    Err(TryRecvError::Empty) => {}
                }
            }

            attempts += 1;
            let attempt = tokio::time::timeout(self.probe_timeout, probe.probe());
            tokio::pin!(attempt);

            let result = if watch_exit {
                tokio::select! {
                    biased;
                    signal = &mut *exited => match signal {
                        Ok(()) => {
                            state = ReadinessState::ExitedEarly;
                            continue;
                        }
                        Err(_) => {
                            tracing::debug!("Exit signal dropped, polling without it");
                            watch_exit = false;
                            (&mut attempt).await
                        }
                    },
                    result = &mut attempt => result,
                }
            } else {
                attempt.await
            };

            let last_error = match result {
                Ok(Ok(())) => {
                    tracing::debug!("MySQL ready after {} attempt(s)", attempts);
                    state = ReadinessState::Ready;
                    continue;
                }
                Ok(Err(e)) => e,
                Err(_) => format!("probe timed out after {:?}", self.probe_timeout),
            };
            tracing::trace!("Readiness probe {} failed: {}", attempts, last_error);

            if started.elapsed() >= self.deadline {
                state = ReadinessState::TimedOut { last_error };
                continue;
            }

            let sleep = tokio::time::sleep(self.interval);
            tokio::pin!(sleep);

            if watch_exit {
                tokio::select! {
                    biased;
                    signal = &mut *exited => match signal {
                        Ok(()) => state = ReadinessState::ExitedEarly,
                        Err(_) => {
                            tracing::debug!("Exit signal dropped, polling without it");
                            watch_exit = false;
                            (&mut sleep).await;
                        }
                    },
                    _ = &mut sleep => {}
                }
            } else {
                sleep.await;
            }
        }
    }

    /// Like [`wait`](Self::wait), mapping the failure states to errors.
    pub async fn wait_ready(
        &self,
        probe: &dyn ReadinessProbe,
        exited: &mut oneshot::Receiver<()>,
        container_name: &str,
    ) -> Result<()> {
        match self.wait(probe, exited).await {
            ReadinessOutcome::Ready => Ok(()),
            ReadinessOutcome::TimedOut { last_error } => Err(BoxError::ConnectTimeout {
                timeout: self.deadline,
                reason: last_error,
            }),
            ReadinessOutcome::ExitedEarly => Err(BoxError::ExitedEarly {
                name: container_name.to_string(),
            }),
        }
    }
}
