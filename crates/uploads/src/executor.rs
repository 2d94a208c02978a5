use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Task invoked by the executor. Invocations are serialized; a tick that
/// fires while the task still runs is coalesced into the next one.
pub type Task = Box<dyn Fn() + Send + Sync>;

/// Invalid periodic-execution parameters.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("period end - {to} - is before period start - {from}")]
    WindowInverted {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },

    #[error("period should be larger than zero")]
    ZeroPeriod,
}

/// Periodically runs a task within an optional `[from, to]` activity window.
///
/// The task first runs on entry into the window (immediately when `from` is
/// absent or in the past) and every `period` thereafter. When `to` is
/// present execution stops at that instant; otherwise it continues until
/// [`stop`](Self::stop).
#[derive(Debug)]
pub struct PeriodicExecutor {
    cancel: CancellationToken,
}

impl PeriodicExecutor {
    pub fn new(
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        period: Duration,
        task: Task,
    ) -> Result<Self, ExecutorError> {
        if let (Some(from), Some(to)) = (from, to) {
            if to < from {
                return Err(ExecutorError::WindowInverted { from, to });
            }
        }
        if period.is_zero() {
            return Err(ExecutorError::ZeroPeriod);
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            if let Some(from) = from {
                let wait = (from - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
            }

            let deadline = to.map(|to| (to - Utc::now()).to_std().unwrap_or(Duration::ZERO));

            let ticking = async {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    // The first tick completes immediately on entry into the
                    // window.
                    ticker.tick().await;
                    task();
                }
            };

            match deadline {
                Some(wait) => {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(wait) => debug!("activity window closed"),
                        _ = ticking => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = ticking => {}
                    }
                }
            }
        });

        Ok(Self { cancel })
    }

    /// Stops periodic execution. Idempotent; an in-flight task invocation
    /// runs to completion.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PeriodicExecutor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
