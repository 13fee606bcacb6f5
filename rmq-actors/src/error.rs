use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by a `Connector` or a `BrokerConnection`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker {0} is unreachable")]
    Unreachable(String),
    #[error("timed out after {0:?} while connecting to the broker")]
    Timeout(Duration),
    #[error("broker error: {0}")]
    Broker(String),
    #[error("connection is closed")]
    Closed,
}

/// Programmer-misuse guards on the lifecycle contract.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("connection manager was already started")]
    AlreadyStarted,
    #[error("connection manager was already stopped")]
    AlreadyStopped,
}

/// Errors returned by `ConnectionManager::start`.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("unable to connect to the broker after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: BrokerError },
    #[error("start was aborted by a concurrent stop")]
    Aborted,
    #[error("invalid configuration")]
    InvalidConfig(#[from] ConfigError),
    #[error("failed to create the worker pool")]
    WorkerPool(#[from] PoolError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Errors returned while building or tearing down a `WorkerPool`.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("worker pool size must be a positive integer")]
    EmptyPool,
    #[error("failed to spawn worker thread")]
    Spawn(#[from] std::io::Error),
    #[error("grace period expired, {cancelled} task(s) cancelled")]
    GraceExpired { cancelled: usize },
    #[error("{remaining} worker thread(s) did not exit after cancellation")]
    WorkersStuck { remaining: usize },
    #[error("{0} worker thread(s) panicked")]
    WorkerPanicked(usize),
}

/// Outcome of a task submitted to the worker pool, delivered on its `TaskHandle`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("task rejected, the worker pool is not accepting work")]
    Rejected,
    #[error("task cancelled at shutdown grace period expiry")]
    Cancelled,
    #[error("task panicked")]
    Panicked,
    #[error("task was dropped without reporting a result")]
    Dropped,
    #[error("task failed: {0}")]
    Failed(String),
}

impl TaskError {
    pub fn failed(error: impl fmt::Display) -> Self {
        TaskError::Failed(error.to_string())
    }
}

/// A resource that failed to release cleanly during shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceFailure {
    pub resource: &'static str,
    pub reason: String,
}

impl fmt::Display for ResourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.resource, self.reason)
    }
}

/// Aggregate of every failure collected during a best-effort shutdown.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct ShutdownError {
    pub failures: Vec<ResourceFailure>,
}

impl ShutdownError {
    pub fn involves(&self, resource: &str) -> bool {
        self.failures.iter().any(|f| f.resource == resource)
    }
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "shutdown completed with {} failure(s)",
            self.failures.len()
        )?;
        for failure in &self.failures {
            write!(f, "; {failure}")?;
        }
        Ok(())
    }
}

/// Errors returned by `ConnectionManager::stop`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StopError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_error_lists_every_failure() {
        let error = ShutdownError {
            failures: vec![
                ResourceFailure {
                    resource: "worker-pool",
                    reason: "grace period expired, 1 task(s) cancelled".to_string(),
                },
                ResourceFailure {
                    resource: "connection",
                    reason: "connection is closed".to_string(),
                },
            ],
        };

        assert!(error.involves("connection"));
        assert!(!error.involves("supervisor"));
        assert_eq!(
            error.to_string(),
            "shutdown completed with 2 failure(s); worker-pool: grace period expired, 1 task(s) cancelled; connection: connection is closed"
        );
    }

    #[test]
    fn exhausted_error_mentions_last_failure() {
        let error = ConnectionError::Exhausted {
            attempts: 3,
            last: BrokerError::Unreachable("rmq-0:5672".to_string()),
        };
        assert_eq!(
            error.to_string(),
            "unable to connect to the broker after 3 attempt(s): broker rmq-0:5672 is unreachable"
        );
    }
}
