use std::fmt;

use health::{HealthCheck, HealthStatus};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Created,
    Starting,
    Connected,
    Disconnected,
    Reconnecting,
    Stopped,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState as S;
        matches!(
            (self, next),
            (S::Created, S::Starting)
                | (S::Starting, S::Connected)
                | (S::Connected, S::Disconnected)
                | (S::Disconnected, S::Reconnecting)
                | (S::Reconnecting, S::Connected)
                | (S::Reconnecting, S::Disconnected)
                | (S::Created | S::Starting | S::Connected | S::Disconnected | S::Reconnecting, S::Stopped)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Created => "created",
            ConnectionState::Starting => "starting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last known state of the manager, published on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub state: ConnectionState,
    /// Broker of the live connection, if any.
    pub broker: Option<String>,
    /// Current reconnect attempt while `Reconnecting`.
    pub attempt: u32,
    /// Consumers that failed to bind against the live connection.
    pub unbound_consumers: Vec<String>,
    /// Reason of the last disconnect or failed attempt.
    pub last_error: Option<String>,
}

impl StateSnapshot {
    pub(crate) fn new() -> Self {
        Self {
            state: ConnectionState::Created,
            broker: None,
            attempt: 0,
            unbound_consumers: Vec::new(),
            last_error: None,
        }
    }

    /// Health derived from the snapshot, never cached.
    pub fn health(&self) -> HealthStatus {
        match self.state {
            ConnectionState::Connected if self.unbound_consumers.is_empty() => {
                HealthStatus::healthy()
            }
            ConnectionState::Connected => HealthStatus::degraded(format!(
                "consumers not bound: {}",
                self.unbound_consumers.join(", ")
            )),
            ConnectionState::Created => HealthStatus::unhealthy("connection not started"),
            ConnectionState::Starting => HealthStatus::unhealthy("connecting to broker"),
            ConnectionState::Disconnected => HealthStatus::unhealthy(format!(
                "broker connection lost: {}",
                self.last_error.as_deref().unwrap_or("unknown reason")
            )),
            ConnectionState::Reconnecting => HealthStatus::unhealthy(format!(
                "reconnecting to broker (attempt {})",
                self.attempt
            )),
            ConnectionState::Stopped => HealthStatus::unhealthy("connection stopped"),
        }
    }
}

/// Health check registered with the host. Reads the published snapshot, never the network.
#[derive(Clone)]
pub struct ConnectivityCheck {
    state: watch::Receiver<StateSnapshot>,
}

impl ConnectivityCheck {
    pub(crate) fn new(state: watch::Receiver<StateSnapshot>) -> Self {
        Self { state }
    }
}

impl HealthCheck for ConnectivityCheck {
    fn check(&self) -> HealthStatus {
        self.state.borrow().health()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use health::HealthState;

    const ALL: [ConnectionState; 6] = [
        ConnectionState::Created,
        ConnectionState::Starting,
        ConnectionState::Connected,
        ConnectionState::Disconnected,
        ConnectionState::Reconnecting,
        ConnectionState::Stopped,
    ];

    #[test]
    fn follows_the_lifecycle_path() {
        let path = [
            ConnectionState::Created,
            ConnectionState::Starting,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
            ConnectionState::Reconnecting,
            ConnectionState::Disconnected,
            ConnectionState::Reconnecting,
            ConnectionState::Connected,
            ConnectionState::Stopped,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
    }

    #[test]
    fn stopped_is_terminal() {
        for next in ALL {
            assert!(!ConnectionState::Stopped.can_transition_to(next));
        }
        for state in ALL.into_iter().filter(|s| *s != ConnectionState::Stopped) {
            assert!(state.can_transition_to(ConnectionState::Stopped));
        }
    }

    #[test]
    fn rejects_shortcuts() {
        assert!(!ConnectionState::Created.can_transition_to(ConnectionState::Connected));
        assert!(!ConnectionState::Connected.can_transition_to(ConnectionState::Reconnecting));
        assert!(!ConnectionState::Disconnected.can_transition_to(ConnectionState::Connected));
        assert!(!ConnectionState::Starting.can_transition_to(ConnectionState::Disconnected));
    }

    #[test]
    fn only_connected_is_healthy() {
        for state in ALL {
            let snapshot = StateSnapshot {
                state,
                ..StateSnapshot::new()
            };
            assert_eq!(
                snapshot.health().is_healthy(),
                state == ConnectionState::Connected
            );
        }
    }

    #[test]
    fn unbound_consumers_degrade_health() {
        let snapshot = StateSnapshot {
            state: ConnectionState::Connected,
            unbound_consumers: vec!["orders".to_string(), "audit".to_string()],
            ..StateSnapshot::new()
        };
        let health = snapshot.health();
        assert_eq!(health.state, HealthState::Degraded);
        assert_eq!(
            health.message.as_deref(),
            Some("consumers not bound: orders, audit")
        );
    }

    #[test]
    fn check_reads_latest_snapshot() {
        let (tx, rx) = watch::channel(StateSnapshot::new());
        let check = ConnectivityCheck::new(rx);
        assert_eq!(check.check().state, HealthState::Unhealthy);

        tx.send_modify(|s| s.state = ConnectionState::Connected);
        assert!(check.check().is_healthy());

        tx.send_modify(|s| {
            s.state = ConnectionState::Disconnected;
            s.last_error = Some("heartbeat missed".to_string());
        });
        assert_eq!(
            check.check().message.as_deref(),
            Some("broker connection lost: heartbeat missed")
        );
    }
}
