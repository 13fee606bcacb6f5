//! Seams between the manager and a broker client library.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};

use crate::config::{Broker, RmqConfig};
use crate::error::BrokerError;
use crate::pool::WorkerHandle;

/// A live session to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    fn is_open(&self) -> bool;

    /// Close the session. Called exactly once by the manager for each connection it acquired.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Opens sessions. One call per connection attempt, the manager handles retries.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: BrokerConnection;

    async fn connect(
        &self,
        config: &RmqConfig,
        broker: &Broker,
    ) -> Result<Session<Self::Connection>, BrokerError>;
}

/// A consumer that needs to be (re)bound each time a new connection is published.
#[async_trait]
pub trait Consumer<C: BrokerConnection>: Send + Sync {
    fn name(&self) -> &str;

    async fn bind(&self, connection: Arc<C>, workers: WorkerHandle) -> Result<(), BrokerError>;
}

/// A freshly opened connection along with the listener for its asynchronous loss.
pub struct Session<C> {
    pub connection: Arc<C>,
    pub disconnected: DisconnectListener,
}

impl<C> Session<C> {
    pub fn new(connection: C, disconnected: DisconnectListener) -> Self {
        Self {
            connection: Arc::new(connection),
            disconnected,
        }
    }
}

/// Create the pair used by a connector to report an asynchronous disconnect.
pub fn disconnect_channel() -> (DisconnectNotifier, DisconnectListener) {
    let (tx, rx) = oneshot::channel();
    (
        DisconnectNotifier {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        DisconnectListener { rx },
    )
}

/// Cloneable sender side, safe to move into client library callbacks. Only the first
/// notification is delivered.
#[derive(Clone)]
pub struct DisconnectNotifier {
    tx: Arc<Mutex<Option<oneshot::Sender<String>>>>,
}

impl DisconnectNotifier {
    pub fn notify(&self, reason: impl Into<String>) {
        let sender = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            drop(sender.send(reason.into()));
        }
    }

    pub fn is_notified(&self) -> bool {
        match self.tx.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

pub struct DisconnectListener {
    rx: oneshot::Receiver<String>,
}

impl DisconnectListener {
    /// Resolves with the disconnect reason. A connector that drops every notifier is
    /// treated as having lost the connection.
    pub async fn wait(self) -> String {
        self.rx
            .await
            .unwrap_or_else(|_| "connection listener dropped".to_string())
    }
}

/// Read-only view of the active connection. Swapped atomically by the manager on reconnect,
/// readers either see a complete connection or none.
pub struct ConnectionHandle<C> {
    rx: watch::Receiver<Option<Arc<C>>>,
}

impl<C> Clone for ConnectionHandle<C> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<C> ConnectionHandle<C> {
    pub(crate) fn new(rx: watch::Receiver<Option<Arc<C>>>) -> Self {
        Self { rx }
    }

    pub fn current(&self) -> Option<Arc<C>> {
        self.rx.borrow().clone()
    }

    /// Wait until a connection is published. Returns `None` once the manager is gone.
    pub async fn connected(&mut self) -> Option<Arc<C>> {
        match self.rx.wait_for(|c| c.is_some()).await {
            Ok(connection) => connection.clone(),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_disconnect_reason_wins() {
        let (notifier, listener) = disconnect_channel();
        let callback = notifier.clone();

        assert!(!notifier.is_notified());
        callback.notify("heartbeat timeout");
        notifier.notify("socket closed");
        assert!(notifier.is_notified());

        assert_eq!(listener.wait().await, "heartbeat timeout");
    }

    #[tokio::test]
    async fn dropped_notifier_counts_as_disconnect() {
        let (notifier, listener) = disconnect_channel();
        drop(notifier);
        assert_eq!(listener.wait().await, "connection listener dropped");
    }

    #[tokio::test]
    async fn handle_sees_swapped_connection() {
        let (tx, rx) = watch::channel::<Option<Arc<String>>>(None);
        let mut handle = ConnectionHandle::new(rx);
        assert!(handle.current().is_none());

        let waiter = {
            let mut handle = handle.clone();
            tokio::spawn(async move { handle.connected().await })
        };
        tx.send_replace(Some(Arc::new("first".to_string())));
        assert_eq!(waiter.await.unwrap().as_deref().map(String::as_str), Some("first"));

        tx.send_replace(Some(Arc::new("second".to_string())));
        assert_eq!(handle.connected().await.as_deref().map(String::as_str), Some("second"));

        drop(tx);
        assert!(handle.current().is_some());
    }
}
