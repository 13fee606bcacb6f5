//! Connection manager: owns the broker connection and the worker pool, drives reconnects and
//! exposes the `start`/`stop`/`healthcheck` contract to the host.
//!
//! Resources are acquired in the order connection, worker pool, consumer bindings and are
//! released in reverse: intake is closed, the supervisor stops, the pool drains, and the
//! connection is closed last.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use health::HealthStatus;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::config::RmqConfig;
use crate::connector::{
    BrokerConnection, ConnectionHandle, Connector, Consumer, DisconnectListener, Session,
};
use crate::error::{
    BrokerError, ConnectionError, LifecycleError, ResourceFailure, ShutdownError, StopError,
};
use crate::metrics_consts::{
    CONNECTION_ATTEMPTS, CONNECTION_ATTEMPT_DURATION, CONSUMER_BINDS, DISCONNECTS, RECONNECTS,
    RECONNECTS_EXHAUSTED, SHUTDOWN_FAILURES,
};
use crate::metrics_sink::{labels, MetricsSink, NoopMetricsSink};
use crate::pool::{DefaultWorkerPoolFactory, PoolProbe, WorkerHandle, WorkerPool, WorkerPoolFactory};
use crate::retry::RetryPolicy;
use crate::state::{ConnectionState, ConnectivityCheck, StateSnapshot};
use crate::util::lock;

const WORKER_POOL_NAME: &str = "rmq-worker";
const EVENT_CAPACITY: usize = 64;

/// Notifications for hosts that need to react to connectivity changes, e.g. to exit the
/// process once reconnects are exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected { broker: String },
    Disconnected { reason: String },
    Reconnecting { attempt: u32 },
    ReconnectExhausted { attempts: u32 },
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Started,
    Stopped,
}

type SharedConsumer<C> = Arc<dyn Consumer<<C as Connector>::Connection>>;

struct Inner<C: Connector> {
    connector: C,
    metrics: Arc<dyn MetricsSink>,
    pool_factory: Arc<dyn WorkerPoolFactory>,
    lifecycle: Mutex<Lifecycle>,
    // Held for the whole of `start`, `stop` takes it to wait for an aborted start.
    start_lock: tokio::sync::Mutex<()>,
    // Held by every bind pass up to the state change that publishes its result, so a
    // registration never races a rebind.
    bind_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    config: OnceLock<RmqConfig>,
    state: watch::Sender<StateSnapshot>,
    connection: watch::Sender<Option<Arc<C::Connection>>>,
    pool: Mutex<Option<WorkerPool>>,
    workers: Mutex<Option<WorkerHandle>>,
    consumers: Mutex<Vec<SharedConsumer<C>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<ConnectionEvent>,
}

/// Builder for [`ConnectionManager`]. The metrics sink and the worker pool factory are
/// optional capabilities, defaulting to a no-op sink and plain fixed-size pools.
pub struct ConnectionManagerBuilder<C: Connector> {
    connector: C,
    metrics: Arc<dyn MetricsSink>,
    pool_factory: Arc<dyn WorkerPoolFactory>,
}

impl<C: Connector> ConnectionManagerBuilder<C> {
    pub fn metrics_sink(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn worker_pool_factory(mut self, factory: Arc<dyn WorkerPoolFactory>) -> Self {
        self.pool_factory = factory;
        self
    }

    pub fn build(self) -> ConnectionManager<C> {
        let (state, _) = watch::channel(StateSnapshot::new());
        let (connection, _) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shutdown = CancellationToken::new();

        ConnectionManager {
            guard: Arc::new(shutdown.clone().drop_guard()),
            inner: Arc::new(Inner {
                connector: self.connector,
                metrics: self.metrics,
                pool_factory: self.pool_factory,
                lifecycle: Mutex::new(Lifecycle::Created),
                start_lock: tokio::sync::Mutex::new(()),
                bind_lock: tokio::sync::Mutex::new(()),
                shutdown,
                config: OnceLock::new(),
                state,
                connection,
                pool: Mutex::new(None),
                workers: Mutex::new(None),
                consumers: Mutex::new(Vec::new()),
                supervisor: Mutex::new(None),
                events,
            }),
        }
    }
}

/// Cloneable handle to a single managed broker connection.
///
/// Dropping the last clone without calling [`stop`](ConnectionManager::stop) cancels the
/// supervisor and signals worker threads to exit, but does not drain in-flight tasks.
pub struct ConnectionManager<C: Connector> {
    inner: Arc<Inner<C>>,
    guard: Arc<DropGuard>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            guard: self.guard.clone(),
        }
    }
}

impl<C: Connector> ConnectionManager<C> {
    pub fn builder(connector: C) -> ConnectionManagerBuilder<C> {
        ConnectionManagerBuilder {
            connector,
            metrics: Arc::new(NoopMetricsSink),
            pool_factory: Arc::new(DefaultWorkerPoolFactory),
        }
    }

    pub fn new(connector: C) -> Self {
        Self::builder(connector).build()
    }

    /// Connect to the broker, create the worker pool and bind registered consumers.
    ///
    /// Returns once the manager is `Connected`, or with `ConnectionError::Exhausted` after
    /// `initial_connect_attempts` failed attempts. A concurrent [`stop`](Self::stop) aborts
    /// the retry loop and makes this return `ConnectionError::Aborted`.
    pub async fn start(&self, config: &RmqConfig) -> Result<(), ConnectionError> {
        let _starting = self.inner.start_lock.lock().await;
        {
            let mut lifecycle = lock(&self.inner.lifecycle);
            match *lifecycle {
                Lifecycle::Created => *lifecycle = Lifecycle::Started,
                Lifecycle::Started => return Err(LifecycleError::AlreadyStarted.into()),
                Lifecycle::Stopped => return Err(LifecycleError::AlreadyStopped.into()),
            }
        }

        if let Err(e) = config.validate() {
            error!(error = %e, "refusing to start with invalid configuration");
            self.inner.abandon_start().await;
            return Err(e.into());
        }
        // Only the first start gets here, the lifecycle guard above rejects the rest.
        drop(self.inner.config.set(config.clone()));

        match self.inner.run_start(config).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.abandon_start().await;
                Err(e)
            }
        }
    }

    /// Release everything in reverse order of acquisition. Every resource is attempted even
    /// when an earlier one fails, failures come back aggregated in a `ShutdownError`.
    pub async fn stop(&self) -> Result<(), StopError> {
        let previous = {
            let mut lifecycle = lock(&self.inner.lifecycle);
            let previous = *lifecycle;
            *lifecycle = Lifecycle::Stopped;
            previous
        };
        match previous {
            Lifecycle::Stopped => return Err(LifecycleError::AlreadyStopped.into()),
            Lifecycle::Created => {
                self.inner.shutdown.cancel();
                self.inner.mark_stopped();
                info!("connection manager stopped before it was started");
                return Ok(());
            }
            Lifecycle::Started => {}
        }

        info!("stopping connection manager");
        self.inner.shutdown.cancel();
        // Stop new work right away if the pool is already up.
        self.inner.close_intake();
        let _started = self.inner.start_lock.lock().await;

        let failures = self.inner.release().await;
        self.inner.mark_stopped();

        if failures.is_empty() {
            info!("connection manager stopped");
            Ok(())
        } else {
            let error = ShutdownError { failures };
            error!(error = %error, "connection manager stopped with failures");
            Err(error.into())
        }
    }

    /// Last known health, derived from the published state. Never touches the network.
    pub fn healthcheck(&self) -> HealthStatus {
        self.inner.state.borrow().health()
    }

    /// A check to register with a `health::HealthRegistry`.
    pub fn health_check(&self) -> ConnectivityCheck {
        ConnectivityCheck::new(self.inner.state.subscribe())
    }

    pub fn state(&self) -> StateSnapshot {
        self.inner.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<StateSnapshot> {
        self.inner.state.subscribe()
    }

    pub fn connection(&self) -> ConnectionHandle<C::Connection> {
        ConnectionHandle::new(self.inner.connection.subscribe())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Submission handle for the worker pool, `None` until the pool exists and after stop.
    pub fn workers(&self) -> Option<WorkerHandle> {
        lock(&self.inner.workers).clone()
    }

    pub fn pool_probe(&self) -> Option<PoolProbe> {
        self.workers().map(|w| w.probe())
    }

    /// Register a consumer to bind on every new connection. If the manager is already
    /// connected the consumer is bound immediately, a failure degrades health.
    pub async fn register_consumer(
        &self,
        consumer: SharedConsumer<C>,
    ) -> Result<(), LifecycleError> {
        let _binding = self.inner.bind_lock.lock().await;
        if *lock(&self.inner.lifecycle) == Lifecycle::Stopped {
            return Err(LifecycleError::AlreadyStopped);
        }
        lock(&self.inner.consumers).push(consumer.clone());
        debug!(consumer = consumer.name(), "consumer registered");

        // While starting or reconnecting, the pending bind pass picks the consumer up.
        let connected = self.inner.state.borrow().state == ConnectionState::Connected;
        if !connected {
            return Ok(());
        }
        let connection = self.inner.connection.borrow().clone();
        let workers = lock(&self.inner.workers).clone();
        if let (Some(connection), Some(workers)) = (connection, workers) {
            if !self.inner.bind_consumer(&consumer, connection, workers).await {
                let name = consumer.name().to_owned();
                self.inner
                    .state
                    .send_modify(|s| s.unbound_consumers.push(name));
            }
        }
        Ok(())
    }
}

impl<C: Connector> Inner<C> {
    async fn run_start(self: &Arc<Self>, config: &RmqConfig) -> Result<(), ConnectionError> {
        self.transition(ConnectionState::Starting, |_| {});
        info!(
            brokers = config.brokers.len(),
            attempts = config.initial_connect_attempts,
            "connecting to broker"
        );

        let policy = config.retry_policy();
        let (session, index) = self.connect_initial(config, &policy).await?;
        let connection = session.connection.clone();
        self.connection.send_replace(Some(connection.clone()));

        let pool = self
            .pool_factory
            .new_fixed_pool(WORKER_POOL_NAME, config.thread_pool_size, self.metrics.clone())?;
        let workers = pool.handle();
        *lock(&self.pool) = Some(pool);
        *lock(&self.workers) = Some(workers.clone());

        if self.shutdown.is_cancelled() {
            return Err(ConnectionError::Aborted);
        }

        let binding = self.bind_lock.lock().await;
        let unbound = self.bind_consumers(&connection, &workers).await;
        if self.shutdown.is_cancelled() {
            return Err(ConnectionError::Aborted);
        }

        let broker = self.broker_name(config, index);
        self.transition(ConnectionState::Connected, |s| {
            s.broker = Some(broker.clone());
            s.attempt = 0;
            s.unbound_consumers = unbound;
            s.last_error = None;
        });
        drop(binding);
        self.emit(ConnectionEvent::Connected { broker });

        let supervisor = tokio::spawn(supervise(
            self.clone(),
            config.clone(),
            session.disconnected,
            workers,
            index,
        ));
        *lock(&self.supervisor) = Some(supervisor);
        Ok(())
    }

    async fn connect_initial(
        &self,
        config: &RmqConfig,
        policy: &RetryPolicy,
    ) -> Result<(Session<C::Connection>, u32), ConnectionError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let index = attempt - 1;
            let Some(result) = self.attempt_connect(config, index, attempt).await else {
                return Err(ConnectionError::Aborted);
            };
            match result {
                Ok(session) => return Ok((session, index)),
                Err(last) if attempt >= config.initial_connect_attempts => {
                    error!(attempts = attempt, error = %last, "initial connection attempts exhausted");
                    return Err(ConnectionError::Exhausted {
                        attempts: attempt,
                        last,
                    });
                }
                Err(e) => {
                    self.state
                        .send_modify(|s| s.last_error = Some(e.to_string()));
                    if !self.sleep(policy.backoff(attempt)).await {
                        return Err(ConnectionError::Aborted);
                    }
                }
            }
        }
    }

    /// One bounded connection attempt against the broker picked by `index`.
    /// Returns `None` when the manager is shutting down.
    async fn attempt_connect(
        &self,
        config: &RmqConfig,
        index: u32,
        attempt: u32,
    ) -> Option<Result<Session<C::Connection>, BrokerError>> {
        let Some(broker) = config.brokers.for_attempt(index) else {
            return Some(Err(BrokerError::Unreachable("no broker configured".to_string())));
        };
        let broker_name = broker.to_string();
        let timeout = config.connect_timeout();
        let started = Instant::now();

        debug!(broker = %broker_name, attempt, "attempting broker connection");
        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return None,
            result = tokio::time::timeout(timeout, self.connector.connect(config, broker)) => {
                result.unwrap_or(Err(BrokerError::Timeout(timeout)))
            }
        };

        let outcome = if result.is_ok() { "success" } else { "failure" };
        let attempt_labels = labels([("broker", broker_name.as_str()), ("outcome", outcome)]);
        self.metrics.increment(CONNECTION_ATTEMPTS, &attempt_labels);
        self.metrics
            .record_duration(CONNECTION_ATTEMPT_DURATION, &attempt_labels, started.elapsed());

        match &result {
            Ok(_) => info!(broker = %broker_name, attempt, "connected to broker"),
            Err(e) => warn!(broker = %broker_name, attempt, error = %e, "broker connection attempt failed"),
        }
        Some(result)
    }

    /// Back off between attempts, returns false if shutdown started meanwhile.
    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Reconnect after a disconnect. Returns the listener for the new connection and the
    /// broker index it was made against, or `None` when shutting down or out of attempts.
    async fn reconnect(
        &self,
        config: &RmqConfig,
        policy: &RetryPolicy,
        workers: &WorkerHandle,
        last_index: u32,
    ) -> Option<(DisconnectListener, u32)> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if !policy.allows_attempt(attempt) {
                let attempts = attempt - 1;
                error!(attempts, "reconnect attempts exhausted, giving up on the broker");
                self.metrics.increment(RECONNECTS_EXHAUSTED, &[]);
                self.emit(ConnectionEvent::ReconnectExhausted { attempts });
                return None;
            }

            if !self.sleep(policy.backoff(attempt)).await {
                return None;
            }
            if !self.transition(ConnectionState::Reconnecting, |s| s.attempt = attempt) {
                return None;
            }
            self.emit(ConnectionEvent::Reconnecting { attempt });

            // Start from the broker after the one we lost.
            let index = last_index.wrapping_add(attempt);
            let session = match self.attempt_connect(config, index, attempt).await? {
                Ok(session) => session,
                Err(e) => {
                    self.metrics
                        .increment(RECONNECTS, &labels([("outcome", "failure")]));
                    self.transition(ConnectionState::Disconnected, |s| {
                        s.last_error = Some(e.to_string());
                    });
                    continue;
                }
            };

            let connection = session.connection.clone();
            let binding = self.bind_lock.lock().await;
            self.connection.send_replace(Some(connection.clone()));
            let unbound = self.bind_consumers(&connection, workers).await;

            let broker = self.broker_name(config, index);
            let connected = !self.shutdown.is_cancelled()
                && self.transition(ConnectionState::Connected, |s| {
                    s.broker = Some(broker.clone());
                    s.attempt = 0;
                    s.unbound_consumers = unbound;
                    s.last_error = None;
                });
            drop(binding);
            if !connected {
                // Stopping, the new connection is closed by `release`.
                return None;
            }
            self.metrics
                .increment(RECONNECTS, &labels([("outcome", "success")]));
            self.emit(ConnectionEvent::Connected { broker });
            info!(attempt, "reconnected to broker");
            return Some((session.disconnected, index));
        }
    }

    async fn bind_consumers(
        &self,
        connection: &Arc<C::Connection>,
        workers: &WorkerHandle,
    ) -> Vec<String> {
        let consumers = lock(&self.consumers).clone();
        let mut unbound = Vec::new();
        for consumer in consumers {
            if !self
                .bind_consumer(&consumer, connection.clone(), workers.clone())
                .await
            {
                unbound.push(consumer.name().to_owned());
            }
        }
        unbound
    }

    /// Bind one consumer, bounded by the connect timeout. Shutdown interrupts the bind and
    /// leaves the consumer unbound.
    async fn bind_consumer(
        &self,
        consumer: &SharedConsumer<C>,
        connection: Arc<C::Connection>,
        workers: WorkerHandle,
    ) -> bool {
        let timeout = self.connect_timeout();
        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                debug!(consumer = consumer.name(), "consumer bind interrupted by shutdown");
                return false;
            }
            result = tokio::time::timeout(timeout, consumer.bind(connection, workers)) => {
                result.unwrap_or(Err(BrokerError::Timeout(timeout)))
            }
        };
        let bound = match result {
            Ok(()) => {
                debug!(consumer = consumer.name(), "consumer bound");
                true
            }
            Err(e) => {
                warn!(consumer = consumer.name(), error = %e, "failed to bind consumer");
                false
            }
        };
        let outcome = if bound { "success" } else { "failure" };
        self.metrics.increment(
            CONSUMER_BINDS,
            &labels([("consumer", consumer.name()), ("outcome", outcome)]),
        );
        bound
    }

    /// Replace the published connection with nothing and close the stale one. Errors are
    /// expected here, the link is already gone.
    async fn discard_connection(&self, timeout: Duration) {
        let stale = self.connection.send_replace(None);
        let Some(stale) = stale else {
            return;
        };
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => debug!("abandoned stale connection on shutdown"),
            result = tokio::time::timeout(timeout, stale.close()) => match result {
                Ok(Ok(())) => debug!("closed stale connection"),
                Ok(Err(e)) => debug!(error = %e, "failed to close stale connection"),
                Err(_) => debug!("timed out closing stale connection"),
            },
        }
    }

    fn connect_timeout(&self) -> Duration {
        self.config
            .get()
            .map_or_else(|| RmqConfig::default().connect_timeout(), RmqConfig::connect_timeout)
    }

    fn close_intake(&self) {
        let pool = lock(&self.pool);
        if let Some(pool) = pool.as_ref() {
            pool.close();
        }
    }

    /// Phase 1 closes intake, phase 2 stops the supervisor and drains the pool, phase 3
    /// closes the connection. Idempotent, every call only releases what is still held.
    ///
    /// The supervisor and the pool share one grace period.
    async fn release(&self) -> Vec<ResourceFailure> {
        let config = self.config.get().cloned().unwrap_or_default();
        let grace = config.shutdown_grace_period();
        let deadline = tokio::time::Instant::now() + grace;
        let mut failures = Vec::new();

        self.close_intake();
        drop(lock(&self.workers).take());

        let supervisor = lock(&self.supervisor).take();
        if let Some(mut supervisor) = supervisor {
            match tokio::time::timeout_at(deadline, &mut supervisor).await {
                Ok(Ok(())) => debug!("supervisor stopped"),
                Ok(Err(e)) => failures.push(ResourceFailure {
                    resource: "supervisor",
                    reason: e.to_string(),
                }),
                Err(_) => {
                    supervisor.abort();
                    failures.push(ResourceFailure {
                        resource: "supervisor",
                        reason: format!("did not stop within {grace:?}"),
                    });
                }
            }
        }

        let pool = lock(&self.pool).take();
        if let Some(pool) = pool {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            info!(pool = pool.name(), grace_ms = remaining.as_millis() as u64, "draining worker pool");
            if let Err(e) = pool.shutdown(remaining).await {
                failures.push(ResourceFailure {
                    resource: "worker-pool",
                    reason: e.to_string(),
                });
            }
        }

        let connection = self.connection.send_replace(None);
        if let Some(connection) = connection {
            let result = tokio::time::timeout(config.connect_timeout(), connection.close())
                .await
                .unwrap_or(Err(BrokerError::Timeout(config.connect_timeout())));
            match result {
                Ok(()) => info!("broker connection closed"),
                Err(e) => failures.push(ResourceFailure {
                    resource: "connection",
                    reason: e.to_string(),
                }),
            }
        }

        for failure in &failures {
            warn!(resource = failure.resource, reason = %failure.reason, "failed to release resource");
            self.metrics.increment(
                SHUTDOWN_FAILURES,
                &labels([("resource", failure.resource)]),
            );
        }
        failures
    }

    /// Undo a failed start, unless a concurrent stop already owns the teardown.
    async fn abandon_start(&self) {
        let owned = {
            let mut lifecycle = lock(&self.lifecycle);
            if *lifecycle == Lifecycle::Started {
                *lifecycle = Lifecycle::Stopped;
                true
            } else {
                false
            }
        };
        if !owned {
            return;
        }
        self.shutdown.cancel();
        let failures = self.release().await;
        if !failures.is_empty() {
            warn!(failures = failures.len(), "failed start left resources behind");
        }
        self.mark_stopped();
    }

    fn mark_stopped(&self) {
        self.transition(ConnectionState::Stopped, |s| {
            s.broker = None;
            s.unbound_consumers.clear();
        });
        self.emit(ConnectionEvent::Stopped);
    }

    /// Apply a state transition, rejecting and logging illegal ones.
    fn transition(&self, next: ConnectionState, update: impl FnOnce(&mut StateSnapshot)) -> bool {
        let mut applied = false;
        self.state.send_if_modified(|snapshot| {
            if !snapshot.state.can_transition_to(next) {
                warn!(from = %snapshot.state, to = %next, "rejected illegal state transition");
                return false;
            }
            debug!(from = %snapshot.state, to = %next, "state transition");
            snapshot.state = next;
            update(snapshot);
            applied = true;
            true
        });
        applied
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        drop(self.events.send(event));
    }

    fn broker_name(&self, config: &RmqConfig, index: u32) -> String {
        config
            .brokers
            .for_attempt(index)
            .map(ToString::to_string)
            .unwrap_or_default()
    }
}

/// Watches the live connection and reconnects when it drops, until shutdown or until the
/// reconnect budget runs out.
async fn supervise<C: Connector>(
    inner: Arc<Inner<C>>,
    config: RmqConfig,
    mut disconnected: DisconnectListener,
    workers: WorkerHandle,
    mut index: u32,
) {
    let policy = config.retry_policy();
    loop {
        let reason = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => return,
            reason = disconnected.wait() => reason,
        };

        warn!(reason = %reason, "broker connection lost");
        inner.metrics.increment(DISCONNECTS, &[]);
        if !inner.transition(ConnectionState::Disconnected, |s| {
            s.broker = None;
            s.unbound_consumers.clear();
            s.last_error = Some(reason.clone());
        }) {
            return;
        }
        inner.emit(ConnectionEvent::Disconnected { reason });
        inner.discard_connection(config.connect_timeout()).await;

        match inner.reconnect(&config, &policy, &workers, index).await {
            Some((listener, connected_index)) => {
                disconnected = listener;
                index = connected_index;
            }
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnector;

    fn fast_config() -> RmqConfig {
        RmqConfig {
            thread_pool_size: 2,
            initial_connect_attempts: 2,
            connect_timeout_ms: 200,
            reconnect_min_backoff_ms: 5,
            reconnect_max_backoff_ms: 20,
            reconnect_jitter: false,
            shutdown_grace_period_ms: 500,
            ..RmqConfig::default()
        }
    }

    #[tokio::test]
    async fn test_illegal_transition_is_rejected() {
        let manager = ConnectionManager::new(MockConnector::new());
        assert!(!manager
            .inner
            .transition(ConnectionState::Connected, |_| {}));
        assert_eq!(manager.state().state, ConnectionState::Created);

        assert!(manager.inner.transition(ConnectionState::Starting, |_| {}));
        assert_eq!(manager.state().state, ConnectionState::Starting);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_start() {
        let connector = MockConnector::new();
        let manager = ConnectionManager::new(connector.clone());
        let config = RmqConfig {
            thread_pool_size: 0,
            ..fast_config()
        };

        assert!(matches!(
            manager.start(&config).await,
            Err(ConnectionError::InvalidConfig(_))
        ));
        assert_eq!(connector.connect_attempts(), 0);
        assert_eq!(manager.state().state, ConnectionState::Stopped);
        assert_eq!(
            manager.stop().await,
            Err(StopError::Lifecycle(LifecycleError::AlreadyStopped))
        );
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let manager = ConnectionManager::new(MockConnector::new());
        assert_eq!(manager.stop().await, Ok(()));
        assert_eq!(manager.state().state, ConnectionState::Stopped);
        assert!(matches!(
            manager.start(&fast_config()).await,
            Err(ConnectionError::Lifecycle(LifecycleError::AlreadyStopped))
        ));
    }

    #[tokio::test]
    async fn test_dropping_last_clone_cancels_background_work() {
        let connector = MockConnector::new();
        let manager = ConnectionManager::new(connector.clone());
        manager.start(&fast_config()).await.unwrap();
        let probe = manager.pool_probe().unwrap();
        let token = manager.inner.shutdown.clone();

        let clone = manager.clone();
        drop(manager);
        assert!(!token.is_cancelled());
        drop(clone);
        assert!(token.is_cancelled());

        for _ in 0..200 {
            if probe.live_workers() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("worker threads still running after the manager was dropped");
    }
}
