//! In-memory broker for tests and for hosts that want to exercise their wiring without a
//! running RabbitMQ.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::config::{Broker, RmqConfig};
use crate::connector::{
    disconnect_channel, BrokerConnection, Connector, DisconnectNotifier, Session,
};
use crate::error::BrokerError;
use crate::metrics_sink::{Labels, MetricsSink};
use crate::util::lock;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockCall {
    Connect { broker: String },
    Close { connection: usize },
}

#[derive(Default)]
struct Settings {
    unavailable: bool,
    failing_brokers: HashSet<String>,
    connect_delay: Duration,
    fail_close: bool,
}

struct Link {
    id: usize,
    open: AtomicBool,
    closed_at: Mutex<Option<Instant>>,
    notifier: DisconnectNotifier,
}

#[derive(Default)]
struct MockBroker {
    settings: Mutex<Settings>,
    calls: Mutex<Vec<MockCall>>,
    links: Mutex<Vec<Arc<Link>>>,
    next_id: AtomicUsize,
}

/// Connector whose broker availability and failures are driven by the test.
#[derive(Clone, Default)]
pub struct MockConnector {
    broker: Arc<MockBroker>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every broker (un)reachable for subsequent attempts.
    pub fn set_available(&self, available: bool) {
        lock(&self.broker.settings).unavailable = !available;
    }

    /// Make a single `host:port` unreachable.
    pub fn fail_broker(&self, broker: &str) {
        lock(&self.broker.settings)
            .failing_brokers
            .insert(broker.to_owned());
    }

    pub fn heal_broker(&self, broker: &str) {
        lock(&self.broker.settings).failing_brokers.remove(broker);
    }

    /// Delay every connection attempt, e.g. to race `stop` against `start`.
    pub fn set_connect_delay(&self, delay: Duration) {
        lock(&self.broker.settings).connect_delay = delay;
    }

    pub fn set_fail_close(&self, fail: bool) {
        lock(&self.broker.settings).fail_close = fail;
    }

    /// Simulate the broker dropping the most recent open connection.
    /// Returns false if there was no open connection to drop.
    pub fn drop_connection(&self, reason: &str) -> bool {
        let link = lock(&self.broker.links)
            .iter()
            .rev()
            .find(|l| l.open.load(Ordering::SeqCst))
            .cloned();
        match link {
            Some(link) => {
                link.open.store(false, Ordering::SeqCst);
                link.notifier.notify(reason);
                true
            }
            None => false,
        }
    }

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.broker.calls).clone()
    }

    pub fn connect_attempts(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, MockCall::Connect { .. }))
            .count()
    }

    pub fn attempted_brokers(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::Connect { broker } => Some(broker),
                MockCall::Close { .. } => None,
            })
            .collect()
    }

    pub fn connections_made(&self) -> usize {
        lock(&self.broker.links).len()
    }

    /// Connections neither dropped by the broker nor closed by the client.
    pub fn open_connections(&self) -> usize {
        lock(&self.broker.links)
            .iter()
            .filter(|l| l.open.load(Ordering::SeqCst))
            .count()
    }

    /// When the client last closed a connection successfully.
    pub fn last_closed_at(&self) -> Option<Instant> {
        lock(&self.broker.links)
            .iter()
            .filter_map(|l| *lock(&l.closed_at))
            .max()
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Connection = MockConnection;

    async fn connect(
        &self,
        _config: &RmqConfig,
        broker: &Broker,
    ) -> Result<Session<MockConnection>, BrokerError> {
        let name = broker.to_string();
        lock(&self.broker.calls).push(MockCall::Connect {
            broker: name.clone(),
        });

        let delay = lock(&self.broker.settings).connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let reachable = {
            let settings = lock(&self.broker.settings);
            !settings.unavailable && !settings.failing_brokers.contains(&name)
        };
        if !reachable {
            return Err(BrokerError::Unreachable(name));
        }

        let (notifier, listener) = disconnect_channel();
        let link = Arc::new(Link {
            id: self.broker.next_id.fetch_add(1, Ordering::SeqCst),
            open: AtomicBool::new(true),
            closed_at: Mutex::new(None),
            notifier,
        });
        lock(&self.broker.links).push(link.clone());

        Ok(Session::new(
            MockConnection {
                broker: name,
                link,
                mock: self.broker.clone(),
            },
            listener,
        ))
    }
}

pub struct MockConnection {
    broker: String,
    link: Arc<Link>,
    mock: Arc<MockBroker>,
}

impl MockConnection {
    pub fn id(&self) -> usize {
        self.link.id
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }
}

#[async_trait]
impl BrokerConnection for MockConnection {
    fn is_open(&self) -> bool {
        self.link.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        lock(&self.mock.calls).push(MockCall::Close {
            connection: self.link.id,
        });
        if lock(&self.mock.settings).fail_close {
            return Err(BrokerError::Broker("close rejected by broker".to_string()));
        }
        if !self.link.open.swap(false, Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        *lock(&self.link.closed_at) = Some(Instant::now());
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedSample {
    pub name: &'static str,
    pub labels: Vec<(String, String)>,
    pub value: f64,
}

/// Metrics sink that keeps every sample in memory.
#[derive(Default)]
pub struct RecordingMetricsSink {
    counters: Mutex<Vec<RecordedSample>>,
    durations: Mutex<Vec<RecordedSample>>,
    gauges: Mutex<Vec<RecordedSample>>,
}

impl RecordingMetricsSink {
    pub fn count(&self, name: &str) -> usize {
        lock(&self.counters)
            .iter()
            .filter(|s| s.name == name)
            .count()
    }

    pub fn count_with(&self, name: &str, label: (&str, &str)) -> usize {
        lock(&self.counters)
            .iter()
            .filter(|s| s.name == name && has_label(&s.labels, label))
            .count()
    }

    pub fn durations(&self, name: &str) -> Vec<Duration> {
        lock(&self.durations)
            .iter()
            .filter(|s| s.name == name)
            .map(|s| Duration::from_secs_f64(s.value))
            .collect()
    }

    pub fn last_gauge(&self, name: &str) -> Option<f64> {
        lock(&self.gauges)
            .iter()
            .rev()
            .find(|s| s.name == name)
            .map(|s| s.value)
    }
}

fn has_label(labels: &[(String, String)], (key, value): (&str, &str)) -> bool {
    labels.iter().any(|(k, v)| k == key && v == value)
}

impl MetricsSink for RecordingMetricsSink {
    fn increment(&self, name: &'static str, labels: &Labels) {
        lock(&self.counters).push(RecordedSample {
            name,
            labels: labels.to_vec(),
            value: 1.0,
        });
    }

    fn record_duration(&self, name: &'static str, labels: &Labels, duration: Duration) {
        lock(&self.durations).push(RecordedSample {
            name,
            labels: labels.to_vec(),
            value: duration.as_secs_f64(),
        });
    }

    fn gauge(&self, name: &'static str, labels: &Labels, value: f64) {
        lock(&self.gauges).push(RecordedSample {
            name,
            labels: labels.to_vec(),
            value,
        });
    }
}
