//! Lifecycle management for a RabbitMQ connection: a single supervised connection, a fixed
//! pool of worker threads for consumer callbacks, and a health check derived from the
//! connection state.

pub mod amqp;
pub mod config;
pub mod connector;
pub mod error;
pub mod manager;
pub mod metrics_consts;
pub mod metrics_sink;
pub mod mock;
pub mod pool;
pub mod retry;
pub mod state;

mod util;

pub use amqp::{AmqpConnection, AmqpConnector};
pub use config::{Broker, BrokerList, HostConfig, RmqConfig};
pub use connector::{BrokerConnection, ConnectionHandle, Connector, Consumer, Session};
pub use error::{
    BrokerError, ConnectionError, LifecycleError, PoolError, ShutdownError, StopError, TaskError,
};
pub use manager::{ConnectionEvent, ConnectionManager, ConnectionManagerBuilder};
pub use metrics_sink::{MetricsSink, NoopMetricsSink, RecorderMetricsSink};
pub use pool::{
    DefaultWorkerPoolFactory, InstrumentedWorkerPoolFactory, TaskHandle, WorkerHandle,
    WorkerPool, WorkerPoolFactory,
};
pub use state::{ConnectionState, ConnectivityCheck, StateSnapshot};
