pub const CONNECTION_ATTEMPTS: &str = "rmq_connection_attempts_total";
pub const CONNECTION_ATTEMPT_DURATION: &str = "rmq_connection_attempt_duration_ms";
pub const DISCONNECTS: &str = "rmq_disconnects_total";
pub const RECONNECTS: &str = "rmq_reconnects_total";
pub const RECONNECTS_EXHAUSTED: &str = "rmq_reconnects_exhausted_total";
pub const CONSUMER_BINDS: &str = "rmq_consumer_binds_total";
pub const SHUTDOWN_FAILURES: &str = "rmq_shutdown_failures_total";

pub const TASKS_SUBMITTED: &str = "rmq_worker_tasks_submitted_total";
pub const TASKS_COMPLETED: &str = "rmq_worker_tasks_completed_total";
pub const TASK_DURATION: &str = "rmq_worker_task_duration_ms";
pub const WORKERS_BUSY: &str = "rmq_worker_pool_busy";
