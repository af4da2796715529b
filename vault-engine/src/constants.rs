use std::time::Duration;

/// How long the manager waits for a spawned worker to appear in (or
/// disappear from) the service registry.
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period for in-flight RPCs during a graceful shutdown.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How long to wait for a terminated worker's container to stop before
/// asking the spawner to remove it.
pub const CONTAINER_STOP_TIMEOUT: Duration = Duration::from_secs(10);
