use std::time::Duration;

/// Default database path.
pub const DB_PATH: &str = "/var/lib/mvirt/tunnel/tunnels.db";

/// Default iproute2 binary.
pub const IP_BINARY: &str = "ip";

/// Default per-command wall-clock timeout.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time to wait for another operation on the same interface.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Process executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub timeout: Duration,
    /// Run commands through `sudo -n`.
    pub sudo: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout: COMMAND_TIMEOUT,
            sudo: false,
        }
    }
}

/// Reconciliation engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long an operation waits for the interface lock before failing with `Busy`.
    pub lock_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: LOCK_TIMEOUT,
        }
    }
}
