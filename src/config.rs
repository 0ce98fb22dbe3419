//! Engine configuration.
//!
//! One value injected at the composition root; components never read
//! environment or globals themselves.

use std::time::Duration;

use crate::store::RetryPolicy;

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Address the WebSocket listener binds to
    pub bind_addr: String,
    /// Accept connections without a token (development mode).
    /// In strict mode (false) a missing token is rejected with 401.
    pub permissive_auth: bool,
    /// Quiet period before a dirty room's snapshot is written
    pub debounce: Duration,
    /// Grace period before an empty room is destroyed
    pub idle_eviction: Duration,
    /// Outbound frames buffered per client before it is disconnected
    pub client_queue_capacity: usize,
    /// Hard deadline for the shutdown flush
    pub shutdown_deadline: Duration,
    /// Retry policy for background snapshot writes
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            permissive_auth: false,
            debounce: Duration::from_millis(300),
            idle_eviction: Duration::from_secs(300),
            client_queue_capacity: 256,
            shutdown_deadline: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}
