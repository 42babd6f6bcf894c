//! Runtime-configurable tuning parameters for proxima.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `PROXIMA_`) or by constructing a custom `ProximaConfig`.

use std::time::Duration;

/// Tuning parameters for the trigger fifo, proxy loop, and transports.
#[derive(Debug, Clone)]
pub struct ProximaConfig {
    /// Number of trigger slots per fifo. Rounded up to a power of two.
    pub fifo_capacity: usize,

    /// Timeout for `Connection::flush` and `update_and_sync`.
    pub flush_timeout: Duration,

    /// Default timeout for host-side `Semaphore::wait`.
    pub wait_timeout: Duration,

    /// Maximum regions concurrently bound to one multicast group.
    pub multicast_bind_capacity: usize,

    /// Poll iterations the proxy worker spins before yielding the CPU
    /// when its fifo is empty.
    pub proxy_spin_iters: u32,
}

impl Default for ProximaConfig {
    fn default() -> Self {
        Self {
            fifo_capacity: 128,
            flush_timeout: Duration::from_secs(5),
            wait_timeout: Duration::from_secs(30),
            multicast_bind_capacity: 2,
            proxy_spin_iters: 1000,
        }
    }
}

impl ProximaConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `PROXIMA_FIFO_CAPACITY`
    /// - `PROXIMA_FLUSH_TIMEOUT_MS`
    /// - `PROXIMA_WAIT_TIMEOUT_MS`
    /// - `PROXIMA_MCAST_BIND_CAPACITY`
    /// - `PROXIMA_PROXY_SPIN_ITERS`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("PROXIMA_FIFO_CAPACITY") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.fifo_capacity = n;
            }
        }
        if let Ok(v) = std::env::var("PROXIMA_FLUSH_TIMEOUT_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                cfg.flush_timeout = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = std::env::var("PROXIMA_WAIT_TIMEOUT_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                cfg.wait_timeout = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = std::env::var("PROXIMA_MCAST_BIND_CAPACITY") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.multicast_bind_capacity = n;
            }
        }
        if let Ok(v) = std::env::var("PROXIMA_PROXY_SPIN_ITERS") {
            if let Ok(n) = v.parse::<u32>() {
                cfg.proxy_spin_iters = n;
            }
        }

        cfg
    }
}
