//! Configuration consumed by the raw server

use std::net::IpAddr;
use std::time::Duration;

/// How a connection hands queued bytes to its transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteStrategy {
    /// Bytes wait in an `OutputBuffer` until the transport pulls them.
    #[default]
    Pull,
    /// Bytes go straight to the transport, which reports when its own
    /// buffer drains. Only used when the transport supports it.
    Push,
}

/// Options for a `RawServer`
#[derive(Debug, Clone)]
pub struct Config {
    /// Inactivity period after which a stream connection is dropped.
    /// `Duration::ZERO` disables the idle timeout.
    pub socket_timeout: Duration,
    /// Ceiling on distinct destination IPs with an outbound attempt in flight.
    pub max_incomplete: usize,
    /// Close with SO_LINGER(0), i.e. RST instead of FIN.
    pub close_with_rst: bool,
    /// Default local address for outbound connections.
    pub bind: Option<IpAddr>,
    /// Limit for a single outbound connect attempt.
    pub connect_timeout: Duration,
    /// Time `listen_forever` gives closing streams after `stop`.
    pub shutdown_grace: Duration,
    pub write_strategy: WriteStrategy,
    pub read_buffer_size: usize,
    /// IP Type-of-Service applied to outbound connections.
    pub tos: u32,
    /// Log handler faults that have no context to report to.
    pub noisy: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_timeout: Duration::from_secs(300),
            max_incomplete: 8,
            close_with_rst: false,
            bind: None,
            connect_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(2),
            write_strategy: WriteStrategy::Pull,
            read_buffer_size: 64 * 1024,
            tos: 0,
            noisy: true,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn with_max_incomplete(mut self, max: usize) -> Self {
        self.max_incomplete = max;
        self
    }

    pub fn with_close_with_rst(mut self, rst: bool) -> Self {
        self.close_with_rst = rst;
        self
    }

    pub fn with_bind(mut self, bind: IpAddr) -> Self {
        self.bind = Some(bind);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_write_strategy(mut self, strategy: WriteStrategy) -> Self {
        self.write_strategy = strategy;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    pub fn with_tos(mut self, tos: u32) -> Self {
        self.tos = tos;
        self
    }

    pub fn with_noisy(mut self, noisy: bool) -> Self {
        self.noisy = noisy;
        self
    }

    /// Idle timeout, if enabled.
    pub(crate) fn idle_timeout(&self) -> Option<Duration> {
        (!self.socket_timeout.is_zero()).then_some(self.socket_timeout)
    }
}
