use std::time::Duration;

/// Client-side bus configuration.
///
/// Port naming follows the relay's point of view everywhere in this crate:
/// the relay publishes on `outbound_port` (clients subscribe there) and
/// receives on `inbound_port` (clients publish there).
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Relay host to connect to
    pub host: String,

    /// Port the relay publishes on; clients subscribe here
    pub outbound_port: u16,

    /// Port the relay receives on; clients publish here
    pub inbound_port: u16,

    /// Role tag stamped into the `comp_type` field of outgoing envelopes
    pub comp_type: String,

    /// Sleep between subscription polls while waiting for a reply
    pub poll_interval: Duration,

    /// Default wait for a terminal reply in `send_command`
    pub command_timeout: Duration,

    /// Per-attempt wait for an ACK in `send_command_until`
    pub attempt_timeout: Duration,

    /// Pause between attempts in `send_command_until`
    pub retry_interval: Duration,

    /// Overall deadline across all attempts in `send_command_until`
    pub overall_timeout: Duration,

    /// TCP connect timeout
    pub connect_timeout: Duration,
}

impl BusConfig {
    /// Create a client configuration for a relay at `host`.
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            outbound_port: 5555,
            inbound_port: 5556,
            comp_type: crate::core::DEFAULT_COMP_TYPE.to_string(),
            poll_interval: Duration::from_millis(10),
            command_timeout: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(2),
            retry_interval: Duration::from_millis(500),
            overall_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Set the relay's publish port
    pub fn outbound_port(mut self, port: u16) -> Self {
        self.outbound_port = port;
        self
    }

    /// Set the relay's receive port
    pub fn inbound_port(mut self, port: u16) -> Self {
        self.inbound_port = port;
        self
    }

    /// Set the role tag for outgoing envelopes
    pub fn comp_type(mut self, comp_type: &str) -> Self {
        self.comp_type = comp_type.to_string();
        self
    }

    /// Set the wait-loop poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the default reply timeout
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the per-attempt timeout for retried commands
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Set the pause between retry attempts
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the overall deadline for retried commands
    pub fn overall_timeout(mut self, timeout: Duration) -> Self {
        self.overall_timeout = timeout;
        self
    }

    /// Set the TCP connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Address of the relay's publish side, e.g. `"localhost:5555"`.
    pub fn outbound_addr(&self) -> String {
        format!("{}:{}", self.host, self.outbound_port)
    }

    /// Address of the relay's receive side, e.g. `"localhost:5556"`.
    pub fn inbound_addr(&self) -> String {
        format!("{}:{}", self.host, self.inbound_port)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("host cannot be empty".to_string());
        }

        if self.outbound_port == 0 || self.inbound_port == 0 {
            return Err("ports must be > 0".to_string());
        }

        if self.outbound_port == self.inbound_port {
            return Err("outbound and inbound ports must differ".to_string());
        }

        if self.comp_type.is_empty() {
            return Err("comp_type cannot be empty".to_string());
        }

        if self.poll_interval.is_zero() {
            return Err("poll_interval must be > 0".to_string());
        }

        if self.retry_interval.is_zero() {
            return Err("retry_interval must be > 0".to_string());
        }

        Ok(())
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::new("localhost")
    }
}

/// Relay-side configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Interface to bind on
    pub host: String,

    /// Port the relay publishes on; clients subscribe here
    pub outbound_port: u16,

    /// Port the relay receives on; clients publish here
    pub inbound_port: u16,

    /// Receive poll timeout of the relay loop; stop requests and eviction
    /// sweeps are serviced at this granularity when the bus is idle
    pub poll_interval: Duration,

    /// How often the relay sweeps the ledger for expired rows
    pub sweep_interval: Duration,

    /// How long a finished command row stays visible before eviction
    pub finished_grace: Duration,
}

impl RelayConfig {
    /// Create a relay configuration bound to `host`.
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            outbound_port: 5555,
            inbound_port: 5556,
            poll_interval: Duration::from_millis(100),
            sweep_interval: Duration::from_millis(500),
            finished_grace: Duration::from_secs(10),
        }
    }

    /// Set the publish port
    pub fn outbound_port(mut self, port: u16) -> Self {
        self.outbound_port = port;
        self
    }

    /// Set the receive port
    pub fn inbound_port(mut self, port: u16) -> Self {
        self.inbound_port = port;
        self
    }

    /// Set the relay loop poll timeout
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the eviction sweep interval
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the grace period for finished command rows
    pub fn finished_grace(mut self, grace: Duration) -> Self {
        self.finished_grace = grace;
        self
    }

    /// Bind address of the publish side.
    pub fn outbound_addr(&self) -> String {
        format!("{}:{}", self.host, self.outbound_port)
    }

    /// Bind address of the receive side.
    pub fn inbound_addr(&self) -> String {
        format!("{}:{}", self.host, self.inbound_port)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("host cannot be empty".to_string());
        }

        if self.outbound_port == 0 || self.inbound_port == 0 {
            return Err("ports must be > 0".to_string());
        }

        if self.outbound_port == self.inbound_port {
            return Err("outbound and inbound ports must differ".to_string());
        }

        if self.poll_interval.is_zero() {
            return Err("poll_interval must be > 0".to_string());
        }

        if self.sweep_interval.is_zero() {
            return Err("sweep_interval must be > 0".to_string());
        }

        Ok(())
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::new("0.0.0.0")
    }
}
