//! WebSocket client configuration.

use std::time::Duration;

/// Configuration shared by every connection a [`WsClient`](super::WsClient)
/// manages.
#[derive(Clone, Debug)]
pub struct WsClientConfig {
    // Endpoints
    /// Use the sandbox endpoints where one exists.
    pub use_sandbox: bool,
    /// Override the endpoint URL for every key.
    pub ws_url: Option<String>,

    // Heartbeat settings
    /// Interval between ping messages.
    pub ping_interval: Duration,
    /// Maximum time to wait for any inbound frame after a ping.
    pub pong_timeout: Duration,
    /// Use WebSocket protocol-level ping frames when the adapter has no
    /// application-level ping.
    pub use_websocket_ping: bool,

    // Reconnection
    /// Fixed delay before reopening a dropped connection.
    pub reconnect_timeout: Duration,
    /// Timeout for opening a socket.
    pub connect_timeout: Duration,

    // Readiness and auth
    /// Wait for the server to confirm the connection before running the
    /// ready sequence.
    pub require_connection_ready_confirmation: bool,
    /// Authenticate private connections as soon as they open and hold back
    /// private topics until the server confirms.
    pub auth_private_connections_on_connect: bool,

    // Request handling
    /// Default timeout for request-response operations.
    pub request_timeout: Duration,
    /// Maximum number of pending requests per connection.
    pub max_pending_requests: usize,
    /// Interval for cleaning up stale pending requests.
    pub pending_cleanup_interval: Duration,

    // Channels
    /// Capacity of command channel.
    pub command_channel_capacity: usize,
    /// Capacity of the event broadcast channel.
    pub event_channel_capacity: usize,
}

impl Default for WsClientConfig {
    fn default() -> Self {
        Self {
            use_sandbox: false,
            ws_url: None,
            ping_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(1),
            use_websocket_ping: true,
            reconnect_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(10),
            require_connection_ready_confirmation: false,
            auth_private_connections_on_connect: false,
            request_timeout: Duration::from_secs(30),
            max_pending_requests: 1000,
            pending_cleanup_interval: Duration::from_secs(5),
            command_channel_capacity: 64,
            event_channel_capacity: 256,
        }
    }
}

impl WsClientConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the sandbox endpoints.
    #[must_use]
    pub fn use_sandbox(mut self, sandbox: bool) -> Self {
        self.use_sandbox = sandbox;
        self
    }

    /// Connect every key to this URL instead of the exchange endpoints.
    #[must_use]
    pub fn ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = Some(url.into());
        self
    }

    /// Set the ping interval.
    #[must_use]
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the pong timeout.
    #[must_use]
    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }

    /// Set whether to use WebSocket protocol-level pings.
    #[must_use]
    pub fn use_websocket_ping(mut self, use_ws_ping: bool) -> Self {
        self.use_websocket_ping = use_ws_ping;
        self
    }

    /// Set the reconnect delay.
    #[must_use]
    pub fn reconnect_timeout(mut self, delay: Duration) -> Self {
        self.reconnect_timeout = delay;
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Require a server readiness confirmation before subscribing.
    #[must_use]
    pub fn require_connection_ready_confirmation(mut self, require: bool) -> Self {
        self.require_connection_ready_confirmation = require;
        self
    }

    /// Set whether private connections authenticate on connect.
    #[must_use]
    pub fn auth_private_connections_on_connect(mut self, auth: bool) -> Self {
        self.auth_private_connections_on_connect = auth;
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the maximum pending requests.
    #[must_use]
    pub fn max_pending_requests(mut self, max: usize) -> Self {
        self.max_pending_requests = max;
        self
    }

    /// Set the stale request cleanup interval.
    #[must_use]
    pub fn pending_cleanup_interval(mut self, interval: Duration) -> Self {
        self.pending_cleanup_interval = interval;
        self
    }

    /// Set the command channel capacity.
    #[must_use]
    pub fn command_channel_capacity(mut self, capacity: usize) -> Self {
        self.command_channel_capacity = capacity;
        self
    }

    /// Set the event channel capacity.
    #[must_use]
    pub fn event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(url) = &self.ws_url
            && !(url.starts_with("ws://") || url.starts_with("wss://"))
        {
            return Err("URL override must use ws:// or wss://".to_string());
        }
        if self.ping_interval.is_zero() {
            return Err("Ping interval must be > 0".to_string());
        }
        if self.pong_timeout.is_zero() {
            return Err("Pong timeout must be > 0".to_string());
        }
        if self.reconnect_timeout.is_zero() {
            return Err("Reconnect timeout must be > 0".to_string());
        }
        if self.connect_timeout.is_zero() {
            return Err("Connect timeout must be > 0".to_string());
        }
        if self.request_timeout.is_zero() {
            return Err("Request timeout must be > 0".to_string());
        }
        if self.pending_cleanup_interval.is_zero() {
            return Err("Pending cleanup interval must be > 0".to_string());
        }
        if self.max_pending_requests == 0 {
            return Err("Max pending requests must be > 0".to_string());
        }
        if self.command_channel_capacity == 0 {
            return Err("Command channel capacity must be > 0".to_string());
        }
        if self.event_channel_capacity == 0 {
            return Err("Event channel capacity must be > 0".to_string());
        }
        Ok(())
    }
}
