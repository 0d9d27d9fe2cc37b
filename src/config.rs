use std::time::Duration;

/// Immutable gateway configuration, built once at startup and shared by
/// reference everywhere else.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Process-wide cap on concurrent proxied connections.
    pub global_max: usize,
    /// Cap on concurrent connections per VM. SPICE opens one TCP connection
    /// per channel (display, inputs, cursor, playback, record, USB, ...), so
    /// this must stay >= 17 for a fully equipped guest.
    pub per_vm_max: usize,
    /// Deadline for a single upstream TCP connect attempt.
    pub connection_timeout: Duration,
    /// Additional connect attempts after the first failure.
    pub max_retries: u32,
    /// Sleep before the second attempt; grows by `retry_backoff_multiplier`.
    pub retry_delay: Duration,
    pub retry_backoff_multiplier: f64,
    /// Interval of the ping/pong liveness sweep.
    pub heartbeat_interval: Duration,
    pub tcp_keepalive_enable: bool,
    pub tcp_keepalive_initial_delay: Duration,
    /// Upper bound on frames buffered while the upstream dial is in flight.
    pub buffer_max_size: usize,
    /// Write unparseable text frames to the upstream verbatim. Legacy SDKs
    /// send the RFB version handshake as a text frame.
    pub text_passthrough: bool,
    /// Hard deadline for draining sessions at shutdown.
    pub shutdown_grace: Duration,
    /// Base URL of the management service.
    pub upstream_url: String,
    /// HS256 secret for issued bearers.
    pub token_secret: String,
    /// Validity of user bearers issued at login.
    pub user_token_ttl: Duration,
    /// Validity of display bearers issued with connection info.
    pub display_token_ttl: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            global_max: 100,
            per_vm_max: 20,
            connection_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            retry_backoff_multiplier: 2.0,
            heartbeat_interval: Duration::from_secs(30),
            tcp_keepalive_enable: true,
            tcp_keepalive_initial_delay: Duration::from_secs(60),
            buffer_max_size: 1024 * 1024,
            text_passthrough: true,
            shutdown_grace: Duration::from_secs(10),
            upstream_url: "http://127.0.0.1:9443".to_string(),
            token_secret: String::new(),
            user_token_ttl: Duration::from_secs(24 * 3600),
            display_token_ttl: Duration::from_secs(3600),
        }
    }
}
