use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::sleep;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vdigate::config::GatewayConfig;
use vdigate::gateway::{self, GatewayState};
use vdigate::ocloud::OcloudClient;
use vdigate::{build_router, heartbeat, DEFAULT_HTTP_PORT};

#[derive(Parser, Debug)]
#[command(name = "vdigated", author, version)]
struct Options {
    /// Address the HTTP server binds to
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,
    /// Port for the HTTP server
    #[arg(long, default_value_t = DEFAULT_HTTP_PORT, env = "VDIGATE_PORT")]
    port: u16,
    /// Base URL of the management service
    #[arg(long, default_value = "http://127.0.0.1:9443", env = "VDIGATE_UPSTREAM_URL")]
    upstream_url: String,
    /// HS256 secret for issued bearers; generated per process when omitted
    #[arg(long, env = "VDIGATE_TOKEN_SECRET")]
    token_secret: Option<String>,
    /// Directory used for logs
    #[arg(long, default_value = "/var/log/vdigate", env = "VDIGATE_LOG_DIR")]
    log_dir: PathBuf,
    /// Process-wide cap on proxied connections
    #[arg(long, default_value_t = 100)]
    global_max: usize,
    /// Cap on proxied connections per VM (a full SPICE channel set needs 17)
    #[arg(long, default_value_t = 20)]
    per_vm_max: usize,
    /// Upstream TCP connect deadline, per attempt, in seconds
    #[arg(long, default_value_t = 30)]
    connection_timeout_secs: u64,
    /// Additional connect attempts after the first failure
    #[arg(long, default_value_t = 3)]
    max_retries: u32,
    /// Delay before the first retry, in milliseconds
    #[arg(long, default_value_t = 1000)]
    retry_delay_ms: u64,
    /// Multiplier applied to the retry delay after each failure
    #[arg(long, default_value_t = 2.0)]
    retry_backoff_multiplier: f64,
    /// Ping/pong liveness sweep interval, in seconds
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,
    /// Disable TCP keepalive on upstream sockets
    #[arg(long)]
    no_tcp_keepalive: bool,
    /// Idle time before the first keepalive probe, in seconds
    #[arg(long, default_value_t = 60)]
    tcp_keepalive_secs: u64,
    /// Cap on bytes buffered while the upstream dial is in flight
    #[arg(long, default_value_t = 1024 * 1024)]
    buffer_max_bytes: usize,
    /// Drop text frames that are not JSON control messages instead of
    /// forwarding them verbatim
    #[arg(long)]
    no_text_passthrough: bool,
    /// Hard deadline for draining sessions at shutdown, in seconds
    #[arg(long, default_value_t = 10)]
    shutdown_grace_secs: u64,
}

impl Options {
    fn to_config(&self) -> GatewayConfig {
        let token_secret = self.token_secret.clone().unwrap_or_else(|| {
            tracing::warn!("no token secret configured; using a process-local random secret");
            uuid::Uuid::new_v4().simple().to_string()
        });
        GatewayConfig {
            global_max: self.global_max,
            per_vm_max: self.per_vm_max,
            connection_timeout: Duration::from_secs(self.connection_timeout_secs),
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            retry_backoff_multiplier: self.retry_backoff_multiplier,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            tcp_keepalive_enable: !self.no_tcp_keepalive,
            tcp_keepalive_initial_delay: Duration::from_secs(self.tcp_keepalive_secs),
            buffer_max_size: self.buffer_max_bytes,
            text_passthrough: !self.no_text_passthrough,
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            upstream_url: self.upstream_url.clone(),
            token_secret,
            ..GatewayConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    let _guard = init_tracing(&options.log_dir);
    run_server(options).await
}

fn init_tracing(log_dir: &PathBuf) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!(
            "Failed to create log directory {:?}: {}. Logging to file disabled.",
            log_dir, e
        );
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .init();
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, "vdigated.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Some(guard)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for shutdown signal: {error}");
        }
    };

    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(error) => {
                    tracing::error!("failed to install SIGTERM handler: {error}");
                    ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}

fn parse_bind_ip(bind: &str) -> IpAddr {
    match bind.parse() {
        Ok(ip) => ip,
        Err(error) => {
            tracing::error!(
                ?error,
                %bind,
                "invalid bind address; defaulting to 0.0.0.0"
            );
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
    }
}

async fn run_server(options: Options) -> anyhow::Result<()> {
    let config = options.to_config();
    let api = Arc::new(OcloudClient::new(&config.upstream_url));
    let state = GatewayState::new(config, api);

    let heartbeat_task = heartbeat::spawn(
        state.registry.clone(),
        state.config.heartbeat_interval,
    );

    let app = build_router(state.clone());
    let addr = SocketAddr::new(parse_bind_ip(&options.bind), options.port);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("vdigated listening on http://{}", addr);
    tracing::info!("proxying to management service at {}", state.config.upstream_url);

    let (drained_tx, drained_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn({
        let state = state.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            heartbeat_task.abort();
            gateway::shutdown(&state).await;
            let _ = drained_tx.send(());
            // Anything still holding the server open after the drain gets a
            // short final window before the process is forced down.
            sleep(Duration::from_secs(2)).await;
            tracing::warn!("shutdown stalled; forcing exit");
            std::process::exit(0);
        }
    });

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = drained_rx.await;
    })
    .await?;

    tracing::info!("server shut down gracefully");
    Ok(())
}
