//! Upstream TCP dialling with bounded retries and exponential backoff.

use socket2::{SockRef, TcpKeepalive};
use std::io;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::config::GatewayConfig;
use crate::errors::{GatewayError, GatewayResult};

/// Dial `addr`, attempting up to `max_retries + 1` times. Each attempt runs
/// under `connection_timeout`; after a failure the engine sleeps
/// `retry_delay * multiplier^(attempt-1)` before trying again. The timeout
/// applies only to the handshake; an established stream has no deadline.
pub async fn connect(addr: &str, config: &GatewayConfig) -> GatewayResult<TcpStream> {
    let attempts = config.max_retries + 1;
    let mut delay = config.retry_delay;
    let mut last_err: Option<io::Error> = None;

    for attempt in 1..=attempts {
        if attempt > 1 {
            sleep(delay).await;
            delay = delay.mul_f64(config.retry_backoff_multiplier);
        }
        match timeout(config.connection_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                apply_socket_options(&stream, config)?;
                debug!(%addr, attempt, "upstream TCP connected");
                return Ok(stream);
            }
            Ok(Err(e)) => {
                debug!(%addr, attempt, error = %e, "upstream connect failed");
                last_err = Some(e);
            }
            Err(_) => {
                debug!(%addr, attempt, "upstream connect timed out");
                last_err = Some(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect timed out after {:?}", config.connection_timeout),
                ));
            }
        }
    }

    Err(GatewayError::DialFailed {
        addr: addr.to_string(),
        attempts,
        source: last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no connect attempt made")),
    })
}

/// Interactive sessions want Nagle off; keepalive catches upstreams that die
/// without a FIN once the splice is running deadline-free.
fn apply_socket_options(stream: &TcpStream, config: &GatewayConfig) -> GatewayResult<()> {
    stream.set_nodelay(true)?;
    if config.tcp_keepalive_enable {
        let sock = SockRef::from(stream);
        let keepalive = TcpKeepalive::new().with_time(config.tcp_keepalive_initial_delay);
        sock.set_tcp_keepalive(&keepalive)?;
    }
    Ok(())
}
