//! Periodic ping/pong liveness sweep over the connection registry.

use axum::extract::ws::close_code;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use crate::registry::ConnectionRegistry;

/// Start the sweep task. Each tick: a connection whose liveness flag is still
/// clear from the previous tick is terminated; everyone else has the flag
/// cleared and gets a ping. Any pong (protocol-level or in-band JSON) sets
/// the flag again.
pub fn spawn(registry: Arc<ConnectionRegistry>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so connections get a full
        // interval to answer before the first probe.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sweep(&registry);
        }
    })
}

fn sweep(registry: &ConnectionRegistry) {
    for record in registry.records() {
        if record.begin_probe() {
            record.send_ping();
        } else {
            info!(connection = %record.id, vm = %record.vm_id, "terminating unresponsive client");
            record.terminate(close_code::ERROR, "heartbeat timeout");
        }
    }
}
