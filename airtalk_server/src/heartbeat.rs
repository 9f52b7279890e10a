//! Periodic liveness probing and stale-waiter eviction
//!
//! Both loops run on their own timers and take the registry lock only for
//! the duration of one sweep.

use crate::state::ServerState;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Background tasks owned by a running server
pub struct Monitors {
    heartbeat: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl Monitors {
    /// Start the heartbeat monitor and the stale sweeper
    pub fn spawn(state: &ServerState) -> Self {
        let heartbeat = tokio::spawn(heartbeat_loop(
            state.clone(),
            state.config.heartbeat_interval(),
        ));
        let sweeper = tokio::spawn(sweep_loop(
            state.clone(),
            state.config.stale_sweep_interval(),
            state.config.max_waiting_time(),
        ));
        Self { heartbeat, sweeper }
    }

    pub fn abort(&self) {
        self.heartbeat.abort();
        self.sweeper.abort();
    }
}

impl Drop for Monitors {
    fn drop(&mut self) {
        self.abort();
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn heartbeat_loop(state: ServerState, period: Duration) {
    let mut interval = ticker(period);
    loop {
        interval.tick().await;
        let dead = state.registry.lock().heartbeat(Instant::now());
        if dead.is_empty() {
            debug!("Heartbeat round complete");
        } else {
            info!(terminated = dead.len(), "Heartbeat dropped dead connections");
        }
    }
}

async fn sweep_loop(state: ServerState, period: Duration, max_wait: Duration) {
    let mut interval = ticker(period);
    loop {
        interval.tick().await;
        let evicted = state.registry.lock().sweep_stale(max_wait, Instant::now());
        if !evicted.is_empty() {
            info!(evicted = evicted.len(), "Stale waiters timed out");
        }
    }
}
