//! Background upkeep of a [`Pool`](super::Pool): the idle channel reaper and the connection prober.
//!
//! Both loops only hold a weak reference to the pool and stop when it is closed or dropped.
use super::Shared;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

const MIN_REAP_PERIOD: Duration = Duration::from_millis(10);

/// Idle channels are checked twice per idle timeout.
pub(super) fn reap_period(max_idle_time: Duration) -> Duration {
    (max_idle_time / 2).max(MIN_REAP_PERIOD)
}

pub(super) async fn reap_idle_channels(
    pool: Weak<Shared>,
    mut shutdown: watch::Receiver<bool>,
    period: Duration,
) {
    let mut ticker = ticker(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        let Some(shared) = pool.upgrade() else {
            break;
        };
        let reaped = shared.reap_idle_channels();
        if reaped > 0 {
            tracing::debug!(reaped, "Closed channels past their idle timeout");
        }
    }
    tracing::debug!("Idle channel reaper stopped");
}

pub(super) async fn probe_connections(
    pool: Weak<Shared>,
    mut shutdown: watch::Receiver<bool>,
    period: Duration,
) {
    let mut ticker = ticker(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        let Some(shared) = pool.upgrade() else {
            break;
        };
        let retired = shared.probe_connections().await;
        if retired > 0 {
            tracing::info!(retired, "Retired connections that failed their liveness probe");
        }
    }
    tracing::debug!("Connection prober stopped");
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
