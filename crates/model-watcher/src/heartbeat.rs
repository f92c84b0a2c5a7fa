use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::connection::SharedConnection;
use crate::error::PingError;

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Debug, Default)]
struct PingCounters {
    sent: AtomicU64,
    failed: AtomicU64,
}

/// Periodic keep-alive on a controller connection.
///
/// Failed pings are logged and counted; they never stop the heartbeat. The
/// task ends when [`Heartbeat::cancel`] is called or the handle is dropped.
pub struct Heartbeat {
    token: CancellationToken,
    counters: Arc<PingCounters>,
}

impl Heartbeat {
    /// Must be called from within a tokio runtime. The first ping goes out one
    /// interval after start.
    pub fn start(connection: SharedConnection, interval: Duration) -> Self {
        Self::spawn(connection, interval, CancellationToken::new(), None)
    }

    /// Heartbeat owned by a watch session: cancelling the session token stops
    /// it in the same step.
    pub(crate) fn for_session(
        connection: SharedConnection,
        interval: Duration,
        token: CancellationToken,
        model_uuid: Arc<str>,
    ) -> Self {
        Self::spawn(connection, interval, token, Some(model_uuid))
    }

    fn spawn(
        connection: SharedConnection,
        interval: Duration,
        token: CancellationToken,
        model_uuid: Option<Arc<str>>,
    ) -> Self {
        let interval = if interval.is_zero() {
            DEFAULT_PING_INTERVAL
        } else {
            interval
        };
        let counters = Arc::new(PingCounters::default());
        tokio::spawn(run(
            connection,
            interval,
            token.clone(),
            counters.clone(),
            model_uuid,
        ));
        Self { token, counters }
    }

    /// Stops future pings. Safe to call repeatedly.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn pings_sent(&self) -> u64 {
        self.counters.sent.load(Ordering::Relaxed)
    }

    pub fn pings_failed(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn run(
    connection: SharedConnection,
    interval: Duration,
    token: CancellationToken,
    counters: Arc<PingCounters>,
    model_uuid: Option<Arc<str>>,
) {
    let model_uuid = model_uuid.as_deref().unwrap_or("-");
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            result = connection.ping() => result,
        };

        match result {
            Ok(()) => {
                counters.sent.fetch_add(1, Ordering::Relaxed);
                trace!(target = "model_watcher::heartbeat", model_uuid, "ping ok");
            }
            Err(err) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target = "model_watcher::heartbeat",
                    model_uuid,
                    error = %PingError(err),
                    "keep-alive failed; heartbeat continues"
                );
            }
        }
    }

    debug!(target = "model_watcher::heartbeat", model_uuid, "heartbeat stopped");
}
