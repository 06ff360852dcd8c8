use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Notify;
use tokio::time::{Instant, interval_at, timeout};
use tracing::warn;

use super::{FanoutHub, Subscriber};

/// Ping a subscriber every `keepalive_interval` and drop it if no pong
/// arrives within `keepalive_timeout`.
///
/// The connection's reader calls `notify_one` on `pongs` for every pong.
/// Only a pong that arrives after the current ping counts. Returns once the
/// subscriber is gone.
pub async fn run_keepalive(hub: FanoutHub, subscriber: Arc<Subscriber>, pongs: Arc<Notify>) {
    let period = hub.config().keepalive_interval;
    let deadline = hub.config().keepalive_timeout;
    let mut removed = subscriber.on_removed();
    let mut ticks = interval_at(Instant::now() + period, period);

    loop {
        if subscriber.is_removed() {
            return;
        }
        tokio::select! {
            _ = ticks.tick() => {}
            _ = removed.changed() => return,
        }

        // Drop a permit left by an unsolicited pong.
        let _ = pongs.notified().now_or_never();
        let pong = pongs.notified();
        tokio::pin!(pong);
        pong.as_mut().enable();

        if hub.ping(&subscriber).await.is_err() {
            return;
        }

        tokio::select! {
            pong = timeout(deadline, pong) => {
                if pong.is_err() {
                    warn!(
                        "Subscriber {} missed pong after {:?}, dropping",
                        subscriber.id(),
                        deadline
                    );
                    hub.remove(subscriber.id()).await;
                    return;
                }
            }
            _ = removed.changed() => return,
        }
    }
}
