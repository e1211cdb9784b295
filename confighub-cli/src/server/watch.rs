use std::sync::Arc;
use std::time::Duration;

use confighub_lib::Result;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use super::hub::NotificationHub;
use super::metrics::metrics;
use super::releases::GrayReleaseEngine;

/// Result of a long poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The caller's effective version moved past what it already had.
    Changed(u64),
    /// Nothing newer appeared before the deadline.
    Unchanged,
}

/// What a watcher is waiting on.
pub struct WatchTarget<'a> {
    pub document_id: u64,
    pub environment: &'a str,
    pub caller_id: &'a str,
    pub caller_ip: Option<&'a str>,
    pub known_version: u64,
}

struct ActivePoll;

impl ActivePoll {
    fn start() -> Self {
        metrics().long_polls_active.inc();
        ActivePoll
    }
}

impl Drop for ActivePoll {
    fn drop(&mut self) {
        metrics().long_polls_active.dec();
    }
}

fn finish(outcome: &str) {
    metrics()
        .long_poll_outcomes
        .with_label_values(&[outcome])
        .inc();
}

async fn effective_version(gray: &GrayReleaseEngine, target: &WatchTarget<'_>) -> Result<u64> {
    gray.resolve(
        target.document_id,
        target.environment,
        target.caller_id,
        target.caller_ip,
    )
    .await
}

/// Hold the caller until its effective version is newer than
/// `known_version` or `wait` elapses.
///
/// Hub events are only wake-ups: every wake re-resolves, and an event that
/// does not change what this caller sees (a gray change outside its cohort)
/// sends it back to waiting on a fresh subscription.
pub async fn long_poll(
    hub: &Arc<NotificationHub>,
    gray: &GrayReleaseEngine,
    target: WatchTarget<'_>,
    wait: Duration,
) -> Result<WatchOutcome> {
    let _active = ActivePoll::start();
    let deadline = Instant::now() + wait;
    let current = effective_version(gray, &target).await?;
    if current > target.known_version {
        finish("immediate");
        return Ok(WatchOutcome::Changed(current));
    }

    let mut woken = false;
    loop {
        let mut subscription = hub.subscribe(target.caller_id, [target.document_id]);

        // A write may have landed between the last resolve and subscribing.
        let current = effective_version(gray, &target).await?;
        if current > target.known_version {
            finish(if woken { "notified" } else { "immediate" });
            return Ok(WatchOutcome::Changed(current));
        }

        let received = timeout_at(deadline, subscription.recv()).await;
        match received {
            Ok(Some(event)) => {
                debug!(
                    subscription = subscription.id(),
                    document = event.document_id,
                    change = event.change_type.as_str(),
                    caller = target.caller_id,
                    "watcher woken"
                );
                woken = true;
            }
            Ok(None) => woken = true,
            Err(_) => {
                finish("timeout");
                return Ok(WatchOutcome::Unchanged);
            }
        }
    }
}
