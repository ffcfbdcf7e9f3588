use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::access::matcher::RuleMatcher;
use crate::health::{EventManager, RuleLoadedEvent};
use crate::keys::KeyManager;

/// Delay before the next attempt: the interval after a success, a short
/// growing pause after failures, never longer than the interval.
pub fn next_delay(interval: Duration, consecutive_failures: u32) -> Duration {
    if consecutive_failures == 0 {
        return interval;
    }
    interval.min(Duration::from_secs(u64::from(consecutive_failures) + 1))
}

/// Reload rules right away and then every `interval`. Each successful load
/// notifies the readiness probes.
pub fn spawn_rule_refresh(
    matcher: Arc<RuleMatcher>,
    events: Arc<EventManager>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut failures: u32 = 0;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                result = matcher.refresh() => match result {
                    Ok(count) => {
                        if failures > 0 {
                            info!(rules = count, "Rule refresh recovered");
                        }
                        failures = 0;
                        events.dispatch(Arc::new(RuleLoadedEvent));
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        error!(error = %e, retry = failures, "Unable to refresh rules, keeping the previous rule set");
                    }
                },
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(next_delay(interval, failures)) => {}
            }
        }
        info!("Rule refresh loop stopped");
    })
}

/// Reload the signing key right away and then every `interval`.
pub fn spawn_key_refresh(
    keys: Arc<KeyManager>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut failures: u32 = 0;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                result = keys.refresh() => match result {
                    Ok(()) => failures = 0,
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        error!(error = %e, retry = failures, "Unable to refresh signing keys, keeping the previous key");
                    }
                },
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(next_delay(interval, failures)) => {}
            }
        }
        info!("Key refresh loop stopped");
    })
}
