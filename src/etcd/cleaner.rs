//! Background member cleaner
//!
//! While the local engine runs, a periodic task tracks every cluster member's
//! first-seen and last-seen-healthy timestamps and evicts members that have
//! been given enough time to start yet stayed unhealthy beyond the TTL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::client::{member_health, Client};
use super::{SecurityConfig, Server};

const CLEANER_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub(super) struct CleanerConfig {
    pub private_address: String,
    pub client_sc: SecurityConfig,
    /// Grace period a fresh member gets before eviction is considered
    pub start_timeout: Duration,
    pub unhealthy_member_ttl: Duration,
}

#[derive(Debug, Clone)]
struct TrackedMember {
    name: String,
    first_seen: Instant,
    last_seen_healthy: Instant,
}

pub(super) fn spawn(server: &Arc<Server>, cancel: CancellationToken) {
    let cfg = server.cleaner_config();

    tokio::spawn(async move {
        let mut tracked: HashMap<u64, TrackedMember> = HashMap::new();
        let mut ticker = tokio::time::interval_at(
            Instant::now() + CLEANER_INTERVAL,
            CLEANER_INTERVAL,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            if let Err(e) = tick(&cfg, &mut tracked).await {
                tracing::debug!(error = %e, "member cleaner tick failed");
            }
        }
    });
}

async fn tick(
    cfg: &CleanerConfig,
    tracked: &mut HashMap<u64, TrackedMember>,
) -> anyhow::Result<()> {
    let client = Client::new(&[cfg.private_address.clone()], &cfg.client_sc, false).await?;
    let members = client.members().await?;

    // Forget members that left the cluster.
    let current: std::collections::HashSet<u64> = members.iter().map(|m| m.id).collect();
    tracked.retain(|id, _| current.contains(id));

    let now = Instant::now();
    for member in members {
        let entry = tracked.entry(member.id).or_insert_with(|| TrackedMember {
            name: member.name.clone(),
            first_seen: now,
            last_seen_healthy: now,
        });

        if member_health(&member.peer_address, &cfg.client_sc).await {
            entry.last_seen_healthy = now;
            continue;
        }

        let started_long_ago = now.duration_since(entry.first_seen) >= cfg.start_timeout;
        let unhealthy_too_long =
            now.duration_since(entry.last_seen_healthy) >= cfg.unhealthy_member_ttl;

        if started_long_ago && unhealthy_too_long {
            tracing::info!(
                member = %entry.name,
                ttl = ?cfg.unhealthy_member_ttl,
                "removing member unhealthy beyond ttl"
            );
            if let Err(e) = client.member_remove(member.id).await {
                // A deadline here usually means the cluster is busy applying a
                // configuration change; retry on the next tick.
                tracing::warn!(member = %entry.name, error = %e, "failed to remove member, retrying next tick");
            } else {
                tracked.remove(&member.id);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eviction_thresholds() {
        // Mirrors the eviction rule: both the start grace period and the
        // unhealthy TTL must have elapsed.
        let start_timeout = Duration::from_secs(120);
        let ttl = Duration::from_secs(120);

        let first_seen = Duration::from_secs(0);
        let last_seen_healthy = Duration::from_secs(10);

        for (now, expect_evict) in [
            (Duration::from_secs(60), false),   // still in start grace
            (Duration::from_secs(125), false),  // grace over, ttl not yet
            (Duration::from_secs(190), true),   // both elapsed
        ] {
            let started_long_ago = now - first_seen >= start_timeout;
            let unhealthy_too_long = now - last_seen_healthy >= ttl;
            assert_eq!(
                started_long_ago && unhealthy_too_long,
                expect_evict,
                "at t={:?}",
                now
            );
        }
    }
}
