use crate::collector::timeline::{LiveTopology, OffsetTimeline};
use crate::error::Result;
use crate::kafka::client::{ClientFactory, ClusterClient};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Periodically trims the offset timeline: drops (group, topic, partition)
/// entries that left the cluster and bounds the per-entry sample count.
/// Each pass runs against a fresh client session so a torn-down scrape
/// session can never be reused here.
pub struct Pruner {
    factory: Arc<dyn ClientFactory>,
    timeline: Arc<OffsetTimeline>,
    interval: Duration,
    max_samples: usize,
}

impl Pruner {
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        timeline: Arc<OffsetTimeline>,
        interval: Duration,
        max_samples: usize,
    ) -> Self {
        Self {
            factory,
            timeline,
            interval,
            max_samples,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(interval_secs = self.interval.as_secs(), "starting timeline pruner");
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + self.interval, self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.prune_once().await {
                        warn!(error = %e, "skipping prune pass");
                    }
                }
                _ = shutdown.recv() => {
                    break;
                }
            }
        }
        info!("timeline pruner stopped");
    }

    pub(crate) async fn prune_once(&self) -> Result<()> {
        let client = self.factory.create().await?;
        let live = discover_live_topology(client.as_ref()).await?;
        debug!(
            groups = live.groups.len(),
            topics = live.partitions.len(),
            "pruning timeline against discovered topology"
        );
        self.timeline.prune(&live, self.max_samples).await;
        Ok(())
    }
}

async fn discover_live_topology(client: &dyn ClusterClient) -> Result<LiveTopology> {
    let mut live = LiveTopology::default();

    for broker in client.brokers().await? {
        match client.group_coordinator(&broker).await {
            Ok(coordinator) => match coordinator.list_groups().await {
                Ok(groups) => live.groups.extend(groups),
                Err(e) => warn!(broker = broker.id, error = %e, "cannot list groups for prune"),
            },
            Err(e) => warn!(broker = broker.id, error = %e, "cannot connect to broker for prune"),
        }
    }

    for topic in client.topics().await? {
        let partitions: HashSet<i32> = match client.partitions(&topic).await {
            Ok(partitions) => partitions.into_iter().collect(),
            Err(e) => {
                warn!(topic = %topic, error = %e, "cannot list partitions for prune");
                continue;
            }
        };
        live.partitions.insert(topic, partitions);
    }

    Ok(live)
}
