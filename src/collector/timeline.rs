use crate::collector::unix_time_ms;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::{Mutex, MutexGuard};

/// Ordered (producer offset → observed wall time, unix ms) samples for one
/// (group, topic, partition).
pub type PartitionSamples = BTreeMap<i64, i64>;

type TimelineMap = HashMap<String, HashMap<String, HashMap<i32, PartitionSamples>>>;

/// Rolling history of newest producer offsets observed per
/// (group, topic, partition). Fed by the scrape pipeline, read by the lag
/// estimation pass, trimmed by the pruner. One mutex mediates all access;
/// the lag pass holds it for the duration of its iteration.
pub struct OffsetTimeline {
    entries: Mutex<TimelineMap>,
}

/// The groups/topics/partitions currently present in the cluster, as
/// discovered by a prune pass.
#[derive(Debug, Default)]
pub struct LiveTopology {
    pub groups: HashSet<String>,
    pub partitions: HashMap<String, HashSet<i32>>,
}

impl LiveTopology {
    fn has_partition(&self, topic: &str, partition: i32) -> bool {
        self.partitions
            .get(topic)
            .is_some_and(|ids| ids.contains(&partition))
    }
}

impl OffsetTimeline {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(TimelineMap::new()),
        }
    }

    /// Records that `offset` was the newest produced offset for this
    /// (group, topic, partition) as of now. An offset seen before has its
    /// instant overwritten with the current time.
    pub async fn create_or_update(&self, group: &str, topic: &str, partition: i32, offset: i64) {
        let mut entries = self.entries.lock().await;
        entries
            .entry(group.to_string())
            .or_default()
            .entry(topic.to_string())
            .or_default()
            .entry(partition)
            .or_default()
            .insert(offset, unix_time_ms());
    }

    /// Grants iteration access under the timeline mutex.
    pub async fn entries(&self) -> MutexGuard<'_, TimelineMap> {
        self.entries.lock().await
    }

    /// Drops every (group, topic, partition) absent from `live` and trims
    /// each surviving entry to the `max_samples` largest offsets.
    pub async fn prune(&self, live: &LiveTopology, max_samples: usize) {
        let mut entries = self.entries.lock().await;

        entries.retain(|group, topics| {
            if !live.groups.contains(group) {
                return false;
            }
            topics.retain(|topic, partitions| {
                partitions.retain(|partition, samples| {
                    if !live.has_partition(topic, *partition) {
                        return false;
                    }
                    if samples.len() > max_samples {
                        let cutoff = *samples
                            .keys()
                            .nth(samples.len() - max_samples)
                            .expect("cutoff within bounds");
                        *samples = samples.split_off(&cutoff);
                    }
                    true
                });
                !partitions.is_empty()
            });
            !topics.is_empty()
        });
    }

    #[cfg(test)]
    pub async fn sample_count(&self, group: &str, topic: &str, partition: i32) -> Option<usize> {
        let entries = self.entries.lock().await;
        entries
            .get(group)?
            .get(topic)?
            .get(&partition)
            .map(BTreeMap::len)
    }
}

impl Default for OffsetTimeline {
    fn default() -> Self {
        Self::new()
    }
}
