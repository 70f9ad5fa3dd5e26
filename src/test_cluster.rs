//! In-memory cluster used by the collector and server tests. Implements the
//! client seams so scrapes run end-to-end without a broker.

use crate::collector::exporter::{Exporter, ExporterOptions};
use crate::config::ScrapeFilters;
use crate::error::{MeterError, Result};
use crate::kafka::client::{
    Broker, ClientFactory, ClusterClient, GroupCoordinator, GroupDescription, GroupMember,
    OffsetBlock, OffsetFetchResponse, OffsetSpec, TopicPartition, ZookeeperOffsets,
};
use crate::metrics::types::MetricPoint;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Clone, Default)]
pub struct MockCluster {
    state: Arc<MockState>,
}

#[derive(Default)]
struct MockState {
    brokers: Mutex<Vec<Broker>>,
    topics: Mutex<BTreeMap<String, Vec<MockPartition>>>,
    groups: Mutex<BTreeMap<String, MockGroup>>,
    zookeeper_offsets: Mutex<HashMap<(String, String, i32), i64>>,
    topics_delay: Mutex<Option<Duration>>,
    topics_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct MockPartition {
    pub id: i32,
    pub leader: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
    pub newest: i64,
    pub oldest: i64,
}

impl MockPartition {
    pub fn plain(id: i32, newest: i64) -> Self {
        Self {
            id,
            leader: 1,
            replicas: vec![1],
            isr: vec![1],
            newest,
            oldest: 0,
        }
    }
}

#[derive(Default)]
struct MockGroup {
    coordinator: i32,
    members: Vec<GroupMember>,
    committed: HashMap<TopicPartition, i64>,
    block_errors: HashMap<TopicPartition, String>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_broker(&self, id: i32, address: &str) {
        self.state.brokers.lock().unwrap().push(Broker {
            id,
            address: address.to_string(),
        });
    }

    pub fn add_topic(&self, name: &str, partitions: Vec<MockPartition>) {
        self.state
            .topics
            .lock()
            .unwrap()
            .insert(name.to_string(), partitions);
    }

    pub fn add_topic_simple(&self, name: &str, partitions: i32, newest: i64) {
        self.add_topic(
            name,
            (0..partitions).map(|id| MockPartition::plain(id, newest)).collect(),
        );
    }

    pub fn set_newest(&self, topic: &str, partition: i32, newest: i64) {
        let mut topics = self.state.topics.lock().unwrap();
        if let Some(partition) = topics
            .get_mut(topic)
            .and_then(|ps| ps.iter_mut().find(|p| p.id == partition))
        {
            partition.newest = newest;
        }
    }

    fn default_coordinator(&self) -> i32 {
        self.state
            .brokers
            .lock()
            .unwrap()
            .first()
            .map_or(1, |b| b.id)
    }

    pub fn commit(&self, group: &str, topic: &str, partition: i32, offset: i64) {
        let coordinator = self.default_coordinator();
        let mut groups = self.state.groups.lock().unwrap();
        groups
            .entry(group.to_string())
            .or_insert_with(|| MockGroup {
                coordinator,
                ..MockGroup::default()
            })
            .committed
            .insert(TopicPartition::new(topic, partition), offset);
    }

    /// Marks the partition as consumed by the group without a recorded commit.
    pub fn commit_none(&self, group: &str, topic: &str, partition: i32) {
        self.commit(group, topic, partition, -1);
    }

    pub fn add_member(&self, group: &str, member: GroupMember) {
        let coordinator = self.default_coordinator();
        let mut groups = self.state.groups.lock().unwrap();
        groups
            .entry(group.to_string())
            .or_insert_with(|| MockGroup {
                coordinator,
                ..MockGroup::default()
            })
            .members
            .push(member);
    }

    pub fn fail_block(&self, group: &str, topic: &str, partition: i32, error: &str) {
        let mut groups = self.state.groups.lock().unwrap();
        if let Some(group) = groups.get_mut(group) {
            group
                .block_errors
                .insert(TopicPartition::new(topic, partition), error.to_string());
        }
    }

    pub fn set_zookeeper_offset(&self, group: &str, topic: &str, partition: i32, offset: i64) {
        self.state.zookeeper_offsets.lock().unwrap().insert(
            (group.to_string(), topic.to_string(), partition),
            offset,
        );
    }

    pub fn set_topics_delay(&self, delay: Duration) {
        *self.state.topics_delay.lock().unwrap() = Some(delay);
    }

    pub fn topics_calls(&self) -> usize {
        self.state.topics_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.state.refresh_calls.load(Ordering::SeqCst)
    }

    fn partition(&self, topic: &str, partition: i32) -> Result<MockPartition> {
        self.state
            .topics
            .lock()
            .unwrap()
            .get(topic)
            .and_then(|ps| ps.iter().find(|p| p.id == partition))
            .cloned()
            .ok_or_else(|| MeterError::Kafka(format!("unknown topic/partition {topic}/{partition}")))
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn brokers(&self) -> Result<Vec<Broker>> {
        Ok(self.state.brokers.lock().unwrap().clone())
    }

    async fn refresh_metadata(&self) -> Result<()> {
        self.state.refresh_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn topics(&self) -> Result<Vec<String>> {
        let delay = *self.state.topics_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state.topics_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.topics.lock().unwrap().keys().cloned().collect())
    }

    async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        self.state
            .topics
            .lock()
            .unwrap()
            .get(topic)
            .map(|ps| ps.iter().map(|p| p.id).collect())
            .ok_or_else(|| MeterError::Kafka(format!("unknown topic {topic}")))
    }

    async fn partition_leader(&self, topic: &str, partition: i32) -> Result<i32> {
        Ok(self.partition(topic, partition)?.leader)
    }

    async fn partition_replicas(&self, topic: &str, partition: i32) -> Result<Vec<i32>> {
        Ok(self.partition(topic, partition)?.replicas)
    }

    async fn partition_in_sync_replicas(&self, topic: &str, partition: i32) -> Result<Vec<i32>> {
        Ok(self.partition(topic, partition)?.isr)
    }

    async fn partition_offset(&self, topic: &str, partition: i32, spec: OffsetSpec) -> Result<i64> {
        let partition = self.partition(topic, partition)?;
        Ok(match spec {
            OffsetSpec::Newest => partition.newest,
            OffsetSpec::Oldest => partition.oldest,
        })
    }

    async fn group_coordinator(&self, broker: &Broker) -> Result<Box<dyn GroupCoordinator>> {
        Ok(Box::new(MockCoordinator {
            cluster: self.clone(),
            broker_id: broker.id,
        }))
    }

    async fn group_committed_offsets(
        &self,
        group: &str,
        partitions: &HashMap<String, Vec<i32>>,
    ) -> Result<HashMap<TopicPartition, i64>> {
        let groups = self.state.groups.lock().unwrap();
        let Some(group) = groups.get(group) else {
            return Ok(HashMap::new());
        };
        let mut committed = HashMap::new();
        for (topic, ids) in partitions {
            for id in ids {
                let key = TopicPartition::new(topic.clone(), *id);
                if let Some(offset) = group.committed.get(&key) {
                    if *offset >= 0 {
                        committed.insert(key, *offset);
                    }
                }
            }
        }
        Ok(committed)
    }
}

struct MockCoordinator {
    cluster: MockCluster,
    broker_id: i32,
}

#[async_trait]
impl GroupCoordinator for MockCoordinator {
    async fn list_groups(&self) -> Result<Vec<String>> {
        let groups = self.cluster.state.groups.lock().unwrap();
        Ok(groups
            .iter()
            .filter(|(_, g)| g.coordinator == self.broker_id)
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn describe_groups(&self, groups: &[String]) -> Result<Vec<GroupDescription>> {
        let known = self.cluster.state.groups.lock().unwrap();
        Ok(groups
            .iter()
            .filter_map(|name| {
                known.get(name).map(|g| GroupDescription {
                    group_id: name.clone(),
                    members: g.members.clone(),
                })
            })
            .collect())
    }

    async fn fetch_offsets(
        &self,
        group: &str,
        partitions: &[TopicPartition],
    ) -> Result<OffsetFetchResponse> {
        let groups = self.cluster.state.groups.lock().unwrap();
        let Some(group) = groups.get(group) else {
            return Ok(OffsetFetchResponse::default());
        };
        let mut response = OffsetFetchResponse::default();
        for tp in partitions {
            let offset = group.committed.get(tp).copied().unwrap_or(-1);
            let error = group.block_errors.get(tp).cloned();
            response
                .blocks
                .entry(tp.topic.clone())
                .or_default()
                .insert(tp.partition, OffsetBlock { offset, error });
        }
        Ok(response)
    }
}

#[async_trait]
impl ClientFactory for MockCluster {
    async fn create(&self) -> Result<Box<dyn ClusterClient>> {
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl ZookeeperOffsets for MockCluster {
    async fn consumer_groups(&self) -> Result<Vec<String>> {
        let offsets = self.state.zookeeper_offsets.lock().unwrap();
        let mut groups: Vec<String> = offsets.keys().map(|(g, _, _)| g.clone()).collect();
        groups.sort_unstable();
        groups.dedup();
        Ok(groups)
    }

    async fn committed_offset(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
    ) -> Result<Option<i64>> {
        Ok(self
            .state
            .zookeeper_offsets
            .lock()
            .unwrap()
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied())
    }
}

pub fn test_filters(
    topic_include: &str,
    topic_exclude: &str,
    group_include: &str,
    group_exclude: &str,
) -> ScrapeFilters {
    crate::config::FilterConfig {
        topic_include: topic_include.to_string(),
        topic_exclude: topic_exclude.to_string(),
        group_include: group_include.to_string(),
        group_exclude: group_exclude.to_string(),
    }
    .compile()
    .expect("test filters compile")
}

pub fn test_options() -> ExporterOptions {
    ExporterOptions::default()
}

pub fn test_exporter(cluster: MockCluster, options: ExporterOptions) -> Exporter {
    Exporter::new(
        Arc::new(cluster),
        None,
        test_filters(".*", "^$", ".*", "^$"),
        options,
    )
}

/// Runs one scrape and returns every emitted metric point.
pub async fn collect_points(exporter: &Arc<Exporter>) -> Vec<MetricPoint> {
    let (sink, mut stream) = mpsc::unbounded_channel();
    exporter.collect(sink).await;
    let mut points = Vec::new();
    while let Some(point) = stream.recv().await {
        points.push(point);
    }
    points
}

pub fn points_named<'a>(points: &'a [MetricPoint], name: &str) -> Vec<&'a MetricPoint> {
    points.iter().filter(|p| p.name == name).collect()
}

/// Value of the unique point matching `name` whose labels contain every
/// `(key, value)` pair in `labels`.
pub fn gauge_value(points: &[MetricPoint], name: &str, labels: &[(&str, &str)]) -> Option<f64> {
    points
        .iter()
        .find(|p| {
            p.name == name
                && labels
                    .iter()
                    .all(|(k, v)| p.labels.get(*k).map(String::as_str) == Some(*v))
        })
        .map(|p| p.value.as_f64())
}
