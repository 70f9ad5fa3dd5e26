use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Offset reported when a consumer group has no commit recorded for a
/// partition it otherwise consumes.
pub const NO_COMMITTED_OFFSET: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broker {
    pub id: i32,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GroupMember {
    pub member_id: String,
    pub client_id: String,
    pub client_host: String,
    pub assignments: Vec<TopicPartition>,
}

#[derive(Debug, Clone)]
pub struct GroupDescription {
    pub group_id: String,
    pub members: Vec<GroupMember>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetSpec {
    Newest,
    Oldest,
}

/// One partition entry of an offset-fetch response.
/// `offset` is [`NO_COMMITTED_OFFSET`] when the group never committed.
#[derive(Debug, Clone)]
pub struct OffsetBlock {
    pub offset: i64,
    /// Per-block protocol error; the block is skipped when set.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct OffsetFetchResponse {
    pub blocks: HashMap<String, HashMap<i32, OffsetBlock>>,
}

/// Process-lived session with the Kafka cluster: topology queries, partition
/// offsets and the admin surface for committed offsets.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn brokers(&self) -> Result<Vec<Broker>>;

    /// Forces a metadata refresh. Topology queries afterwards observe the
    /// refreshed view; on failure the cached view stays in place.
    async fn refresh_metadata(&self) -> Result<()>;

    async fn topics(&self) -> Result<Vec<String>>;

    async fn partitions(&self, topic: &str) -> Result<Vec<i32>>;

    async fn partition_leader(&self, topic: &str, partition: i32) -> Result<i32>;

    async fn partition_replicas(&self, topic: &str, partition: i32) -> Result<Vec<i32>>;

    async fn partition_in_sync_replicas(&self, topic: &str, partition: i32) -> Result<Vec<i32>>;

    async fn partition_offset(&self, topic: &str, partition: i32, spec: OffsetSpec) -> Result<i64>;

    /// Opens a per-scrape connection to one broker for consumer-group
    /// queries. The connection is released when the handle is dropped.
    async fn group_coordinator(&self, broker: &Broker) -> Result<Box<dyn GroupCoordinator>>;

    /// Admin surface: committed offsets for a group over the given
    /// topic → partitions map. Only real commits are reported.
    async fn group_committed_offsets(
        &self,
        group: &str,
        partitions: &HashMap<String, Vec<i32>>,
    ) -> Result<HashMap<TopicPartition, i64>>;
}

/// Per-broker, per-scrape consumer-group queries. `list_groups` reports the
/// groups this broker coordinates.
#[async_trait]
pub trait GroupCoordinator: Send + Sync {
    async fn list_groups(&self) -> Result<Vec<String>>;

    async fn describe_groups(&self, groups: &[String]) -> Result<Vec<GroupDescription>>;

    async fn fetch_offsets(
        &self,
        group: &str,
        partitions: &[TopicPartition],
    ) -> Result<OffsetFetchResponse>;
}

/// Builds a fresh client session with the configured broker list and session
/// settings. The pruner opens one per pass.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn ClusterClient>>;
}

/// Legacy Zookeeper-committed offsets, consumed only when Zookeeper lag is
/// enabled.
#[async_trait]
pub trait ZookeeperOffsets: Send + Sync {
    async fn consumer_groups(&self) -> Result<Vec<String>>;

    async fn committed_offset(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
    ) -> Result<Option<i64>>;
}
