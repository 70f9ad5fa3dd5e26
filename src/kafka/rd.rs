use crate::config::{Config, SaslMechanism};
use crate::error::{MeterError, Result};
use crate::kafka::client::{
    Broker, ClientFactory, ClusterClient, GroupCoordinator, GroupDescription, GroupMember,
    OffsetBlock, OffsetFetchResponse, OffsetSpec, TopicPartition,
};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::metadata::Metadata;
use rdkafka::Offset;
use rdkafka::TopicPartitionList;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

const CLIENT_ID: &str = "kmeter";
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Plain-data view of the cluster metadata, captured on refresh so topology
/// queries never touch the wire.
#[derive(Debug, Clone, Default)]
struct TopologySnapshot {
    brokers: Vec<Broker>,
    topics: HashMap<String, Vec<PartitionMeta>>,
}

#[derive(Debug, Clone)]
struct PartitionMeta {
    id: i32,
    leader: i32,
    replicas: Vec<i32>,
    isr: Vec<i32>,
}

/// librdkafka-backed cluster session. Metadata is cached between refreshes,
/// matching the scrape pipeline's refresh-interval contract.
pub struct RdCluster {
    consumer: Arc<BaseConsumer>,
    base_config: ClientConfig,
    topology: Mutex<Option<TopologySnapshot>>,
    timeout: Duration,
}

impl RdCluster {
    pub fn connect(config: &Config) -> Result<Self> {
        let base_config = build_client_config(config)?;
        let consumer: BaseConsumer = base_config.create()?;
        debug!(brokers = ?config.kafka.brokers, "created kafka session");
        Ok(Self {
            consumer: Arc::new(consumer),
            base_config,
            topology: Mutex::new(None),
            timeout: RPC_TIMEOUT,
        })
    }

    async fn reload_topology(&self) -> Result<()> {
        let consumer = Arc::clone(&self.consumer);
        let timeout = self.timeout;
        let snapshot = tokio::task::spawn_blocking(move || -> Result<TopologySnapshot> {
            let metadata = consumer.fetch_metadata(None, timeout)?;
            Ok(snapshot_from(&metadata))
        })
        .await
        .map_err(|e| MeterError::Kafka(format!("metadata task failed: {e}")))??;

        *self.topology.lock().expect("topology lock") = Some(snapshot);
        Ok(())
    }

    async fn topology(&self) -> Result<TopologySnapshot> {
        if let Some(snapshot) = self.topology.lock().expect("topology lock").clone() {
            return Ok(snapshot);
        }
        self.reload_topology().await?;
        Ok(self
            .topology
            .lock()
            .expect("topology lock")
            .clone()
            .unwrap_or_default())
    }

    async fn partition_meta(&self, topic: &str, partition: i32) -> Result<PartitionMeta> {
        let topology = self.topology().await?;
        topology
            .topics
            .get(topic)
            .and_then(|partitions| partitions.iter().find(|p| p.id == partition))
            .cloned()
            .ok_or_else(|| {
                MeterError::Kafka(format!("unknown topic/partition {topic}/{partition}"))
            })
    }
}

fn snapshot_from(metadata: &Metadata) -> TopologySnapshot {
    let brokers = metadata
        .brokers()
        .iter()
        .map(|b| Broker {
            id: b.id(),
            address: format!("{}:{}", b.host(), b.port()),
        })
        .collect();
    let topics = metadata
        .topics()
        .iter()
        .map(|t| {
            let partitions = t
                .partitions()
                .iter()
                .map(|p| PartitionMeta {
                    id: p.id(),
                    leader: p.leader(),
                    replicas: p.replicas().to_vec(),
                    isr: p.isr().to_vec(),
                })
                .collect();
            (t.name().to_string(), partitions)
        })
        .collect();
    TopologySnapshot { brokers, topics }
}

#[async_trait]
impl ClusterClient for RdCluster {
    async fn brokers(&self) -> Result<Vec<Broker>> {
        Ok(self.topology().await?.brokers)
    }

    async fn refresh_metadata(&self) -> Result<()> {
        self.reload_topology().await
    }

    async fn topics(&self) -> Result<Vec<String>> {
        let mut topics: Vec<String> = self.topology().await?.topics.into_keys().collect();
        topics.sort_unstable();
        Ok(topics)
    }

    async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        let topology = self.topology().await?;
        let partitions = topology
            .topics
            .get(topic)
            .ok_or_else(|| MeterError::Kafka(format!("unknown topic {topic}")))?;
        let mut ids: Vec<i32> = partitions.iter().map(|p| p.id).collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn partition_leader(&self, topic: &str, partition: i32) -> Result<i32> {
        Ok(self.partition_meta(topic, partition).await?.leader)
    }

    async fn partition_replicas(&self, topic: &str, partition: i32) -> Result<Vec<i32>> {
        Ok(self.partition_meta(topic, partition).await?.replicas)
    }

    async fn partition_in_sync_replicas(&self, topic: &str, partition: i32) -> Result<Vec<i32>> {
        Ok(self.partition_meta(topic, partition).await?.isr)
    }

    async fn partition_offset(&self, topic: &str, partition: i32, spec: OffsetSpec) -> Result<i64> {
        let consumer = Arc::clone(&self.consumer);
        let timeout = self.timeout;
        let topic = topic.to_string();
        let (oldest, newest) = tokio::task::spawn_blocking(move || -> Result<(i64, i64)> {
            Ok(consumer.fetch_watermarks(&topic, partition, timeout)?)
        })
        .await
        .map_err(|e| MeterError::Kafka(format!("watermark task failed: {e}")))??;
        Ok(match spec {
            OffsetSpec::Newest => newest,
            OffsetSpec::Oldest => oldest,
        })
    }

    async fn group_coordinator(&self, broker: &Broker) -> Result<Box<dyn GroupCoordinator>> {
        let mut broker_ids: Vec<i32> = self.topology().await?.brokers.iter().map(|b| b.id).collect();
        broker_ids.sort_unstable();
        Ok(Box::new(RdGroupCoordinator {
            consumer: Arc::clone(&self.consumer),
            base_config: self.base_config.clone(),
            broker_id: broker.id,
            broker_ids,
            timeout: self.timeout,
        }))
    }

    async fn group_committed_offsets(
        &self,
        group: &str,
        partitions: &HashMap<String, Vec<i32>>,
    ) -> Result<HashMap<TopicPartition, i64>> {
        let requested: Vec<TopicPartition> = partitions
            .iter()
            .flat_map(|(topic, ids)| {
                ids.iter().map(|id| TopicPartition::new(topic.clone(), *id))
            })
            .collect();
        let committed =
            fetch_committed(self.base_config.clone(), group, requested, self.timeout).await?;
        Ok(committed
            .into_iter()
            .filter(|(_, offset)| *offset >= 0)
            .collect())
    }
}

/// Per-broker group-query handle. librdkafka's group listing is cluster-wide,
/// so groups are assigned to exactly one broker handle by a stable hash of
/// the group id over the broker list, which mirrors how Kafka spreads group
/// coordinators across brokers.
struct RdGroupCoordinator {
    consumer: Arc<BaseConsumer>,
    base_config: ClientConfig,
    broker_id: i32,
    broker_ids: Vec<i32>,
    timeout: Duration,
}

#[async_trait]
impl GroupCoordinator for RdGroupCoordinator {
    async fn list_groups(&self) -> Result<Vec<String>> {
        let consumer = Arc::clone(&self.consumer);
        let timeout = self.timeout;
        let names = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let list = consumer.fetch_group_list(None, timeout)?;
            Ok(list.groups().iter().map(|g| g.name().to_string()).collect())
        })
        .await
        .map_err(|e| MeterError::Kafka(format!("group list task failed: {e}")))??;

        Ok(names
            .into_iter()
            .filter(|name| coordinator_for(name, &self.broker_ids) == self.broker_id)
            .collect())
    }

    async fn describe_groups(&self, groups: &[String]) -> Result<Vec<GroupDescription>> {
        let consumer = Arc::clone(&self.consumer);
        let timeout = self.timeout;
        let groups = groups.to_vec();
        tokio::task::spawn_blocking(move || -> Result<Vec<GroupDescription>> {
            let mut described = Vec::with_capacity(groups.len());
            for group in &groups {
                let list = consumer.fetch_group_list(Some(group.as_str()), timeout)?;
                for info in list.groups() {
                    let members = info
                        .members()
                        .iter()
                        .map(|m| GroupMember {
                            member_id: m.id().to_string(),
                            client_id: m.client_id().to_string(),
                            client_host: m.client_host().to_string(),
                            assignments: m
                                .assignment()
                                .map(decode_member_assignment)
                                .unwrap_or_default(),
                        })
                        .collect();
                    described.push(GroupDescription {
                        group_id: info.name().to_string(),
                        members,
                    });
                }
            }
            Ok(described)
        })
        .await
        .map_err(|e| MeterError::Kafka(format!("describe task failed: {e}")))?
    }

    async fn fetch_offsets(
        &self,
        group: &str,
        partitions: &[TopicPartition],
    ) -> Result<OffsetFetchResponse> {
        let committed =
            fetch_committed(self.base_config.clone(), group, partitions.to_vec(), self.timeout)
                .await?;
        let mut response = OffsetFetchResponse::default();
        for (tp, offset) in committed {
            response
                .blocks
                .entry(tp.topic)
                .or_default()
                .insert(tp.partition, OffsetBlock { offset, error: None });
        }
        Ok(response)
    }
}

/// Fetches a group's committed offsets through a short-lived consumer bound
/// to that group id. Offsets librdkafka reports as invalid come back as -1.
async fn fetch_committed(
    base_config: ClientConfig,
    group: &str,
    partitions: Vec<TopicPartition>,
    timeout: Duration,
) -> Result<Vec<(TopicPartition, i64)>> {
    let group = group.to_string();
    tokio::task::spawn_blocking(move || -> Result<Vec<(TopicPartition, i64)>> {
        let mut group_config = base_config;
        group_config.set("group.id", &group);
        let consumer: BaseConsumer = group_config.create()?;

        let mut tpl = TopicPartitionList::new();
        for tp in &partitions {
            tpl.add_partition(&tp.topic, tp.partition);
        }

        let committed = consumer.committed_offsets(tpl, timeout)?;
        Ok(committed
            .elements()
            .iter()
            .map(|elem| {
                (
                    TopicPartition::new(elem.topic(), elem.partition()),
                    raw_offset(elem.offset()),
                )
            })
            .collect())
    })
    .await
    .map_err(|e| MeterError::Kafka(format!("offset fetch task failed: {e}")))?
}

fn raw_offset(offset: Offset) -> i64 {
    match offset {
        Offset::Offset(value) => value,
        _ => -1,
    }
}

fn coordinator_for(group: &str, broker_ids: &[i32]) -> i32 {
    if broker_ids.is_empty() {
        return -1;
    }
    let mut hasher = DefaultHasher::new();
    group.hash(&mut hasher);
    broker_ids[(hasher.finish() % broker_ids.len() as u64) as usize]
}

/// Decodes the ConsumerProtocol member assignment wire format:
/// version(i16), [topic(str16), [partition(i32)]].
fn decode_member_assignment(data: &[u8]) -> Vec<TopicPartition> {
    let mut cursor = WireCursor::new(data);
    let mut assignments = Vec::new();

    let (Some(_version), Some(topic_count)) = (cursor.read_i16(), cursor.read_i32()) else {
        return assignments;
    };
    for _ in 0..topic_count {
        let Some(topic) = cursor.read_string() else {
            return assignments;
        };
        let Some(partition_count) = cursor.read_i32() else {
            return assignments;
        };
        for _ in 0..partition_count {
            let Some(partition) = cursor.read_i32() else {
                return assignments;
            };
            assignments.push(TopicPartition::new(topic.clone(), partition));
        }
    }
    assignments
}

struct WireCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn read_i16(&mut self) -> Option<i16> {
        let bytes = self.take(2)?;
        Some(i16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_i32(&mut self) -> Option<i32> {
        let bytes = self.take(4)?;
        Some(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_string(&mut self) -> Option<String> {
        let len = self.read_i16()?;
        if len < 0 {
            return None;
        }
        let bytes = self.take(len as usize)?;
        Some(String::from_utf8_lossy(bytes).to_string())
    }
}

/// Builds a fresh [`RdCluster`] per call; used by the pruner so each pass
/// runs against its own session.
pub struct RdClusterFactory {
    config: Config,
}

impl RdClusterFactory {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ClientFactory for RdClusterFactory {
    async fn create(&self) -> Result<Box<dyn ClusterClient>> {
        Ok(Box::new(RdCluster::connect(&self.config)?))
    }
}

/// Maps the exporter configuration onto librdkafka session properties.
pub fn build_client_config(config: &Config) -> Result<ClientConfig> {
    let kafka = &config.kafka;
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", kafka.brokers.join(","))
        .set("client.id", CLIENT_ID)
        .set("group.id", format!("{CLIENT_ID}-internal"))
        .set("enable.auto.commit", "false")
        .set("broker.version.fallback", &kafka.version)
        .set(
            "topic.metadata.refresh.interval.ms",
            config
                .exporter
                .metadata_refresh_interval
                .as_millis()
                .to_string(),
        )
        .set(
            "allow.auto.create.topics",
            if kafka.allow_auto_topic_creation {
                "true"
            } else {
                "false"
            },
        );

    let protocol = match (kafka.tls.enabled, kafka.sasl.enabled) {
        (false, false) => "plaintext",
        (true, false) => "ssl",
        (false, true) => "sasl_plaintext",
        (true, true) => "sasl_ssl",
    };
    client_config.set("security.protocol", protocol);

    if kafka.tls.enabled {
        if let Some(ca_file) = &kafka.tls.ca_file {
            client_config.set("ssl.ca.location", ca_file);
        }
        if crate::config::cert_and_key_pair(
            kafka.tls.cert_file.as_deref(),
            kafka.tls.key_file.as_deref(),
        )? {
            client_config.set(
                "ssl.certificate.location",
                kafka.tls.cert_file.as_deref().unwrap_or_default(),
            );
            client_config.set(
                "ssl.key.location",
                kafka.tls.key_file.as_deref().unwrap_or_default(),
            );
        }
        if kafka.tls.insecure_skip_verify {
            client_config.set("enable.ssl.certificate.verification", "false");
        }
    }

    if kafka.sasl.enabled {
        let mechanism = SaslMechanism::parse(&kafka.sasl.mechanism)?;
        client_config.set("sasl.mechanism", mechanism.wire_name());
        if !kafka.sasl.username.is_empty() {
            client_config.set("sasl.username", &kafka.sasl.username);
        }
        if !kafka.sasl.password.is_empty() {
            client_config.set("sasl.password", &kafka.sasl.password);
        }
        if mechanism == SaslMechanism::Gssapi {
            let kerberos = &kafka.sasl.kerberos;
            if !kerberos.service_name.is_empty() {
                client_config.set("sasl.kerberos.service.name", &kerberos.service_name);
            }
            if !kafka.sasl.username.is_empty() {
                client_config.set("sasl.kerberos.principal", &kafka.sasl.username);
            }
            if kerberos.auth_type == "keytab" && !kerberos.keytab_path.is_empty() {
                client_config.set("sasl.kerberos.keytab", &kerberos.keytab_path);
            }
        }
    }

    Ok(client_config)
}
