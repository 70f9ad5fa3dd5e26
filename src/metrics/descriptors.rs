use crate::metrics::types::{Labels, MetricKind, MetricPoint, MetricValue};

/// A process-lived metric descriptor: fully-qualified name, help text,
/// variable label names and the exporter's constant labels.
#[derive(Debug, Clone)]
pub struct Descriptor {
    name: &'static str,
    help: &'static str,
    variable_labels: &'static [&'static str],
    const_labels: Labels,
}

impl Descriptor {
    fn new(
        name: &'static str,
        help: &'static str,
        variable_labels: &'static [&'static str],
        const_labels: &Labels,
    ) -> Self {
        Self {
            name,
            help,
            variable_labels,
            const_labels: const_labels.clone(),
        }
    }

    pub fn gauge(&self, value: f64, label_values: &[&str]) -> MetricPoint {
        self.point(MetricValue::Gauge(value), MetricKind::Gauge, label_values)
    }

    pub fn counter(&self, value: f64, label_values: &[&str]) -> MetricPoint {
        self.point(MetricValue::Counter(value), MetricKind::Counter, label_values)
    }

    fn point(&self, value: MetricValue, kind: MetricKind, label_values: &[&str]) -> MetricPoint {
        debug_assert_eq!(
            self.variable_labels.len(),
            label_values.len(),
            "label arity mismatch for {}",
            self.name
        );
        let mut labels = self.const_labels.clone();
        for (name, value) in self.variable_labels.iter().zip(label_values) {
            labels.insert((*name).to_string(), (*value).to_string());
        }
        MetricPoint {
            name: self.name,
            labels,
            value,
            help: self.help,
            kind,
        }
    }
}

/// All descriptors the exporter ever emits. Built once at construction and
/// shared across scrapes.
#[derive(Debug, Clone)]
pub struct Descriptors {
    pub brokers: Descriptor,
    pub broker_info: Descriptor,
    pub topic_partitions: Descriptor,
    pub partition_current_offset: Descriptor,
    pub partition_oldest_offset: Descriptor,
    pub partition_leader: Descriptor,
    pub partition_replicas: Descriptor,
    pub partition_in_sync_replicas: Descriptor,
    pub partition_leader_is_preferred: Descriptor,
    pub partition_under_replicated: Descriptor,
    pub consumergroup_current_offset: Descriptor,
    pub consumergroup_current_offset_sum: Descriptor,
    pub consumergroup_lag: Descriptor,
    pub consumergroup_lag_sum: Descriptor,
    pub consumergroup_lag_zookeeper: Descriptor,
    pub consumergroup_members: Descriptor,
    pub consumer_lag_millis: Descriptor,
    pub consumer_lag_interpolation: Descriptor,
    pub consumer_lag_extrapolation: Descriptor,
}

const TOPIC: &[&str] = &["topic"];
const TOPIC_PARTITION: &[&str] = &["topic", "partition"];
const GROUP: &[&str] = &["consumergroup"];
const GROUP_TOPIC: &[&str] = &["consumergroup", "topic"];
const GROUP_TOPIC_PARTITION: &[&str] = &["consumergroup", "topic", "partition"];

impl Descriptors {
    pub fn new(const_labels: &str) -> Self {
        let labels = parse_const_labels(const_labels);
        Self {
            brokers: Descriptor::new(
                "kafka_brokers",
                "Number of brokers in the Kafka cluster",
                &[],
                &labels,
            ),
            broker_info: Descriptor::new(
                "kafka_broker_info",
                "Information about a Kafka broker",
                &["id", "address"],
                &labels,
            ),
            topic_partitions: Descriptor::new(
                "kafka_topic_partitions",
                "Number of partitions for this topic",
                TOPIC,
                &labels,
            ),
            partition_current_offset: Descriptor::new(
                "kafka_topic_partition_current_offset",
                "Current (newest) offset of a topic/partition",
                TOPIC_PARTITION,
                &labels,
            ),
            partition_oldest_offset: Descriptor::new(
                "kafka_topic_partition_oldest_offset",
                "Oldest offset of a topic/partition",
                TOPIC_PARTITION,
                &labels,
            ),
            partition_leader: Descriptor::new(
                "kafka_topic_partition_leader",
                "Leader broker id of this topic/partition",
                TOPIC_PARTITION,
                &labels,
            ),
            partition_replicas: Descriptor::new(
                "kafka_topic_partition_replicas",
                "Number of replicas for this topic/partition",
                TOPIC_PARTITION,
                &labels,
            ),
            partition_in_sync_replicas: Descriptor::new(
                "kafka_topic_partition_in_sync_replica",
                "Number of in-sync replicas for this topic/partition",
                TOPIC_PARTITION,
                &labels,
            ),
            partition_leader_is_preferred: Descriptor::new(
                "kafka_topic_partition_leader_is_preferred",
                "1 if the topic/partition is led by its preferred replica",
                TOPIC_PARTITION,
                &labels,
            ),
            partition_under_replicated: Descriptor::new(
                "kafka_topic_partition_under_replicated_partition",
                "1 if the topic/partition is under-replicated",
                TOPIC_PARTITION,
                &labels,
            ),
            consumergroup_current_offset: Descriptor::new(
                "kafka_consumergroup_current_offset",
                "Current committed offset of a consumer group at a topic/partition",
                GROUP_TOPIC_PARTITION,
                &labels,
            ),
            consumergroup_current_offset_sum: Descriptor::new(
                "kafka_consumergroup_current_offset_sum",
                "Current committed offset of a consumer group at a topic, summed over partitions",
                GROUP_TOPIC,
                &labels,
            ),
            consumergroup_lag: Descriptor::new(
                "kafka_consumergroup_lag",
                "Current approximate lag of a consumer group at a topic/partition",
                GROUP_TOPIC_PARTITION,
                &labels,
            ),
            consumergroup_lag_sum: Descriptor::new(
                "kafka_consumergroup_lag_sum",
                "Current approximate lag of a consumer group at a topic, summed over partitions",
                GROUP_TOPIC,
                &labels,
            ),
            consumergroup_lag_zookeeper: Descriptor::new(
                "kafka_consumergroupzookeeper_lag_zookeeper",
                "Current approximate lag of a Zookeeper-committed consumer group at a topic/partition",
                GROUP_TOPIC_PARTITION,
                &labels,
            ),
            consumergroup_members: Descriptor::new(
                "kafka_consumergroup_members",
                "Number of members in a consumer group",
                GROUP,
                &labels,
            ),
            consumer_lag_millis: Descriptor::new(
                "kafka_consumer_lag_millis",
                "Estimated time lag in milliseconds of a consumer group at a topic/partition",
                GROUP_TOPIC_PARTITION,
                &labels,
            ),
            consumer_lag_interpolation: Descriptor::new(
                "kafka_consumer_lag_interpolation",
                "Indicates that a time lag estimation used interpolation",
                GROUP_TOPIC_PARTITION,
                &labels,
            ),
            consumer_lag_extrapolation: Descriptor::new(
                "kafka_consumer_lag_extrapolation",
                "Indicates that a time lag estimation used extrapolation",
                GROUP_TOPIC_PARTITION,
                &labels,
            ),
        }
    }
}

/// Parses `k1=v1,k2=v2,…`. Pairs without a `=` are skipped.
pub fn parse_const_labels(spec: &str) -> Labels {
    let mut labels = Labels::new();
    if spec.is_empty() {
        return labels;
    }
    for pair in spec.split(',') {
        if let Some((key, value)) = pair.split_once('=') {
            if !key.is_empty() {
                labels.insert(key.to_string(), value.to_string());
            }
        }
    }
    labels
}
