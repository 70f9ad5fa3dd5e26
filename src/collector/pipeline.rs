use crate::collector::estimator::{estimate_time_lag, EstimationMethod};
use crate::collector::exporter::Exporter;
use crate::collector::unix_time_ms;
use crate::kafka::client::{Broker, OffsetSpec, TopicPartition, NO_COMMITTED_OFFSET};
use crate::metrics::types::MetricPoint;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Newest producer offsets recorded by the topic workers for the current
/// scrape, read by the group workers.
type ScrapeOffsets = Arc<std::sync::Mutex<HashMap<String, HashMap<i32, i64>>>>;

fn emit(sink: &mpsc::UnboundedSender<MetricPoint>, point: MetricPoint) -> bool {
    sink.send(point).is_ok()
}

impl Exporter {
    /// One end-to-end collection: broker gauges, topic/partition metrics
    /// through a bounded worker pool, per-broker consumer-group metrics, and
    /// finally the time-lag estimation pass over the offset timeline.
    ///
    /// RPC failures drop the affected metrics for this scrape and never
    /// abort the collection.
    pub(crate) async fn run_pipeline(self: &Arc<Self>, sink: &mpsc::UnboundedSender<MetricPoint>) {
        let descriptors = &self.descriptors;

        let brokers = match self.client.brokers().await {
            Ok(brokers) => brokers,
            Err(e) => {
                error!(error = %e, "cannot list brokers");
                Vec::new()
            }
        };
        emit(sink, descriptors.brokers.gauge(brokers.len() as f64, &[]));
        for broker in &brokers {
            emit(
                sink,
                descriptors
                    .broker_info
                    .gauge(1.0, &[&broker.id.to_string(), &broker.address]),
            );
        }

        self.maybe_refresh_metadata().await;

        let topics = match self.client.topics().await {
            Ok(topics) => topics,
            Err(e) => {
                error!(error = %e, "cannot list topics");
                return;
            }
        };

        let offsets: ScrapeOffsets = Arc::new(std::sync::Mutex::new(HashMap::new()));

        let admitted: Vec<String> = topics
            .iter()
            .filter(|topic| self.filters.admits_topic(topic))
            .cloned()
            .collect();

        let worker_count = if topics.len() <= 1 {
            topics.len()
        } else {
            (topics.len() / 2).min(self.topic_workers)
        };

        // Workers are running before the first topic is queued, so the
        // capacity-1 queue cannot deadlock.
        let (topic_tx, topic_rx) = mpsc::channel::<String>(1);
        let topic_rx = Arc::new(Mutex::new(topic_rx));
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let exporter = Arc::clone(self);
            let topic_rx = Arc::clone(&topic_rx);
            let sink = sink.clone();
            let offsets = Arc::clone(&offsets);
            workers.push(tokio::spawn(async move {
                loop {
                    let topic = {
                        let mut topic_rx = topic_rx.lock().await;
                        topic_rx.recv().await
                    };
                    match topic {
                        Some(topic) => exporter.topic_metrics(&topic, &sink, &offsets).await,
                        None => break,
                    }
                }
            }));
        }
        for topic in admitted {
            if topic_tx.send(topic).await.is_err() {
                break;
            }
        }
        drop(topic_tx);
        join_all(workers).await;

        // All newest offsets are recorded; group workers may read them now.
        if brokers.is_empty() {
            warn!("no reachable broker, skipping consumer group metrics");
        } else {
            let mut group_tasks = Vec::with_capacity(brokers.len());
            for broker in brokers {
                let exporter = Arc::clone(self);
                let sink = sink.clone();
                let offsets = Arc::clone(&offsets);
                group_tasks.push(tokio::spawn(async move {
                    exporter.group_metrics(broker, &sink, &offsets).await;
                }));
            }
            join_all(group_tasks).await;
        }

        self.lag_metrics(sink).await;
    }

    async fn maybe_refresh_metadata(&self) {
        let now = SystemTime::now();
        let due = {
            let next = self.next_metadata_refresh.lock().expect("refresh deadline lock");
            now >= *next
        };
        if !due {
            return;
        }

        info!("refreshing cluster metadata");
        if let Err(e) = self.client.refresh_metadata().await {
            warn!(error = %e, "metadata refresh failed, continuing with cached topology");
        }
        *self.next_metadata_refresh.lock().expect("refresh deadline lock") =
            now + self.metadata_refresh_interval;
    }

    async fn topic_metrics(
        &self,
        topic: &str,
        sink: &mpsc::UnboundedSender<MetricPoint>,
        offsets: &ScrapeOffsets,
    ) {
        let descriptors = &self.descriptors;

        let partitions = match self.client.partitions(topic).await {
            Ok(partitions) => partitions,
            Err(e) => {
                error!(topic = %topic, error = %e, "cannot list partitions");
                return;
            }
        };
        emit(
            sink,
            descriptors
                .topic_partitions
                .gauge(partitions.len() as f64, &[topic]),
        );
        offsets
            .lock()
            .expect("offset map lock")
            .insert(topic.to_string(), HashMap::with_capacity(partitions.len()));

        for partition in partitions {
            let partition_label = partition.to_string();
            let labels = [topic, partition_label.as_str()];

            let leader = match self.client.partition_leader(topic, partition).await {
                Ok(leader) => {
                    emit(sink, descriptors.partition_leader.gauge(leader as f64, &labels));
                    Some(leader)
                }
                Err(e) => {
                    error!(topic = %topic, partition, error = %e, "cannot get partition leader");
                    None
                }
            };

            let newest = match self
                .client
                .partition_offset(topic, partition, OffsetSpec::Newest)
                .await
            {
                Ok(offset) => {
                    if let Some(by_partition) =
                        offsets.lock().expect("offset map lock").get_mut(topic)
                    {
                        by_partition.insert(partition, offset);
                    }
                    emit(
                        sink,
                        descriptors.partition_current_offset.gauge(offset as f64, &labels),
                    );
                    Some(offset)
                }
                Err(e) => {
                    error!(topic = %topic, partition, error = %e, "cannot get newest offset");
                    None
                }
            };

            match self
                .client
                .partition_offset(topic, partition, OffsetSpec::Oldest)
                .await
            {
                Ok(offset) => {
                    emit(
                        sink,
                        descriptors.partition_oldest_offset.gauge(offset as f64, &labels),
                    );
                }
                Err(e) => {
                    error!(topic = %topic, partition, error = %e, "cannot get oldest offset");
                }
            }

            let replicas = match self.client.partition_replicas(topic, partition).await {
                Ok(replicas) => {
                    emit(
                        sink,
                        descriptors
                            .partition_replicas
                            .gauge(replicas.len() as f64, &labels),
                    );
                    Some(replicas)
                }
                Err(e) => {
                    error!(topic = %topic, partition, error = %e, "cannot get replicas");
                    None
                }
            };

            let in_sync = match self.client.partition_in_sync_replicas(topic, partition).await {
                Ok(in_sync) => {
                    emit(
                        sink,
                        descriptors
                            .partition_in_sync_replicas
                            .gauge(in_sync.len() as f64, &labels),
                    );
                    Some(in_sync)
                }
                Err(e) => {
                    error!(topic = %topic, partition, error = %e, "cannot get in-sync replicas");
                    None
                }
            };

            if let (Some(leader), Some(replicas)) = (leader, &replicas) {
                let preferred = replicas.first() == Some(&leader);
                emit(
                    sink,
                    descriptors
                        .partition_leader_is_preferred
                        .gauge(f64::from(i32::from(preferred)), &labels),
                );
            }

            if let (Some(replicas), Some(in_sync)) = (&replicas, &in_sync) {
                let under_replicated = in_sync.len() < replicas.len();
                emit(
                    sink,
                    descriptors
                        .partition_under_replicated
                        .gauge(f64::from(i32::from(under_replicated)), &labels),
                );
            }

            if let (Some(zookeeper), Some(newest)) = (&self.zookeeper, newest) {
                self.zookeeper_group_lag(zookeeper.as_ref(), topic, partition, newest, sink)
                    .await;
            }
        }
    }

    async fn zookeeper_group_lag(
        &self,
        zookeeper: &dyn crate::kafka::client::ZookeeperOffsets,
        topic: &str,
        partition: i32,
        newest: i64,
        sink: &mpsc::UnboundedSender<MetricPoint>,
    ) {
        let groups = match zookeeper.consumer_groups().await {
            Ok(groups) => groups,
            Err(e) => {
                error!(error = %e, "cannot list zookeeper consumer groups");
                return;
            }
        };

        for group in groups {
            match zookeeper.committed_offset(&group, topic, partition).await {
                Ok(Some(committed)) if committed > 0 => {
                    emit(
                        sink,
                        self.descriptors.consumergroup_lag_zookeeper.gauge(
                            (newest - committed) as f64,
                            &[&group, topic, &partition.to_string()],
                        ),
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(group = %group, topic = %topic, partition, error = %e,
                        "cannot read zookeeper offset");
                }
            }
        }
    }

    async fn group_metrics(
        &self,
        broker: Broker,
        sink: &mpsc::UnboundedSender<MetricPoint>,
        offsets: &ScrapeOffsets,
    ) {
        let descriptors = &self.descriptors;

        let coordinator = match self.client.group_coordinator(&broker).await {
            Ok(coordinator) => coordinator,
            Err(e) => {
                error!(broker = broker.id, error = %e, "cannot connect to broker");
                return;
            }
        };

        let groups = match coordinator.list_groups().await {
            Ok(groups) => groups,
            Err(e) => {
                error!(broker = broker.id, error = %e, "cannot list consumer groups");
                return;
            }
        };
        let admitted: Vec<String> = groups
            .into_iter()
            .filter(|group| self.filters.admits_group(group))
            .collect();

        let described = match coordinator.describe_groups(&admitted).await {
            Ok(described) => described,
            Err(e) => {
                error!(broker = broker.id, error = %e, "cannot describe consumer groups");
                return;
            }
        };

        for group in described {
            let requested: Vec<TopicPartition> = if self.offset_show_all {
                let offsets = offsets.lock().expect("offset map lock");
                offsets
                    .iter()
                    .flat_map(|(topic, by_partition)| {
                        by_partition
                            .keys()
                            .map(|partition| TopicPartition::new(topic.clone(), *partition))
                    })
                    .collect()
            } else {
                group
                    .members
                    .iter()
                    .flat_map(|member| member.assignments.iter().cloned())
                    .collect()
            };

            emit(
                sink,
                descriptors
                    .consumergroup_members
                    .gauge(group.members.len() as f64, &[&group.group_id]),
            );

            let response = match coordinator.fetch_offsets(&group.group_id, &requested).await {
                Ok(response) => response,
                Err(e) => {
                    error!(group = %group.group_id, error = %e, "cannot fetch group offsets");
                    continue;
                }
            };

            for (topic, blocks) in &response.blocks {
                if !self.filters.admits_topic(topic) {
                    continue;
                }
                // A group is only reported for topics it actually consumes.
                if !blocks.values().any(|block| block.offset != NO_COMMITTED_OFFSET) {
                    continue;
                }

                let mut current_offset_sum = 0i64;
                let mut lag_sum = 0i64;
                for (&partition, block) in blocks {
                    if let Some(block_error) = &block.error {
                        error!(topic = %topic, partition, error = %block_error,
                            "skipping partition block");
                        continue;
                    }

                    let committed = block.offset;
                    current_offset_sum += committed;
                    let partition_label = partition.to_string();
                    let labels = [group.group_id.as_str(), topic.as_str(), partition_label.as_str()];
                    emit(
                        sink,
                        descriptors
                            .consumergroup_current_offset
                            .gauge(committed as f64, &labels),
                    );

                    let newest = {
                        let offsets = offsets.lock().expect("offset map lock");
                        offsets
                            .get(topic)
                            .and_then(|by_partition| by_partition.get(&partition))
                            .copied()
                    };
                    match newest {
                        Some(newest) => {
                            self.timeline
                                .create_or_update(&group.group_id, topic, partition, newest)
                                .await;
                            // No commit on a consumed topic is reported as -1
                            // so it stays alertable.
                            let lag = if committed == NO_COMMITTED_OFFSET {
                                -1
                            } else {
                                let lag = newest - committed;
                                lag_sum += lag;
                                lag
                            };
                            emit(sink, descriptors.consumergroup_lag.gauge(lag as f64, &labels));
                        }
                        None => {
                            error!(topic = %topic, partition,
                                "no newest offset for partition, cannot compute group lag");
                        }
                    }
                }

                let group_topic_labels = [group.group_id.as_str(), topic.as_str()];
                emit(
                    sink,
                    descriptors
                        .consumergroup_current_offset_sum
                        .gauge(current_offset_sum as f64, &group_topic_labels),
                );
                emit(
                    sink,
                    descriptors
                        .consumergroup_lag_sum
                        .gauge(lag_sum as f64, &group_topic_labels),
                );
            }
        }
    }

    /// Estimates time lag for every timeline entry with a known committed
    /// offset. Holds the timeline mutex for the whole pass; scrapes are
    /// infrequent and serialized, so mutation cannot starve.
    async fn lag_metrics(&self, sink: &mpsc::UnboundedSender<MetricPoint>) {
        let descriptors = &self.descriptors;
        let entries = self.timeline.entries().await;

        for (group, topics) in entries.iter() {
            for (topic, partitions) in topics {
                let request: HashMap<String, Vec<i32>> =
                    HashMap::from([(topic.clone(), partitions.keys().copied().collect())]);
                let committed = match self.client.group_committed_offsets(group, &request).await {
                    Ok(committed) => committed,
                    Err(e) => {
                        error!(group = %group, topic = %topic, error = %e,
                            "cannot list committed offsets");
                        continue;
                    }
                };

                for (partition, samples) in partitions {
                    if samples.len() < 2 {
                        debug!(group = %group, topic = %topic, partition,
                            "insufficient history for time lag estimation");
                        continue;
                    }
                    let key = TopicPartition::new(topic.clone(), *partition);
                    let Some(consumed) = committed.get(&key) else {
                        warn!(group = %group, topic = %topic, partition,
                            "no committed offset for partition");
                        continue;
                    };

                    let Some(estimate) = estimate_time_lag(samples, *consumed, unix_time_ms())
                    else {
                        continue;
                    };

                    let partition_label = partition.to_string();
                    let labels = [group.as_str(), topic.as_str(), partition_label.as_str()];
                    match estimate.method {
                        EstimationMethod::Interpolation => {
                            emit(sink, descriptors.consumer_lag_interpolation.counter(1.0, &labels));
                        }
                        EstimationMethod::Extrapolation => {
                            emit(sink, descriptors.consumer_lag_extrapolation.counter(1.0, &labels));
                        }
                    }
                    debug!(group = %group, topic = %topic, partition,
                        lag_ms = estimate.lag_ms, method = ?estimate.method, "estimated time lag");
                    emit(sink, descriptors.consumer_lag_millis.gauge(estimate.lag_ms, &labels));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::collector::exporter::ExporterOptions;
    use crate::kafka::client::GroupMember;
    use crate::kafka::client::TopicPartition;
    use crate::test_cluster::{
        collect_points, gauge_value, points_named, test_exporter, test_filters, test_options,
        MockCluster, MockPartition,
    };
    use std::sync::Arc;

    fn healthy_cluster() -> MockCluster {
        let cluster = MockCluster::new();
        cluster.add_broker(1, "kafka-1:9092");
        cluster.add_broker(2, "kafka-2:9092");
        cluster.add_broker(3, "kafka-3:9092");
        cluster.add_topic(
            "t",
            vec![MockPartition {
                id: 0,
                leader: 1,
                replicas: vec![1, 2, 3],
                isr: vec![1, 2, 3],
                newest: 100,
                oldest: 0,
            }],
        );
        cluster
    }

    #[tokio::test]
    async fn test_healthy_partition_metrics() {
        let exporter = Arc::new(test_exporter(healthy_cluster(), test_options()));
        let points = collect_points(&exporter).await;

        let tp = [("topic", "t"), ("partition", "0")];
        assert_eq!(gauge_value(&points, "kafka_topic_partitions", &[("topic", "t")]), Some(1.0));
        assert_eq!(gauge_value(&points, "kafka_topic_partition_leader", &tp), Some(1.0));
        assert_eq!(gauge_value(&points, "kafka_topic_partition_replicas", &tp), Some(3.0));
        assert_eq!(gauge_value(&points, "kafka_topic_partition_in_sync_replica", &tp), Some(3.0));
        assert_eq!(
            gauge_value(&points, "kafka_topic_partition_leader_is_preferred", &tp),
            Some(1.0)
        );
        assert_eq!(
            gauge_value(&points, "kafka_topic_partition_under_replicated_partition", &tp),
            Some(0.0)
        );
        assert_eq!(
            gauge_value(&points, "kafka_topic_partition_current_offset", &tp),
            Some(100.0)
        );
        assert_eq!(
            gauge_value(&points, "kafka_topic_partition_oldest_offset", &tp),
            Some(0.0)
        );
    }

    #[tokio::test]
    async fn test_under_replicated_partition_with_non_preferred_leader() {
        let cluster = MockCluster::new();
        cluster.add_broker(1, "kafka-1:9092");
        cluster.add_broker(2, "kafka-2:9092");
        cluster.add_topic(
            "t",
            vec![MockPartition {
                id: 0,
                leader: 2,
                replicas: vec![1, 2, 3],
                isr: vec![1, 2],
                newest: 10,
                oldest: 0,
            }],
        );
        let exporter = Arc::new(test_exporter(cluster, test_options()));
        let points = collect_points(&exporter).await;

        let tp = [("topic", "t"), ("partition", "0")];
        assert_eq!(
            gauge_value(&points, "kafka_topic_partition_under_replicated_partition", &tp),
            Some(1.0)
        );
        assert_eq!(
            gauge_value(&points, "kafka_topic_partition_leader_is_preferred", &tp),
            Some(0.0)
        );
    }

    #[tokio::test]
    async fn test_broker_count_matches_broker_info_emissions() {
        let exporter = Arc::new(test_exporter(healthy_cluster(), test_options()));
        let points = collect_points(&exporter).await;

        let broker_gauges = points_named(&points, "kafka_brokers");
        assert_eq!(broker_gauges.len(), 1);
        let infos = points_named(&points, "kafka_broker_info");
        assert_eq!(broker_gauges[0].value.as_f64(), infos.len() as f64);
        assert!(infos
            .iter()
            .any(|p| p.labels.get("address").map(String::as_str) == Some("kafka-2:9092")));
    }

    #[tokio::test]
    async fn test_group_lag_equals_newest_minus_committed() {
        let cluster = healthy_cluster();
        cluster.commit("g", "t", 0, 75);
        let exporter = Arc::new(test_exporter(cluster, test_options()));
        let points = collect_points(&exporter).await;

        let gtp = [("consumergroup", "g"), ("topic", "t"), ("partition", "0")];
        assert_eq!(
            gauge_value(&points, "kafka_consumergroup_current_offset", &gtp),
            Some(75.0)
        );
        assert_eq!(gauge_value(&points, "kafka_consumergroup_lag", &gtp), Some(25.0));
        assert_eq!(
            gauge_value(
                &points,
                "kafka_consumergroup_lag_sum",
                &[("consumergroup", "g"), ("topic", "t")]
            ),
            Some(25.0)
        );
        assert_eq!(gauge_value(&points, "kafka_consumergroup_members", &[("consumergroup", "g")]), Some(0.0));
    }

    #[tokio::test]
    async fn test_uncommitted_partition_reports_minus_one_and_is_left_out_of_lag_sum() {
        let cluster = MockCluster::new();
        cluster.add_broker(1, "kafka-1:9092");
        cluster.add_topic(
            "t",
            vec![
                MockPartition::plain(0, 100),
                MockPartition::plain(1, 50),
            ],
        );
        cluster.commit("g", "t", 0, 90);
        // Partition 1 is consumed by the group but has no commit.
        cluster.commit_none("g", "t", 1);
        let exporter = Arc::new(test_exporter(cluster, test_options()));
        let points = collect_points(&exporter).await;

        assert_eq!(
            gauge_value(
                &points,
                "kafka_consumergroup_lag",
                &[("consumergroup", "g"), ("topic", "t"), ("partition", "1")]
            ),
            Some(-1.0)
        );
        // Only partition 0 contributes: 100 - 90.
        assert_eq!(
            gauge_value(
                &points,
                "kafka_consumergroup_lag_sum",
                &[("consumergroup", "g"), ("topic", "t")]
            ),
            Some(10.0)
        );
    }

    #[tokio::test]
    async fn test_topic_filters_drop_metrics_and_group_filters_drop_groups() {
        let cluster = MockCluster::new();
        cluster.add_broker(1, "kafka-1:9092");
        cluster.add_topic("orders", vec![MockPartition::plain(0, 10)]);
        cluster.add_topic("__consumer_offsets", vec![MockPartition::plain(0, 10)]);
        cluster.commit("checkout", "orders", 0, 5);
        cluster.commit("internal-reaper", "orders", 0, 5);

        let filters = test_filters(".*", "^__.*", ".*", "^internal-.*");
        let exporter = Arc::new(test_exporter_with_filters(cluster, filters));
        let points = collect_points(&exporter).await;

        assert!(gauge_value(&points, "kafka_topic_partitions", &[("topic", "orders")]).is_some());
        assert!(
            gauge_value(&points, "kafka_topic_partitions", &[("topic", "__consumer_offsets")])
                .is_none()
        );
        assert!(gauge_value(
            &points,
            "kafka_consumergroup_lag",
            &[("consumergroup", "checkout"), ("topic", "orders"), ("partition", "0")]
        )
        .is_some());
        assert!(points_named(&points, "kafka_consumergroup_lag")
            .iter()
            .all(|p| p.labels.get("consumergroup").map(String::as_str) != Some("internal-reaper")));
    }

    fn test_exporter_with_filters(
        cluster: MockCluster,
        filters: crate::config::ScrapeFilters,
    ) -> crate::collector::exporter::Exporter {
        crate::collector::exporter::Exporter::new(
            Arc::new(cluster),
            None,
            filters,
            test_options(),
        )
    }

    #[tokio::test]
    async fn test_member_assignment_scoped_offset_fetch() {
        let cluster = MockCluster::new();
        cluster.add_broker(1, "kafka-1:9092");
        cluster.add_topic("assigned", vec![MockPartition::plain(0, 10)]);
        cluster.add_topic("unassigned", vec![MockPartition::plain(0, 10)]);
        cluster.commit("g", "assigned", 0, 5);
        cluster.commit("g", "unassigned", 0, 5);
        cluster.add_member(
            "g",
            GroupMember {
                member_id: "m1".to_string(),
                client_id: "c1".to_string(),
                client_host: "/10.0.0.1".to_string(),
                assignments: vec![TopicPartition::new("assigned", 0)],
            },
        );

        let mut options = test_options();
        options.offset_show_all = false;
        let exporter = Arc::new(test_exporter(cluster, options));
        let points = collect_points(&exporter).await;

        assert!(gauge_value(
            &points,
            "kafka_consumergroup_current_offset",
            &[("consumergroup", "g"), ("topic", "assigned"), ("partition", "0")]
        )
        .is_some());
        assert!(gauge_value(
            &points,
            "kafka_consumergroup_current_offset",
            &[("consumergroup", "g"), ("topic", "unassigned"), ("partition", "0")]
        )
        .is_none());
        assert_eq!(
            gauge_value(&points, "kafka_consumergroup_members", &[("consumergroup", "g")]),
            Some(1.0)
        );
    }

    #[tokio::test]
    async fn test_errored_partition_block_is_skipped_but_siblings_survive() {
        let cluster = MockCluster::new();
        cluster.add_broker(1, "kafka-1:9092");
        cluster.add_topic(
            "t",
            vec![MockPartition::plain(0, 100), MockPartition::plain(1, 100)],
        );
        cluster.commit("g", "t", 0, 90);
        cluster.commit("g", "t", 1, 80);
        cluster.fail_block("g", "t", 1, "NOT_COORDINATOR");

        let exporter = Arc::new(test_exporter(cluster, test_options()));
        let points = collect_points(&exporter).await;

        assert!(gauge_value(
            &points,
            "kafka_consumergroup_current_offset",
            &[("consumergroup", "g"), ("topic", "t"), ("partition", "0")]
        )
        .is_some());
        assert!(gauge_value(
            &points,
            "kafka_consumergroup_current_offset",
            &[("consumergroup", "g"), ("topic", "t"), ("partition", "1")]
        )
        .is_none());
        // The sums only cover the healthy sibling.
        assert_eq!(
            gauge_value(
                &points,
                "kafka_consumergroup_lag_sum",
                &[("consumergroup", "g"), ("topic", "t")]
            ),
            Some(10.0)
        );
    }

    #[tokio::test]
    async fn test_time_lag_needs_two_sightings() {
        let cluster = healthy_cluster();
        cluster.commit("g", "t", 0, 50);
        let exporter = Arc::new(test_exporter(cluster, test_options()));

        let points = collect_points(&exporter).await;
        assert!(points_named(&points, "kafka_consumer_lag_millis").is_empty());
    }

    #[tokio::test]
    async fn test_time_lag_interpolation_after_offset_progress() {
        let cluster = healthy_cluster();
        cluster.commit("g", "t", 0, 150);
        let exporter = Arc::new(test_exporter(cluster.clone(), test_options()));

        collect_points(&exporter).await; // records newest = 100
        cluster.set_newest("t", 0, 200);
        let points = collect_points(&exporter).await; // records newest = 200, estimates

        let gtp = [("consumergroup", "g"), ("topic", "t"), ("partition", "0")];
        let lag_ms = gauge_value(&points, "kafka_consumer_lag_millis", &gtp)
            .expect("time lag emitted once two samples exist");
        assert!(lag_ms.is_finite());
        assert!(gauge_value(&points, "kafka_consumer_lag_interpolation", &gtp).is_some());
        assert!(gauge_value(&points, "kafka_consumer_lag_extrapolation", &gtp).is_none());
    }

    #[tokio::test]
    async fn test_time_lag_extrapolation_below_tracked_window() {
        let cluster = healthy_cluster();
        cluster.commit("g", "t", 0, 50);
        let exporter = Arc::new(test_exporter(cluster.clone(), test_options()));

        collect_points(&exporter).await;
        cluster.set_newest("t", 0, 200);
        let points = collect_points(&exporter).await;

        let gtp = [("consumergroup", "g"), ("topic", "t"), ("partition", "0")];
        assert!(gauge_value(&points, "kafka_consumer_lag_millis", &gtp).is_some());
        assert!(gauge_value(&points, "kafka_consumer_lag_extrapolation", &gtp).is_some());
        assert!(gauge_value(&points, "kafka_consumer_lag_interpolation", &gtp).is_none());
    }

    #[tokio::test]
    async fn test_metadata_refresh_respects_interval() {
        let cluster = healthy_cluster();
        let exporter = Arc::new(test_exporter(cluster.clone(), test_options()));

        collect_points(&exporter).await;
        assert_eq!(cluster.refresh_calls(), 1);

        // The next refresh is a full interval away.
        collect_points(&exporter).await;
        assert_eq!(cluster.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_scrape_survives_empty_cluster() {
        let cluster = MockCluster::new();
        let exporter = Arc::new(test_exporter(cluster, test_options()));
        let points = collect_points(&exporter).await;

        assert_eq!(gauge_value(&points, "kafka_brokers", &[]), Some(0.0));
    }

    #[tokio::test]
    async fn test_constant_labels_on_emitted_metrics() {
        let cluster = healthy_cluster();
        let options = ExporterOptions {
            labels: "cluster=main,env=prod".to_string(),
            ..test_options()
        };
        let exporter = Arc::new(test_exporter(cluster, options));
        let points = collect_points(&exporter).await;

        let brokers = points_named(&points, "kafka_brokers");
        assert_eq!(brokers[0].labels.get("cluster").map(String::as_str), Some("main"));
        assert_eq!(brokers[0].labels.get("env").map(String::as_str), Some("prod"));
    }

    #[tokio::test]
    async fn test_zookeeper_group_lag() {
        let cluster = healthy_cluster();
        cluster.set_zookeeper_offset("zk-group", "t", 0, 40);
        let exporter = Arc::new(crate::collector::exporter::Exporter::new(
            Arc::new(cluster.clone()),
            Some(Arc::new(cluster)),
            test_filters(".*", "^$", ".*", "^$"),
            test_options(),
        ));
        let points = collect_points(&exporter).await;

        assert_eq!(
            gauge_value(
                &points,
                "kafka_consumergroupzookeeper_lag_zookeeper",
                &[("consumergroup", "zk-group"), ("topic", "t"), ("partition", "0")]
            ),
            Some(60.0)
        );
    }
}
