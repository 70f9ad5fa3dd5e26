use crate::collector::timeline::OffsetTimeline;
use crate::config::ScrapeFilters;
use crate::kafka::client::{ClusterClient, ZookeeperOffsets};
use crate::metrics::descriptors::Descriptors;
use crate::metrics::types::MetricPoint;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::info;

#[derive(Debug, Clone)]
pub struct ExporterOptions {
    /// Constant labels as `k1=v1,k2=v2`.
    pub labels: String,
    pub metadata_refresh_interval: Duration,
    pub offset_show_all: bool,
    pub topic_workers: usize,
    pub allow_concurrent: bool,
}

impl Default for ExporterOptions {
    fn default() -> Self {
        Self {
            labels: String::new(),
            metadata_refresh_interval: Duration::from_secs(30),
            offset_show_all: true,
            topic_workers: 100,
            allow_concurrent: false,
        }
    }
}

/// Owns the cluster session, the offset timeline and the per-scrape state.
/// `collect` is the scrape entry point; overlapping scrapes are coalesced
/// onto one underlying collection unless concurrent mode is enabled.
pub struct Exporter {
    pub(crate) client: Arc<dyn ClusterClient>,
    pub(crate) zookeeper: Option<Arc<dyn ZookeeperOffsets>>,
    pub(crate) filters: ScrapeFilters,
    pub(crate) descriptors: Descriptors,
    pub(crate) timeline: Arc<OffsetTimeline>,
    pub(crate) offset_show_all: bool,
    pub(crate) topic_workers: usize,
    pub(crate) metadata_refresh_interval: Duration,
    pub(crate) next_metadata_refresh: std::sync::Mutex<SystemTime>,
    allow_concurrent: bool,
    gather: Mutex<GatherState>,
}

struct GatherState {
    /// Output sinks of scrapes waiting on the in-flight collection.
    sinks: Vec<mpsc::UnboundedSender<MetricPoint>>,
    /// Signalled when the in-flight collection has been replayed to every
    /// registered sink.
    waiter: broadcast::Sender<()>,
}

impl Exporter {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        zookeeper: Option<Arc<dyn ZookeeperOffsets>>,
        filters: ScrapeFilters,
        options: ExporterOptions,
    ) -> Self {
        let (waiter, _) = broadcast::channel(1);
        Self {
            client,
            zookeeper,
            filters,
            descriptors: Descriptors::new(&options.labels),
            timeline: Arc::new(OffsetTimeline::new()),
            offset_show_all: options.offset_show_all,
            topic_workers: options.topic_workers,
            metadata_refresh_interval: options.metadata_refresh_interval,
            next_metadata_refresh: std::sync::Mutex::new(SystemTime::now()),
            allow_concurrent: options.allow_concurrent,
            gather: Mutex::new(GatherState {
                sinks: Vec::new(),
                waiter,
            }),
        }
    }

    pub fn timeline(&self) -> Arc<OffsetTimeline> {
        Arc::clone(&self.timeline)
    }

    /// Runs one scrape into `sink`. In the default serialized mode a scrape
    /// arriving while another is in flight registers its sink and waits; the
    /// in-flight collection's metrics are broadcast to every waiter.
    pub async fn collect(self: &Arc<Self>, sink: mpsc::UnboundedSender<MetricPoint>) {
        if self.allow_concurrent {
            self.run_pipeline(&sink).await;
            return;
        }

        let mut waiter = {
            let mut gather = self.gather.lock().await;
            gather.sinks.push(sink);
            if gather.sinks.len() == 1 {
                let (waiter, _) = broadcast::channel(1);
                gather.waiter = waiter;
                let exporter = Arc::clone(self);
                tokio::spawn(async move {
                    exporter.collect_and_broadcast().await;
                });
            } else {
                info!("scrape already in flight, waiting for it to finish");
            }
            // Subscribe under the lock so a later batch cannot swap the
            // waiter out from under us.
            gather.waiter.subscribe()
        };

        let _ = waiter.recv().await;
    }

    async fn collect_and_broadcast(self: Arc<Self>) {
        let (buffer_tx, mut buffer_rx) = mpsc::unbounded_channel();
        let drain = tokio::spawn(async move {
            let mut buffered = Vec::new();
            while let Some(point) = buffer_rx.recv().await {
                buffered.push(point);
            }
            buffered
        });

        self.run_pipeline(&buffer_tx).await;
        drop(buffer_tx);
        let buffered = drain.await.unwrap_or_default();

        let mut gather = self.gather.lock().await;
        for sink in gather.sinks.drain(..) {
            for point in &buffered {
                if sink.send(point.clone()).is_err() {
                    break;
                }
            }
        }
        let _ = gather.waiter.send(());
    }
}
