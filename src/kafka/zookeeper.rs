use crate::error::{MeterError, Result};
use crate::kafka::client::ZookeeperOffsets;
use async_trait::async_trait;
use std::net::{SocketAddr, ToSocketAddrs};
use tokio_zookeeper::ZooKeeper;
use tracing::debug;

/// Reads consumer-group offsets committed to Zookeeper under the classic
/// `/consumers/<group>/offsets/<topic>/<partition>` layout.
pub struct ZkOffsetStore {
    zk: ZooKeeper,
}

impl ZkOffsetStore {
    pub async fn connect(servers: &[String]) -> Result<Self> {
        let addr = resolve_first(servers)?;
        let (zk, _default_watcher) = ZooKeeper::connect(&addr)
            .await
            .map_err(|e| MeterError::Zookeeper(format!("cannot connect to {addr}: {e}")))?;
        debug!(%addr, "connected to zookeeper");
        Ok(Self { zk })
    }
}

fn resolve_first(servers: &[String]) -> Result<SocketAddr> {
    let first = servers
        .first()
        .ok_or_else(|| MeterError::Config("no zookeeper servers configured".to_string()))?;
    first
        .to_socket_addrs()
        .map_err(|e| MeterError::Zookeeper(format!("cannot resolve {first}: {e}")))?
        .next()
        .ok_or_else(|| MeterError::Zookeeper(format!("no usable address for {first}")))
}

#[async_trait]
impl ZookeeperOffsets for ZkOffsetStore {
    async fn consumer_groups(&self) -> Result<Vec<String>> {
        let children = self
            .zk
            .get_children("/consumers")
            .await
            .map_err(|e| MeterError::Zookeeper(e.to_string()))?;
        Ok(children.unwrap_or_default())
    }

    async fn committed_offset(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
    ) -> Result<Option<i64>> {
        let path = format!("/consumers/{group}/offsets/{topic}/{partition}");
        let node = self
            .zk
            .get_data(&path)
            .await
            .map_err(|e| MeterError::Zookeeper(e.to_string()))?;

        let Some((bytes, _stat)) = node else {
            return Ok(None);
        };
        match String::from_utf8_lossy(&bytes).trim().parse::<i64>() {
            Ok(offset) => Ok(Some(offset)),
            Err(_) => {
                debug!(path = %path, "offset node holds no parseable integer");
                Ok(None)
            }
        }
    }
}
