//! SkyDNS-style discovery records.
//!
//! Records live under `/skydns/<reversed domain>/...` so a CoreDNS etcd
//! plugin pointed at the same store can answer for them.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::DiscoveryConfig;
use crate::model::Node;
use crate::store::{keys, StateStore, StoreError};

pub const RECORD_TTL: u32 = 300;

const AGENTS_SHARD: &str = "agents";
const SCHEDULER_SERVICE: &str = "_persys-scheduler";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u16>,
    pub ttl: u32,
}

impl DnsRecord {
    fn a(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            priority: None,
            weight: None,
            ttl: RECORD_TTL,
        }
    }

    fn srv(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: Some(port),
            priority: Some(10),
            weight: Some(100),
            ttl: RECORD_TTL,
        }
    }
}

/// `persys.local` becomes `local/persys`.
pub fn reverse_domain(domain: &str) -> String {
    domain
        .trim_matches('.')
        .split('.')
        .filter(|label| !label.is_empty())
        .rev()
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Clone)]
pub struct DiscoveryPublisher {
    store: StateStore,
    base: String,
    instance_id: String,
    advertise_addr: String,
    grpc_port: u16,
}

impl DiscoveryPublisher {
    pub fn new(store: StateStore, config: &DiscoveryConfig, grpc_port: u16) -> Self {
        Self {
            store,
            base: format!("{}{}", keys::SKYDNS_PREFIX, reverse_domain(&config.domain)),
            instance_id: config.instance_id.clone(),
            advertise_addr: config.advertise_addr.clone(),
            grpc_port,
        }
    }

    pub fn node_key(&self, node_id: &str) -> String {
        format!("{}/{AGENTS_SHARD}/{node_id}", self.base)
    }

    pub fn srv_key(&self) -> String {
        format!("{}/_tcp/{SCHEDULER_SERVICE}/{}", self.base, self.instance_id)
    }

    pub fn a_key(&self) -> String {
        format!("{}/scheduler/{}", self.base, self.instance_id)
    }

    pub async fn publish_node(&self, node: &Node) -> Result<(), StoreError> {
        let key = self.node_key(&node.node_id);
        self.store.put_json(&key, &DnsRecord::a(node.host())).await?;
        debug!(node_id = %node.node_id, key = %key, "Published node record");
        Ok(())
    }

    pub async fn withdraw_node(&self, node_id: &str) -> Result<(), StoreError> {
        self.store.delete_raw(&self.node_key(node_id)).await?;
        Ok(())
    }

    /// SRV and A records for this scheduler instance.
    pub async fn publish_self(&self) -> Result<(), StoreError> {
        self.store
            .put_json(&self.srv_key(), &DnsRecord::srv(self.advertise_addr.clone(), self.grpc_port))
            .await?;
        self.store
            .put_json(&self.a_key(), &DnsRecord::a(self.advertise_addr.clone()))
            .await?;
        info!(
            instance_id = %self.instance_id,
            addr = %self.advertise_addr,
            port = self.grpc_port,
            "Published scheduler discovery records"
        );
        Ok(())
    }

    pub async fn withdraw_self(&self) -> Result<(), StoreError> {
        self.store.delete_raw(&self.srv_key()).await?;
        self.store.delete_raw(&self.a_key()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::mode::ModeController;
    use crate::store::{ClusterCache, MemoryBackend, RetryPolicy};

    fn publisher() -> DiscoveryPublisher {
        let mode = Arc::new(ModeController::new(Arc::new(ClusterCache::new())));
        let store = StateStore::new(Arc::new(MemoryBackend::new()), mode, RetryPolicy::default());
        let config = DiscoveryConfig {
            domain: "persys.local".to_string(),
            advertise_addr: "10.1.0.5".to_string(),
            instance_id: "scheduler-0".to_string(),
        };
        DiscoveryPublisher::new(store, &config, 8085)
    }

    #[test]
    fn test_reverse_domain() {
        assert_eq!(reverse_domain("persys.local"), "local/persys");
        assert_eq!(reverse_domain("a.b.example.com."), "com/example/b/a");
    }

    #[tokio::test]
    async fn test_node_record_lifecycle() {
        let discovery = publisher();
        let node = Node::register("n1", "10.0.0.7:7000", 1000, 1024, Utc::now());
        discovery.publish_node(&node).await.unwrap();

        let key = "/skydns/local/persys/agents/n1";
        let record: DnsRecord = discovery.store.get_json(key).await.unwrap().unwrap();
        assert_eq!(record, DnsRecord::a("10.0.0.7"));

        discovery.withdraw_node("n1").await.unwrap();
        assert!(discovery.store.get_raw(key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_self_records() {
        let discovery = publisher();
        discovery.publish_self().await.unwrap();

        let srv: DnsRecord = discovery
            .store
            .get_json("/skydns/local/persys/_tcp/_persys-scheduler/scheduler-0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(srv.port, Some(8085));
        assert_eq!(srv.ttl, RECORD_TTL);

        discovery.withdraw_self().await.unwrap();
        assert!(discovery.store.list_raw("/skydns/").await.unwrap().is_empty());
    }
}
