//! etcd-backed key-value store.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, DeleteOptions, GetOptions};
use tracing::info;

use super::{BackendError, KvBackend};
use crate::config::StoreConfig;

pub struct EtcdBackend {
    client: Client,
    request_timeout: Duration,
}

impl EtcdBackend {
    pub async fn connect(config: &StoreConfig) -> Result<Self, BackendError> {
        let options = ConnectOptions::new()
            .with_connect_timeout(config.dial_timeout)
            .with_timeout(config.request_timeout);

        let connect = Client::connect(&config.endpoints, Some(options));
        let client = tokio::time::timeout(config.dial_timeout, connect)
            .await
            .map_err(|_| BackendError::Timeout(config.dial_timeout))?
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        info!(endpoints = ?config.endpoints, "Connected to etcd");

        Ok(Self {
            client,
            request_timeout: config.request_timeout,
        })
    }

    async fn timed<T, F>(&self, fut: F) -> Result<T, BackendError>
    where
        F: Future<Output = Result<T, etcd_client::Error>>,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify(e)),
            Err(_) => Err(BackendError::Timeout(self.request_timeout)),
        }
    }
}

fn classify(err: etcd_client::Error) -> BackendError {
    match err {
        etcd_client::Error::InvalidArgs(msg) => BackendError::Rejected(msg),
        etcd_client::Error::Utf8Error(e) => BackendError::Rejected(e.to_string()),
        other => BackendError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl KvBackend for EtcdBackend {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), BackendError> {
        let mut kv = self.client.kv_client();
        self.timed(kv.put(key, value, None)).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let mut kv = self.client.kv_client();
        let resp = self.timed(kv.get(key, None)).await?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, BackendError> {
        let mut kv = self.client.kv_client();
        let resp = self
            .timed(kv.get(prefix, Some(GetOptions::new().with_prefix())))
            .await?;
        resp.kvs()
            .iter()
            .map(|kv| {
                let key = kv
                    .key_str()
                    .map_err(|e| BackendError::Rejected(e.to_string()))?;
                Ok((key.to_string(), kv.value().to_vec()))
            })
            .collect()
    }

    async fn delete(&self, key: &str) -> Result<u64, BackendError> {
        let mut kv = self.client.kv_client();
        let resp = self.timed(kv.delete(key, None)).await?;
        Ok(resp.deleted().max(0) as u64)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, BackendError> {
        let mut kv = self.client.kv_client();
        let resp = self
            .timed(kv.delete(prefix, Some(DeleteOptions::new().with_prefix())))
            .await?;
        Ok(resp.deleted().max(0) as u64)
    }

    async fn count(&self, prefix: &str) -> Result<u64, BackendError> {
        let mut kv = self.client.kv_client();
        let resp = self
            .timed(kv.get(
                prefix,
                Some(GetOptions::new().with_prefix().with_count_only()),
            ))
            .await?;
        Ok(resp.count().max(0) as u64)
    }

    fn name(&self) -> &str {
        "etcd"
    }
}
