//! Raw key-value backends behind the state store adapter.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::BackendError;

/// A strongly-consistent key-value store.
///
/// Prefix listings return keys in lexicographic order.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), BackendError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, BackendError>;

    /// Returns the number of keys removed.
    async fn delete(&self, key: &str) -> Result<u64, BackendError>;

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, BackendError>;

    async fn count(&self, prefix: &str) -> Result<u64, BackendError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

/// In-memory backend with an outage switch.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    offline: AtomicBool,
    writes: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// While unavailable every operation fails with `Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    /// Number of successful mutating operations so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Drop every key, as after a disaster.
    pub async fn wipe(&self) {
        self.data.write().await.clear();
    }

    pub async fn keys(&self) -> Vec<String> {
        self.data.read().await.keys().cloned().collect()
    }

    fn check(&self) -> Result<(), BackendError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), BackendError> {
        self.check()?;
        self.data.write().await.insert(key.to_string(), value);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        self.check()?;
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, BackendError> {
        self.check()?;
        let data = self.data.read().await;
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<u64, BackendError> {
        self.check()?;
        let removed = self.data.write().await.remove(key).is_some();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(u64::from(removed))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, BackendError> {
        self.check()?;
        let mut data = self.data.write().await;
        let before = data.len();
        data.retain(|k, _| !k.starts_with(prefix));
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok((before - data.len()) as u64)
    }

    async fn count(&self, prefix: &str) -> Result<u64, BackendError> {
        self.check()?;
        let data = self.data.read().await;
        Ok(data.keys().filter(|k| k.starts_with(prefix)).count() as u64)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prefix_listing_is_ordered() {
        let backend = MemoryBackend::new();
        backend.put("/a/2", b"2".to_vec()).await.unwrap();
        backend.put("/a/1", b"1".to_vec()).await.unwrap();
        backend.put("/b/1", b"x".to_vec()).await.unwrap();

        let keys: Vec<_> = backend
            .list("/a/")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["/a/1", "/a/2"]);
        assert_eq!(backend.count("/").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_outage_switch() {
        let backend = MemoryBackend::new();
        backend.set_available(false);
        assert!(matches!(
            backend.put("/k", vec![]).await,
            Err(BackendError::Unavailable(_))
        ));
        backend.set_available(true);
        backend.put("/k", vec![]).await.unwrap();
        assert_eq!(backend.write_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let backend = MemoryBackend::new();
        backend.put("/x/1", vec![]).await.unwrap();
        backend.put("/x/2", vec![]).await.unwrap();
        assert_eq!(backend.delete_prefix("/x/").await.unwrap(), 2);
        assert_eq!(backend.delete("/x/1").await.unwrap(), 0);
    }
}
