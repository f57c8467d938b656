// Chunk-placement cache.
//
// The registry service publishes `chunk -> worker` placement into the
// metadata store along with an update stamp. Readers cache the map and
// reread only when the published stamp advances, so the per-bundle lookup
// path never touches the store.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::common::{ChunkId, WorkerId};
use crate::error::Result;
use crate::metadata::QueryMetadata;

pub struct ChunkPlacement {
    metadata: Arc<dyn QueryMetadata>,
    cache: RwLock<PlacementCache>,
}

#[derive(Default)]
struct PlacementCache {
    stamp: Option<u64>,
    map: HashMap<ChunkId, WorkerId>,
}

impl ChunkPlacement {
    pub fn new(metadata: Arc<dyn QueryMetadata>) -> Self {
        Self {
            metadata,
            cache: RwLock::new(PlacementCache::default()),
        }
    }

    /// Current owner of `chunk`, rereading the placement table only when
    /// the published stamp has advanced.
    pub async fn worker_for(&self, chunk: ChunkId) -> Result<Option<WorkerId>> {
        self.refresh_if_stale().await?;
        Ok(self.cache.read().await.map.get(&chunk).cloned())
    }

    pub async fn refresh_if_stale(&self) -> Result<()> {
        let published = self.metadata.placement_update_time().await?;
        {
            let cache = self.cache.read().await;
            if cache.stamp == Some(published) {
                return Ok(());
            }
        }
        let map = self.metadata.chunk_placement().await?;
        let mut cache = self.cache.write().await;
        debug!(stamp = published, chunks = map.len(), "chunk placement refreshed");
        cache.stamp = Some(published);
        cache.map = map;
        Ok(())
    }

    /// Number of chunks in the cached placement.
    pub async fn len(&self) -> usize {
        self.cache.read().await.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MemMetadataStore;

    #[tokio::test]
    async fn rereads_only_when_stamp_advances() {
        let store = Arc::new(MemMetadataStore::new());
        store.set_placement(HashMap::from([(1, "wA".to_string())]));
        let placement = ChunkPlacement::new(store.clone());

        assert_eq!(placement.worker_for(1).await.unwrap(), Some("wA".into()));
        assert_eq!(placement.worker_for(2).await.unwrap(), None);

        // A republished placement advances the stamp and invalidates the cache.
        store.set_placement(HashMap::from([(1, "wB".to_string())]));
        assert_eq!(placement.worker_for(1).await.unwrap(), Some("wB".into()));
        assert_eq!(placement.len().await, 1);
    }
}
