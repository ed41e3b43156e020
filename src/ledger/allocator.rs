use std::sync::Arc;
use tracing::{info, instrument};

use crate::error::{CustodyError, Result};
use crate::persistence::IndexStore;

/// Assigns each trader a permanent, unique HD derivation index
#[derive(Clone)]
pub struct IndexAllocator {
    store: Arc<dyn IndexStore>,
}

impl IndexAllocator {
    pub fn new(store: Arc<dyn IndexStore>) -> Self {
        Self { store }
    }

    /// Return the trader's index, assigning one on first use
    #[instrument(skip(self))]
    pub async fn allocate(&self, trader_id: &str) -> Result<u32> {
        if trader_id.trim().is_empty() {
            return Err(CustodyError::InvalidInput("trader_id is required".to_string()));
        }

        if let Some(existing) = self.store.get_index(trader_id).await? {
            return Ok(existing.hd_index);
        }

        let assigned = self.store.allocate_index(trader_id).await?;
        info!("Trader {} bound to HD index {}", trader_id, assigned.hd_index);
        Ok(assigned.hd_index)
    }

    /// Existing index without allocating
    pub async fn lookup(&self, trader_id: &str) -> Result<Option<u32>> {
        Ok(self.store.get_index(trader_id).await?.map(|i| i.hd_index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use std::collections::HashSet;

    fn allocator() -> IndexAllocator {
        IndexAllocator::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_allocate_is_stable_per_trader() {
        let allocator = allocator();
        let first = allocator.allocate("trader1").await.unwrap();
        assert_eq!(allocator.allocate("trader1").await.unwrap(), first);
        assert_eq!(allocator.lookup("trader1").await.unwrap(), Some(first));
        assert_eq!(allocator.lookup("trader2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_indices_unique_across_traders() {
        let allocator = allocator();
        let mut seen = HashSet::new();
        for n in 0..50 {
            let index = allocator.allocate(&format!("trader{n}")).await.unwrap();
            assert!(seen.insert(index), "index {index} handed out twice");
        }
    }

    #[tokio::test]
    async fn test_blank_trader_rejected() {
        let err = allocator().allocate("  ").await.unwrap_err();
        assert!(matches!(err, CustodyError::InvalidInput(_)));
    }
}
