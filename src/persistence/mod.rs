pub mod memory;
pub mod traits;

pub use memory::MemoryStore;
pub use traits::{
    dedup_conflict, IndexStore, LedgerStore, Storage, WalletMutation, WalletStore,
};
