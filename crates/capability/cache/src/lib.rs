//! 外部 ID 缓存与设备属性缓存。

pub mod error;
pub mod external_id;
pub mod in_memory;
pub mod inventory;
pub mod service;
mod store;

pub use error::CacheError;
pub use external_id::{ExternalIdCache, ExternalIdKey, ResolvedIdentity};
pub use in_memory::{InMemoryIdentityResolver, InMemoryInventoryProvider};
pub use inventory::{EvictionListener, InventoryAttributes, InventoryCache};
pub use service::{
    CacheSettings, IdentityResolver, IdentityService, InventoryProvider, InventoryService,
    NoopIdentityResolver, NoopInventoryProvider,
};
