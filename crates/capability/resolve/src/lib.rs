//! topic 前缀树与租户映射注册表。

pub mod error;
pub mod manager;
pub mod tree;

pub use error::ResolveError;
pub use manager::{MappingCacheManager, OutboundMappings, RejectedMapping, TenantMappings};
pub use tree::{MappingTree, MappingTreeNode};
