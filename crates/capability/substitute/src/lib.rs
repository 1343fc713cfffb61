//! 值提取与替换/修复引擎。

pub mod engine;
pub mod error;
pub mod extract;

pub use engine::{InstanceOutcome, ReconciledInstance, SubstitutionEngine, reconcile_cardinality};
pub use error::SubstituteError;
pub use extract::{ExtractionStrategy, Extractor, JsonFieldExtractor, payload_document};
