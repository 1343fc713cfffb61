//! 载荷组装与消息处理流程（入站/出站）。

pub mod assemble;
pub mod processor;

pub use assemble::{AssemblyError, assemble};
pub use processor::{
    MappingFailure, MappingProcessor, ProcessingError, ProcessingReport, ProcessorConfig,
};
