//! 核心：错误类型与优雅关闭

pub mod error;
pub mod shutdown;

pub use error::{LoopError, ServiceError, StoreError, ToolError};
pub use shutdown::{ShutdownManager, ShutdownReason};
