//! 执行器：工作者池、控制循环接口与取消

pub mod cancel;
pub mod control_loop;
pub mod rule_loop;
pub mod worker;

pub use cancel::CancelRegistry;
pub use control_loop::{ControlLoop, LoopState, LoopStep, Observation, ToolCall};
pub use rule_loop::KeywordLoop;
pub use worker::WorkerPool;
