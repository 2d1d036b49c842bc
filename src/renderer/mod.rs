//! 命令缓冲区调度模块
//!
//! - `sync`：Fence 包装与 FenceCycle 完成令牌
//! - `command`：命令缓冲区槽位与独占句柄
//! - `scheduler`：槽位池与队列提交

pub mod sync;
pub mod command;
pub mod scheduler;

pub use sync::{Fence, FenceCycle};
pub use command::{ActiveCommandBuffer, CommandBufferSlot, SlotState};
pub use scheduler::{CommandScheduler, SchedulerStats};
