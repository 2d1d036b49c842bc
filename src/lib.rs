//! cmd_sched - 命令缓冲区生命周期调度器
//!
//! 为模拟器的图形后端管理一个可复用的命令缓冲区池：
//! 多个生产者可以并发地分配和录制命令缓冲区，提交被串行化到唯一的执行队列，
//! 命令缓冲区只有在硬件通过 Fence 确认执行完成后才会被重置和复用。
//!
//! # 模块结构
//!
//! - `core`: 日志、配置、错误处理
//! - `gfx`: 设备抽象（Vulkan 与软件模拟实现）
//! - `renderer`: FenceCycle、命令缓冲区槽位和调度器
//!
//! # 使用示例
//!
//! ```no_run
//! use std::sync::Arc;
//! use cmd_sched::gfx::SoftwareDevice;
//! use cmd_sched::renderer::CommandScheduler;
//!
//! let device = Arc::new(SoftwareDevice::new());
//! let scheduler = CommandScheduler::new(device.clone());
//!
//! let buffer = scheduler.allocate_command_buffer()?;
//! buffer.command_buffer().record(1);
//! buffer.attach(Arc::new("staging buffer"));
//! scheduler.submit_command_buffer(&buffer)?;
//! drop(buffer);
//!
//! device.complete_all();
//! scheduler.wait_idle(None)?;
//! # Ok::<(), cmd_sched::core::SchedulerError>(())
//! ```

pub mod core;
pub mod gfx;
pub mod renderer;
