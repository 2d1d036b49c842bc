//! 图形设备模块
//!
//! 本模块封装了调度器所依赖的设备实现：
//! - Vulkan：基于 `ash` 的真实设备
//! - Software：进程内模拟的 GPU 队列，用于测试和压力测试
//!
//! 所有设备都实现了统一的 `GpuDevice` trait。

pub mod backend;
pub mod vulkan;
pub mod software;

pub use backend::GpuDevice;
pub use vulkan::VulkanDevice;
pub use software::SoftwareDevice;
