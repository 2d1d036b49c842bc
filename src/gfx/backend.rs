//! 图形设备的统一抽象接口
//!
//! 调度器只依赖"可重置、可录制、可提交的命令缓冲区"和"可轮询的 Fence"，
//! 本模块把这两类对象以及唯一的执行队列抽象为 [`GpuDevice`] trait。
//! 设备和队列的初始化不在调度器的职责范围内，由具体后端的构造函数完成。

use std::time::Duration;

use crate::core::error::Result;

/// 调度器所需的设备能力
///
/// 所有方法都可能被多个线程同时调用，唯一的例外是 [`GpuDevice::submit`]：
/// 调度器保证同一时刻只有一个线程在向队列提交。
pub trait GpuDevice: Send + Sync + 'static {
    /// 命令缓冲区句柄
    type CommandBuffer: Send + Sync + 'static;

    /// Fence 句柄
    type Fence: Send + Sync + 'static;

    /// 分配一个新的主命令缓冲区
    ///
    /// 失败时返回 `GraphicsError::ResourceCreation`，调度器不会重试。
    fn allocate_command_buffer(&self) -> Result<Self::CommandBuffer>;

    /// 释放命令缓冲区，调用方保证硬件不再引用它
    fn free_command_buffer(&self, command_buffer: &Self::CommandBuffer);

    /// 将命令缓冲区重置为初始状态
    fn reset_command_buffer(&self, command_buffer: &Self::CommandBuffer) -> Result<()>;

    /// 创建一个未 signal 的 Fence
    fn create_fence(&self) -> Result<Self::Fence>;

    /// 销毁 Fence，调用方保证硬件不再引用它
    fn destroy_fence(&self, fence: &Self::Fence);

    /// 将 Fence 重置为未 signal 状态
    fn reset_fence(&self, fence: &Self::Fence) -> Result<()>;

    /// 非阻塞地查询 Fence 是否已 signal
    fn fence_status(&self, fence: &Self::Fence) -> Result<bool>;

    /// 阻塞等待 Fence
    ///
    /// `timeout` 为 `None` 时无限等待。超时返回 `Ok(false)`。
    fn wait_for_fence(&self, fence: &Self::Fence, timeout: Option<Duration>) -> Result<bool>;

    /// 将命令缓冲区提交到队列，执行完成后 signal `fence`
    fn submit(&self, command_buffer: &Self::CommandBuffer, fence: &Self::Fence) -> Result<()>;

    /// 获取设备的名称，用于日志输出
    fn name(&self) -> &str;
}
