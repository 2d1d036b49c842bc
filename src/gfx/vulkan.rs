//! Vulkan 设备实现
//!
//! 基于 `ash` 将一个已经创建好的逻辑设备和队列适配为 [`GpuDevice`]。
//! 实例、物理设备、逻辑设备的创建由上层负责，这里只创建并持有一个命令池。
//!
//! 命令池要求外部同步：分配、释放、重置命令缓冲区都在 `command_pool` 锁内完成。
//! 向命令缓冲区录制命令同样访问命令池，录制方需要自行保证这一点。

use std::time::Duration;

use ash::vk;
use parking_lot::Mutex;
use tracing::debug;

use crate::core::error::{GraphicsError, Result};
use crate::gfx::backend::GpuDevice;

/// 基于 ash 的 Vulkan 设备
pub struct VulkanDevice {
    device: ash::Device,
    queue: vk::Queue,
    command_pool: Mutex<vk::CommandPool>,
}

impl VulkanDevice {
    /// 创建 Vulkan 设备适配器
    ///
    /// 命令池使用 `TRANSIENT | RESET_COMMAND_BUFFER`，以便单独重置每个命令缓冲区。
    ///
    /// # 参数
    ///
    /// * `device` - 逻辑设备
    /// * `queue` - 用于提交的队列
    /// * `queue_family_index` - `queue` 所属的队列族
    ///
    /// # Safety
    ///
    /// `device` 和 `queue` 必须有效，`queue` 必须属于 `queue_family_index`，
    /// 并且逻辑设备必须比返回的 `VulkanDevice` 活得更久。
    pub unsafe fn new(device: ash::Device, queue: vk::Queue, queue_family_index: u32) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )
            .queue_family_index(queue_family_index);

        let command_pool = device
            .create_command_pool(&pool_info, None)
            .map_err(|e| vk_error("vkCreateCommandPool", e))?;

        debug!(queue_family_index, "Vulkan command pool created");

        Ok(Self {
            device,
            queue,
            command_pool: Mutex::new(command_pool),
        })
    }

    /// 获取逻辑设备
    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    /// 获取提交队列
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        // 销毁命令池会一并释放其中剩余的命令缓冲区
        unsafe {
            self.device.destroy_command_pool(*self.command_pool.get_mut(), None);
        }
    }
}

impl GpuDevice for VulkanDevice {
    type CommandBuffer = vk::CommandBuffer;
    type Fence = vk::Fence;

    fn allocate_command_buffer(&self) -> Result<vk::CommandBuffer> {
        let pool = self.command_pool.lock();
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| vk_error("vkAllocateCommandBuffers", e))?;

        buffers.into_iter().next().ok_or_else(|| {
            GraphicsError::ResourceCreation("vkAllocateCommandBuffers returned no buffer".to_string()).into()
        })
    }

    fn free_command_buffer(&self, command_buffer: &vk::CommandBuffer) {
        let pool = self.command_pool.lock();
        unsafe {
            self.device.free_command_buffers(*pool, std::slice::from_ref(command_buffer));
        }
    }

    fn reset_command_buffer(&self, command_buffer: &vk::CommandBuffer) -> Result<()> {
        let _pool = self.command_pool.lock();
        unsafe {
            self.device
                .reset_command_buffer(*command_buffer, vk::CommandBufferResetFlags::empty())
        }
        .map_err(|e| vk_error("vkResetCommandBuffer", e))
    }

    fn create_fence(&self) -> Result<vk::Fence> {
        unsafe { self.device.create_fence(&vk::FenceCreateInfo::default(), None) }
            .map_err(|e| vk_error("vkCreateFence", e))
    }

    fn destroy_fence(&self, fence: &vk::Fence) {
        unsafe { self.device.destroy_fence(*fence, None) }
    }

    fn reset_fence(&self, fence: &vk::Fence) -> Result<()> {
        unsafe { self.device.reset_fences(std::slice::from_ref(fence)) }
            .map_err(|e| vk_error("vkResetFences", e))
    }

    fn fence_status(&self, fence: &vk::Fence) -> Result<bool> {
        unsafe { self.device.get_fence_status(*fence) }
            .map_err(|e| vk_error("vkGetFenceStatus", e))
    }

    fn wait_for_fence(&self, fence: &vk::Fence, timeout: Option<Duration>) -> Result<bool> {
        let timeout_ns = timeout
            .map(|t| u64::try_from(t.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(u64::MAX);

        match unsafe { self.device.wait_for_fences(std::slice::from_ref(fence), true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(vk_error("vkWaitForFences", e)),
        }
    }

    fn submit(&self, command_buffer: &vk::CommandBuffer, fence: &vk::Fence) -> Result<()> {
        let submit_info = vk::SubmitInfo::builder()
            .command_buffers(std::slice::from_ref(command_buffer))
            .build();

        unsafe { self.device.queue_submit(self.queue, &[submit_info], *fence) }
            .map_err(|e| vk_error("vkQueueSubmit", e))
    }

    fn name(&self) -> &str {
        "Vulkan"
    }
}

/// 将 Vulkan 返回码映射为调度器错误
fn vk_error(call: &str, result: vk::Result) -> crate::core::error::SchedulerError {
    let message = format!("{call}: {result}");
    let error = match (call, result) {
        (_, vk::Result::ERROR_DEVICE_LOST) => GraphicsError::DeviceLost(message),
        ("vkQueueSubmit", _) => GraphicsError::Submission(message),
        ("vkGetFenceStatus" | "vkWaitForFences", _) => GraphicsError::FenceWait(message),
        ("vkResetCommandBuffer" | "vkResetFences", _) => GraphicsError::Reset(message),
        _ => GraphicsError::ResourceCreation(message),
    };
    error.into()
}
