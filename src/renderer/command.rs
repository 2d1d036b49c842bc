//! 命令缓冲区槽位
//!
//! 一个槽位 = {命令缓冲区, Fence, 当前 FenceCycle, 独占状态}。
//! 槽位只通过 [`CommandScheduler`](super::scheduler::CommandScheduler) 使用，
//! 生产者拿到的是 [`ActiveCommandBuffer`] 句柄，从不直接接触槽位内部。
//!
//! # 状态机
//!
//! ```text
//! 空闲+未完成 ──(Fence signal)──► 空闲+已完成 ──(认领)──► 独占
//!      ▲                                                  │
//!      └───────────────(提交后句柄被丢弃)─────────────────┘
//! ```
//!
//! 新建的槽位直接处于独占状态，交给创建它的调用者。

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, trace};

use super::sync::{Fence, FenceCycle};
use crate::core::error::Result;
use crate::gfx::backend::GpuDevice;

/// 槽位的独占状态
///
/// 与 Fence 是否完成组合成槽位对外可见的三种状态：
/// 空闲且已完成、空闲但硬件未完成、被某个生产者独占。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    /// 未被任何生产者持有
    Free = 0,
    /// 某个扫描者刚赢得 CAS，正在检查 Fence
    Claiming = 1,
    /// 被一个 `ActiveCommandBuffer` 持有
    Exclusive = 2,
}

impl SlotState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => SlotState::Free,
            1 => SlotState::Claiming,
            _ => SlotState::Exclusive,
        }
    }
}

/// 可复用的命令缓冲区槽位
pub struct CommandBufferSlot<D: GpuDevice> {
    device: Arc<D>,
    command_buffer: D::CommandBuffer,
    fence: Arc<Fence<D>>,
    cycle: Mutex<Arc<FenceCycle<D>>>,
    state: AtomicU8,
    reuse_count: AtomicU64,
}

impl<D: GpuDevice> CommandBufferSlot<D> {
    /// 创建新的槽位，初始状态为独占
    ///
    /// 设备无法分配命令缓冲区或 Fence 时返回错误，不会留下半初始化的槽位。
    pub fn new(device: Arc<D>) -> Result<Self> {
        let fence = Arc::new(Fence::new(device.clone())?);
        let command_buffer = device.allocate_command_buffer()?;
        let cycle = Arc::new(FenceCycle::new(fence.clone()));

        Ok(Self {
            device,
            command_buffer,
            fence,
            cycle: Mutex::new(cycle),
            state: AtomicU8::new(SlotState::Exclusive as u8),
            reuse_count: AtomicU64::new(0),
        })
    }

    /// 如果槽位空闲且硬件已完成，则认领它
    ///
    /// 先用一次 CAS 认领（`Free → Claiming`），输掉 CAS 的扫描者直接返回 `false`，不会阻塞。
    /// 认领成功后检查当前 FenceCycle：
    ///
    /// - 已完成（或本周期从未提交）：退役旧周期并释放其附加资源，重置命令缓冲区和 Fence，
    ///   安装新的 FenceCycle，槽位进入独占状态，返回 `true`
    /// - 未完成：撤销认领，槽位保持空闲，返回 `false`
    ///
    /// 检查过程中出现设备错误时同样撤销认领，并把错误返回给调用者。
    pub fn allocate_if_free(&self) -> Result<bool> {
        if self
            .state
            .compare_exchange(
                SlotState::Free as u8,
                SlotState::Claiming as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(false);
        }

        match self.try_recycle() {
            Ok(true) => {
                self.state.store(SlotState::Exclusive as u8, Ordering::Release);
                self.reuse_count.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            Ok(false) => {
                self.state.store(SlotState::Free as u8, Ordering::Release);
                Ok(false)
            }
            Err(e) => {
                self.state.store(SlotState::Free as u8, Ordering::Release);
                Err(e)
            }
        }
    }

    /// 在持有认领的前提下尝试开始新的周期
    ///
    /// 只在取出旧周期时短暂持有 `cycle` 锁，附加资源的释放回调可以自由访问调度器。
    /// 重置失败时旧周期已经退役，下一次认领会直接重试重置。
    fn try_recycle(&self) -> Result<bool> {
        let previous = {
            let cycle = self.cycle.lock();
            // 从未提交过的周期不会被硬件 signal，硬件也从未见过这次录制
            let complete = !cycle.is_submitted() || cycle.poll()?;
            if !complete {
                return Ok(false);
            }
            Arc::clone(&*cycle)
        };

        // 退役会锁定旧周期的完成标志，必须先于 Fence 重置
        previous.retire();
        self.device.reset_command_buffer(&self.command_buffer)?;
        self.fence.reset()?;
        *self.cycle.lock() = Arc::new(FenceCycle::new(self.fence.clone()));
        Ok(true)
    }

    /// 独占句柄被丢弃时归还槽位
    fn release(&self) {
        let previous = self.state.swap(SlotState::Free as u8, Ordering::AcqRel);
        debug_assert_eq!(previous, SlotState::Exclusive as u8);
    }

    /// 当前独占状态
    pub fn state(&self) -> SlotState {
        SlotState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// 当前的 FenceCycle
    pub fn current_cycle(&self) -> Arc<FenceCycle<D>> {
        self.cycle.lock().clone()
    }

    /// 槽位被复用的次数
    pub fn reuse_count(&self) -> u64 {
        self.reuse_count.load(Ordering::Relaxed)
    }
}

impl<D: GpuDevice> Drop for CommandBufferSlot<D> {
    fn drop(&mut self) {
        // 命令缓冲区在硬件执行完之前不能释放
        let cycle = self.cycle.get_mut();
        if cycle.is_submitted() && !matches!(cycle.poll(), Ok(true)) {
            trace!("Waiting for in-flight command buffer before freeing it");
            if let Err(e) = cycle.wait(None) {
                error!(error = %e, "Failed to wait for command buffer before freeing it");
            }
        }
        self.device.free_command_buffer(&self.command_buffer);
    }
}

impl<D: GpuDevice> fmt::Debug for CommandBufferSlot<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBufferSlot")
            .field("state", &self.state())
            .field("reuse_count", &self.reuse_count())
            .finish()
    }
}

/// 独占的命令缓冲区句柄
///
/// 由 `CommandScheduler::allocate_command_buffer` 返回，是获得槽位命令缓冲区写权限的唯一途径。
/// 丢弃句柄即归还独占权；槽位能否被再次分配取决于 Fence 是否完成，而不是显式的释放调用。
pub struct ActiveCommandBuffer<D: GpuDevice> {
    index: usize,
    slot: Arc<CommandBufferSlot<D>>,
    cycle: Arc<FenceCycle<D>>,
}

impl<D: GpuDevice> ActiveCommandBuffer<D> {
    /// 包装一个已处于独占状态的槽位
    pub(crate) fn new(index: usize, slot: Arc<CommandBufferSlot<D>>) -> Self {
        let cycle = slot.current_cycle();
        Self { index, slot, cycle }
    }

    /// 槽位在池中的索引
    pub fn index(&self) -> usize {
        self.index
    }

    /// 用于录制的命令缓冲区
    pub fn command_buffer(&self) -> &D::CommandBuffer {
        &self.slot.command_buffer
    }

    /// 本周期使用的 Fence
    pub fn fence(&self) -> &D::Fence {
        self.slot.fence.raw()
    }

    /// 本周期的完成令牌
    pub fn cycle(&self) -> &Arc<FenceCycle<D>> {
        &self.cycle
    }

    /// 把资源附加到本周期，参见 [`FenceCycle::attach`]
    pub fn attach<T: Send + Sync + 'static>(&self, object: T) {
        self.cycle.attach(object);
    }

    /// 本周期是否已提交
    pub fn is_submitted(&self) -> bool {
        self.cycle.is_submitted()
    }
}

impl<D: GpuDevice> Drop for ActiveCommandBuffer<D> {
    fn drop(&mut self) {
        self.slot.release();
    }
}

impl<D: GpuDevice> fmt::Debug for ActiveCommandBuffer<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveCommandBuffer")
            .field("index", &self.index)
            .field("cycle", &self.cycle)
            .finish()
    }
}
