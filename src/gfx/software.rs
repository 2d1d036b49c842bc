//! 软件模拟设备
//!
//! 在进程内模拟一个按提交顺序执行的 GPU 队列，用于测试和压力测试：
//!
//! - 提交只是把命令缓冲区的内容和 Fence 放进执行队列
//! - "硬件"按顺序执行队列中的工作并 signal 对应的 Fence，
//!   可以手动驱动（[`SoftwareDevice::complete_next`]），也可以启动后台执行线程
//! - 支持注入分配、提交、Fence 查询和重置失败
//! - 检测重叠的队列提交（真实队列不允许并发提交）

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::core::error::{GraphicsError, Result};
use crate::gfx::backend::GpuDevice;

/// 软件命令缓冲区
///
/// 录制的"命令"只是一串 `u32`，足以验证执行顺序和重置行为。
#[derive(Debug)]
pub struct SoftwareCommandBuffer {
    id: u64,
    commands: Mutex<Vec<u32>>,
    resets: AtomicUsize,
}

impl SoftwareCommandBuffer {
    /// 命令缓冲区 ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 录制一条命令
    pub fn record(&self, command: u32) {
        self.commands.lock().push(command);
    }

    /// 当前已录制的命令
    pub fn commands(&self) -> Vec<u32> {
        self.commands.lock().clone()
    }

    /// 被重置的次数
    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct FenceState {
    id: u64,
    signaled: Mutex<bool>,
    cond: Condvar,
}

/// 软件 Fence
#[derive(Debug, Clone)]
pub struct SoftwareFence(Arc<FenceState>);

impl SoftwareFence {
    /// Fence ID
    pub fn id(&self) -> u64 {
        self.0.id
    }

    fn signal(&self) {
        let mut signaled = self.0.signaled.lock();
        *signaled = true;
        self.0.cond.notify_all();
    }

    fn is_signaled(&self) -> bool {
        *self.0.signaled.lock()
    }
}

/// 一次已执行的提交
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedSubmission {
    /// 命令缓冲区 ID
    pub command_buffer: u64,
    /// 提交时录制的命令
    pub commands: Vec<u32>,
}

struct PendingSubmission {
    command_buffer: u64,
    commands: Vec<u32>,
    fence: SoftwareFence,
}

/// 软件模拟设备
pub struct SoftwareDevice {
    next_id: AtomicU64,
    pending: Mutex<VecDeque<PendingSubmission>>,
    pending_cond: Condvar,
    executed: Mutex<Vec<ExecutedSubmission>>,
    in_submit: AtomicBool,
    overlapping_submits: AtomicUsize,
    fail_allocations: AtomicUsize,
    fail_submits: AtomicUsize,
    fail_polls: AtomicUsize,
    fail_resets: AtomicUsize,
    live_command_buffers: AtomicUsize,
    live_fences: AtomicUsize,
    shutdown: AtomicBool,
}

impl SoftwareDevice {
    /// 创建新的软件设备
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(VecDeque::new()),
            pending_cond: Condvar::new(),
            executed: Mutex::new(Vec::new()),
            in_submit: AtomicBool::new(false),
            overlapping_submits: AtomicUsize::new(0),
            fail_allocations: AtomicUsize::new(0),
            fail_submits: AtomicUsize::new(0),
            fail_polls: AtomicUsize::new(0),
            fail_resets: AtomicUsize::new(0),
            live_command_buffers: AtomicUsize::new(0),
            live_fences: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    /// 执行队列中最早的一次提交并 signal 它的 Fence
    ///
    /// 队列为空时返回 `false`。
    pub fn complete_next(&self) -> bool {
        let Some(submission) = self.pending.lock().pop_front() else {
            return false;
        };
        self.execute(submission);
        true
    }

    /// 执行队列中的全部提交，返回执行的数量
    pub fn complete_all(&self) -> usize {
        let mut count = 0;
        while self.complete_next() {
            count += 1;
        }
        count
    }

    /// 尚未执行的提交数量
    pub fn pending_submissions(&self) -> usize {
        self.pending.lock().len()
    }

    /// 按执行顺序返回已执行的提交
    pub fn executed(&self) -> Vec<ExecutedSubmission> {
        self.executed.lock().clone()
    }

    /// 让接下来的 `count` 次命令缓冲区或 Fence 分配失败
    pub fn fail_next_allocations(&self, count: usize) {
        self.fail_allocations.store(count, Ordering::Release);
    }

    /// 让接下来的 `count` 次提交失败
    pub fn fail_next_submits(&self, count: usize) {
        self.fail_submits.store(count, Ordering::Release);
    }

    /// 让接下来的 `count` 次 Fence 状态查询失败
    pub fn fail_next_polls(&self, count: usize) {
        self.fail_polls.store(count, Ordering::Release);
    }

    /// 让接下来的 `count` 次命令缓冲区或 Fence 重置失败
    pub fn fail_next_resets(&self, count: usize) {
        self.fail_resets.store(count, Ordering::Release);
    }

    /// 检测到的重叠提交次数，正确的调度器下应始终为 0
    pub fn overlapping_submits(&self) -> usize {
        self.overlapping_submits.load(Ordering::Acquire)
    }

    /// 仍然存活的命令缓冲区数量
    pub fn live_command_buffers(&self) -> usize {
        self.live_command_buffers.load(Ordering::Acquire)
    }

    /// 仍然存活的 Fence 数量
    pub fn live_fences(&self) -> usize {
        self.live_fences.load(Ordering::Acquire)
    }

    /// 启动后台执行线程
    ///
    /// 执行线程按提交顺序处理工作，每次提交耗时 `latency`。
    /// 返回的句柄被丢弃时线程会处理完剩余工作后退出。
    pub fn spawn_executor(self: &Arc<Self>, latency: Duration) -> Result<ExecutorHandle> {
        self.shutdown.store(false, Ordering::Release);
        let device = Arc::clone(self);
        let thread = thread::Builder::new()
            .name("software-gpu".to_string())
            .spawn(move || device.run_executor(latency))?;

        Ok(ExecutorHandle {
            device: Arc::clone(self),
            thread: Some(thread),
        })
    }

    fn run_executor(&self, latency: Duration) {
        debug!(?latency, "Software GPU executor started");
        loop {
            let submission = {
                let mut pending = self.pending.lock();
                loop {
                    if let Some(submission) = pending.pop_front() {
                        break Some(submission);
                    }
                    if self.shutdown.load(Ordering::Acquire) {
                        break None;
                    }
                    self.pending_cond.wait_for(&mut pending, Duration::from_millis(10));
                }
            };

            let Some(submission) = submission else { break };
            if !latency.is_zero() {
                thread::sleep(latency);
            }
            self.execute(submission);
        }
        debug!("Software GPU executor stopped");
    }

    fn execute(&self, submission: PendingSubmission) {
        trace!(
            command_buffer = submission.command_buffer,
            fence = submission.fence.id(),
            "Software GPU executing submission"
        );
        self.executed.lock().push(ExecutedSubmission {
            command_buffer: submission.command_buffer,
            commands: submission.commands,
        });
        submission.fence.signal();
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn take_injected_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for SoftwareDevice {
    type CommandBuffer = SoftwareCommandBuffer;
    type Fence = SoftwareFence;

    fn allocate_command_buffer(&self) -> Result<SoftwareCommandBuffer> {
        if Self::take_injected_failure(&self.fail_allocations) {
            return Err(GraphicsError::ResourceCreation("injected command buffer allocation failure".to_string()).into());
        }
        self.live_command_buffers.fetch_add(1, Ordering::AcqRel);
        Ok(SoftwareCommandBuffer {
            id: self.next_id(),
            commands: Mutex::new(Vec::new()),
            resets: AtomicUsize::new(0),
        })
    }

    fn free_command_buffer(&self, _command_buffer: &SoftwareCommandBuffer) {
        self.live_command_buffers.fetch_sub(1, Ordering::AcqRel);
    }

    fn reset_command_buffer(&self, command_buffer: &SoftwareCommandBuffer) -> Result<()> {
        if Self::take_injected_failure(&self.fail_resets) {
            return Err(GraphicsError::Reset("injected command buffer reset failure".to_string()).into());
        }
        command_buffer.commands.lock().clear();
        command_buffer.resets.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn create_fence(&self) -> Result<SoftwareFence> {
        if Self::take_injected_failure(&self.fail_allocations) {
            return Err(GraphicsError::ResourceCreation("injected fence creation failure".to_string()).into());
        }
        self.live_fences.fetch_add(1, Ordering::AcqRel);
        Ok(SoftwareFence(Arc::new(FenceState {
            id: self.next_id(),
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        })))
    }

    fn destroy_fence(&self, _fence: &SoftwareFence) {
        self.live_fences.fetch_sub(1, Ordering::AcqRel);
    }

    fn reset_fence(&self, fence: &SoftwareFence) -> Result<()> {
        if Self::take_injected_failure(&self.fail_resets) {
            return Err(GraphicsError::Reset("injected fence reset failure".to_string()).into());
        }
        *fence.0.signaled.lock() = false;
        Ok(())
    }

    fn fence_status(&self, fence: &SoftwareFence) -> Result<bool> {
        if Self::take_injected_failure(&self.fail_polls) {
            return Err(GraphicsError::DeviceLost("injected fence status failure".to_string()).into());
        }
        Ok(fence.is_signaled())
    }

    fn wait_for_fence(&self, fence: &SoftwareFence, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut signaled = fence.0.signaled.lock();
        while !*signaled {
            match deadline {
                Some(deadline) => {
                    if fence.0.cond.wait_until(&mut signaled, deadline).timed_out() {
                        return Ok(*signaled);
                    }
                }
                None => fence.0.cond.wait(&mut signaled),
            }
        }
        Ok(true)
    }

    fn submit(&self, command_buffer: &SoftwareCommandBuffer, fence: &SoftwareFence) -> Result<()> {
        if self.in_submit.swap(true, Ordering::AcqRel) {
            self.overlapping_submits.fetch_add(1, Ordering::AcqRel);
        }

        let result = if Self::take_injected_failure(&self.fail_submits) {
            Err(GraphicsError::Submission("injected queue submission failure".to_string()).into())
        } else if fence.is_signaled() {
            // vkQueueSubmit 要求 Fence 处于未 signal 状态
            Err(GraphicsError::Submission(format!("fence {} is already signaled", fence.id())).into())
        } else {
            // 拉长临界区，便于暴露并发提交
            thread::yield_now();
            self.pending.lock().push_back(PendingSubmission {
                command_buffer: command_buffer.id,
                commands: command_buffer.commands(),
                fence: fence.clone(),
            });
            self.pending_cond.notify_one();
            Ok(())
        };

        self.in_submit.store(false, Ordering::Release);
        result
    }

    fn name(&self) -> &str {
        "Software"
    }
}

/// 后台执行线程的句柄
pub struct ExecutorHandle {
    device: Arc<SoftwareDevice>,
    thread: Option<JoinHandle<()>>,
}

impl ExecutorHandle {
    /// 处理完剩余工作后停止执行线程
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.device.shutdown.store(true, Ordering::Release);
        self.device.pending_cond.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ExecutorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
