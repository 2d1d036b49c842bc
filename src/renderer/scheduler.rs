//! 命令调度器
//!
//! 管理一个只增不减的命令缓冲区槽位池，并把提交串行化到唯一的执行队列。
//!
//! # 并发模型
//!
//! - 分配：任意多个线程可以同时调用 [`CommandScheduler::allocate_command_buffer`]。
//!   扫描按池顺序逐个尝试原子认领，池锁只在读取单个元素和追加新槽位时短暂持有，
//!   认领和 Fence 检查都在锁外进行
//! - 录制：槽位被独占后由持有者单线程录制，不需要额外同步
//! - 提交：唯一的全局串行点，`queue` 锁只包住入队调用本身
//!
//! 分配从不因硬件延迟而阻塞：要么复用已完成的槽位，要么扩充池。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use super::command::{ActiveCommandBuffer, CommandBufferSlot};
use super::sync::FenceCycle;
use crate::core::config::SchedulerConfig;
use crate::core::error::Result;
use crate::gfx::backend::GpuDevice;

/// 调度器统计信息
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SchedulerStats {
    /// 新建的槽位数量
    pub slots_created: u64,
    /// 复用已有槽位的次数
    pub slots_reused: u64,
    /// 成功分配的次数
    pub allocations: u64,
    /// 成功的提交次数
    pub submissions: u64,
    /// 失败的提交次数
    pub submission_failures: u64,
}

#[derive(Default)]
struct Counters {
    slots_created: AtomicU64,
    slots_reused: AtomicU64,
    allocations: AtomicU64,
    submissions: AtomicU64,
    submission_failures: AtomicU64,
}

/// 命令调度器
pub struct CommandScheduler<D: GpuDevice> {
    device: Arc<D>,
    slots: RwLock<Vec<Arc<CommandBufferSlot<D>>>>,
    queue: Mutex<()>,
    config: SchedulerConfig,
    counters: Counters,
}

impl<D: GpuDevice> CommandScheduler<D> {
    /// 使用默认配置创建调度器
    pub fn new(device: Arc<D>) -> Self {
        Self::with_config(device, SchedulerConfig::default())
    }

    /// 创建调度器
    ///
    /// # 参数
    ///
    /// * `device` - 提供命令缓冲区、Fence 和执行队列的设备
    /// * `config` - 调度器配置
    pub fn with_config(device: Arc<D>, config: SchedulerConfig) -> Self {
        debug!(
            device = device.name(),
            pool_warn_threshold = config.pool_warn_threshold,
            "Command scheduler created"
        );
        Self {
            device,
            slots: RwLock::new(Vec::new()),
            queue: Mutex::new(()),
            config,
            counters: Counters::default(),
        }
    }

    /// 获取设备
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// 分配一个独占的命令缓冲区
    ///
    /// 按池顺序返回第一个空闲且硬件已完成的槽位；没有可复用的槽位时创建新槽位并追加到池尾。
    /// 池没有硬上限，超过 `pool_warn_threshold` 时只记录警告。
    ///
    /// # 错误
    ///
    /// 设备无法创建命令缓冲区或 Fence，或者检查 Fence 时设备出错。
    /// 出错时不会有任何槽位保持被认领的状态。
    pub fn allocate_command_buffer(&self) -> Result<ActiveCommandBuffer<D>> {
        let mut index = 0;
        loop {
            // 读锁只覆盖取元素这一步
            let Some(slot) = self.slots.read().get(index).cloned() else {
                break;
            };

            if slot.allocate_if_free()? {
                self.counters.slots_reused.fetch_add(1, Ordering::Relaxed);
                self.counters.allocations.fetch_add(1, Ordering::Relaxed);
                trace!(slot = index, "Reusing command buffer slot");
                return Ok(ActiveCommandBuffer::new(index, slot));
            }
            index += 1;
        }

        let slot = Arc::new(CommandBufferSlot::new(self.device.clone())?);
        let (index, pool_size) = {
            let mut slots = self.slots.write();
            slots.push(slot.clone());
            (slots.len() - 1, slots.len())
        };
        self.counters.slots_created.fetch_add(1, Ordering::Relaxed);
        self.counters.allocations.fetch_add(1, Ordering::Relaxed);

        if pool_size > self.config.pool_warn_threshold {
            warn!(
                pool_size,
                threshold = self.config.pool_warn_threshold,
                "Command buffer pool grew past its soft limit"
            );
        } else {
            debug!(slot = index, pool_size, "Created command buffer slot");
        }

        Ok(ActiveCommandBuffer::new(index, slot))
    }

    /// 将录制完成的命令缓冲区提交到队列
    ///
    /// 使用句柄自身的 Fence，硬件执行完成后 signal。提交顺序即执行顺序。
    ///
    /// 失败时句柄保持独占且未提交的状态，调用者可以自行决定是否重试。
    ///
    /// # Panics
    ///
    /// 同一个周期重复提交时 panic。
    pub fn submit_command_buffer(&self, buffer: &ActiveCommandBuffer<D>) -> Result<()> {
        assert!(
            !buffer.is_submitted(),
            "command buffer slot {} was already submitted in this cycle",
            buffer.index()
        );

        let result = {
            let _queue = self.queue.lock();
            let result = self.device.submit(buffer.command_buffer(), buffer.fence());
            if result.is_ok() {
                buffer.cycle().mark_submitted();
            }
            result
        };

        match result {
            Ok(()) => {
                self.counters.submissions.fetch_add(1, Ordering::Relaxed);
                trace!(slot = buffer.index(), "Command buffer submitted");
                Ok(())
            }
            Err(e) => {
                self.counters.submission_failures.fetch_add(1, Ordering::Relaxed);
                error!(slot = buffer.index(), error = %e, "Command buffer submission failed");
                Err(e)
            }
        }
    }

    /// 分配、录制并提交一个命令缓冲区
    ///
    /// `record` 在提交前被调用；它返回错误时命令缓冲区不会被提交。
    ///
    /// # 返回值
    ///
    /// 本次提交的 FenceCycle，可用于等待完成或继续附加资源
    pub fn submit_with<F>(&self, record: F) -> Result<Arc<FenceCycle<D>>>
    where
        F: FnOnce(&ActiveCommandBuffer<D>) -> Result<()>,
    {
        let buffer = self.allocate_command_buffer()?;
        record(&buffer)?;
        self.submit_command_buffer(&buffer)?;
        Ok(buffer.cycle().clone())
    }

    /// 等待所有已提交的工作完成
    ///
    /// # 参数
    ///
    /// * `timeout` - 总的最长等待时间，`None` 表示无限等待
    ///
    /// # 返回值
    ///
    /// 全部完成返回 `Ok(true)`，超时返回 `Ok(false)`
    pub fn wait_idle(&self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let slots: Vec<_> = self.slots.read().clone();

        for slot in slots {
            let cycle = slot.current_cycle();
            if !cycle.is_submitted() {
                continue;
            }

            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if !cycle.wait(remaining)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// 当前池中的槽位数量
    pub fn pool_size(&self) -> usize {
        self.slots.read().len()
    }

    /// 获取统计信息
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            slots_created: self.counters.slots_created.load(Ordering::Relaxed),
            slots_reused: self.counters.slots_reused.load(Ordering::Relaxed),
            allocations: self.counters.allocations.load(Ordering::Relaxed),
            submissions: self.counters.submissions.load(Ordering::Relaxed),
            submission_failures: self.counters.submission_failures.load(Ordering::Relaxed),
        }
    }
}

impl<D: GpuDevice> Drop for CommandScheduler<D> {
    fn drop(&mut self) {
        let timeout = self.config.teardown_timeout();
        match self.wait_idle(Some(timeout)) {
            Ok(true) => info!(pool_size = self.pool_size(), "Command scheduler shut down"),
            Ok(false) => warn!(?timeout, "GPU work still in flight at scheduler shutdown"),
            Err(e) => error!(error = %e, "Failed to wait for GPU work at scheduler shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{GraphicsError, SchedulerError};
    use crate::gfx::software::SoftwareDevice;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    fn scheduler() -> (Arc<SoftwareDevice>, CommandScheduler<SoftwareDevice>) {
        let device = Arc::new(SoftwareDevice::new());
        let scheduler = CommandScheduler::new(device.clone());
        (device, scheduler)
    }

    #[test]
    fn test_allocate_from_empty_pool() {
        let (_device, scheduler) = scheduler();
        assert_eq!(scheduler.pool_size(), 0);

        let buffer = scheduler.allocate_command_buffer().unwrap();
        assert_eq!(buffer.index(), 0);
        assert_eq!(scheduler.pool_size(), 1);
        assert_eq!(scheduler.stats().slots_created, 1);
    }

    #[test]
    fn test_signaled_slot_is_reused() {
        let (device, scheduler) = scheduler();

        let buffer = scheduler.allocate_command_buffer().unwrap();
        buffer.command_buffer().record(1);
        scheduler.submit_command_buffer(&buffer).unwrap();
        drop(buffer);

        device.complete_all();

        let buffer = scheduler.allocate_command_buffer().unwrap();
        assert_eq!(buffer.index(), 0);
        assert_eq!(scheduler.pool_size(), 1);
        assert_eq!(scheduler.stats().slots_reused, 1);
    }

    #[test]
    fn test_pending_slot_forces_growth() {
        let (device, scheduler) = scheduler();

        let first = scheduler.allocate_command_buffer().unwrap();
        scheduler.submit_command_buffer(&first).unwrap();
        drop(first);

        let second = scheduler.allocate_command_buffer().unwrap();
        assert_eq!(second.index(), 1);
        assert_eq!(scheduler.pool_size(), 2);

        // 持有中的句柄同样不会被复用
        let third = scheduler.allocate_command_buffer().unwrap();
        assert_eq!(third.index(), 2);
        assert_eq!(scheduler.pool_size(), 3);

        device.complete_all();
    }

    #[test]
    fn test_first_match_in_pool_order() {
        let (device, scheduler) = scheduler();
        let buffers: Vec<_> = (0..3).map(|_| scheduler.allocate_command_buffer().unwrap()).collect();
        for buffer in &buffers {
            scheduler.submit_command_buffer(buffer).unwrap();
        }
        drop(buffers);

        // 只完成前两个提交
        device.complete_next();
        device.complete_next();

        let a = scheduler.allocate_command_buffer().unwrap();
        let b = scheduler.allocate_command_buffer().unwrap();
        let c = scheduler.allocate_command_buffer().unwrap();
        assert_eq!((a.index(), b.index(), c.index()), (0, 1, 3));

        device.complete_all();
    }

    #[test]
    fn test_attachments_released_before_reuse() {
        let (device, scheduler) = scheduler();
        let released = Arc::new(AtomicUsize::new(0));
        let texture = Arc::new("texture");

        let buffer = scheduler.allocate_command_buffer().unwrap();
        buffer.attach(texture.clone());
        let counter = released.clone();
        buffer.cycle().on_complete(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.submit_command_buffer(&buffer).unwrap();
        drop(buffer);

        device.complete_all();
        assert_eq!(released.load(Ordering::SeqCst), 0);
        assert_eq!(Arc::strong_count(&texture), 2);

        let _buffer = scheduler.allocate_command_buffer().unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(Arc::strong_count(&texture), 1);
    }

    #[test]
    fn test_submission_order_is_execution_order() {
        let (device, scheduler) = scheduler();

        let a = scheduler.allocate_command_buffer().unwrap();
        let b = scheduler.allocate_command_buffer().unwrap();
        b.command_buffer().record(2);
        a.command_buffer().record(1);

        scheduler.submit_command_buffer(&b).unwrap();
        scheduler.submit_command_buffer(&a).unwrap();
        device.complete_all();

        let executed: Vec<Vec<u32>> = device.executed().into_iter().map(|s| s.commands).collect();
        assert_eq!(executed, vec![vec![2], vec![1]]);
    }

    #[test]
    fn test_submission_failure_keeps_buffer_exclusive() {
        let (device, scheduler) = scheduler();
        let buffer = scheduler.allocate_command_buffer().unwrap();

        device.fail_next_submits(1);
        let err = scheduler.submit_command_buffer(&buffer).unwrap_err();
        assert!(matches!(err, SchedulerError::Graphics(GraphicsError::Submission(_))));
        assert!(!buffer.is_submitted());
        assert_eq!(scheduler.stats().submission_failures, 1);

        // 独占仍然有效，其他分配者拿不到这个槽位
        let other = scheduler.allocate_command_buffer().unwrap();
        assert_eq!(other.index(), 1);

        // 调用者可以自行重试
        scheduler.submit_command_buffer(&buffer).unwrap();
        assert!(buffer.is_submitted());
        device.complete_all();
    }

    #[test]
    #[should_panic(expected = "already submitted")]
    fn test_double_submit_panics() {
        let (device, scheduler) = scheduler();
        let buffer = scheduler.allocate_command_buffer().unwrap();
        scheduler.submit_command_buffer(&buffer).unwrap();
        device.complete_all();
        let _ = scheduler.submit_command_buffer(&buffer);
    }

    #[test]
    fn test_allocation_failure_leaves_no_claim() {
        let (device, scheduler) = scheduler();
        let buffer = scheduler.allocate_command_buffer().unwrap();

        device.fail_next_allocations(1);
        let err = scheduler.allocate_command_buffer().unwrap_err();
        assert!(matches!(err, SchedulerError::Graphics(GraphicsError::ResourceCreation(_))));
        assert_eq!(scheduler.pool_size(), 1);

        drop(buffer);
        let buffer = scheduler.allocate_command_buffer().unwrap();
        assert_eq!(buffer.index(), 0);
    }

    #[test]
    fn test_device_errors_during_reuse_leave_slot_free() {
        let (device, scheduler) = scheduler();
        let buffer = scheduler.allocate_command_buffer().unwrap();
        buffer.command_buffer().record(3);
        scheduler.submit_command_buffer(&buffer).unwrap();
        drop(buffer);
        device.complete_all();

        device.fail_next_polls(1);
        let err = scheduler.allocate_command_buffer().unwrap_err();
        assert!(err.is_device_lost());

        device.fail_next_resets(1);
        let err = scheduler.allocate_command_buffer().unwrap_err();
        assert!(matches!(err, SchedulerError::Graphics(GraphicsError::Reset(_))));
        assert_eq!(scheduler.pool_size(), 1);

        let buffer = scheduler.allocate_command_buffer().unwrap();
        assert_eq!(buffer.index(), 0);
        assert!(buffer.command_buffer().commands().is_empty());
        assert_eq!(scheduler.pool_size(), 1);

        let stats = scheduler.stats();
        assert_eq!(stats.slots_reused, 1);
        assert_eq!(stats.allocations, 2);
    }

    #[test]
    fn test_wait_on_old_cycle_survives_slot_reuse() {
        let (device, scheduler) = scheduler();

        for round in 0..50u32 {
            let cycle = scheduler
                .submit_with(|buffer| {
                    buffer.command_buffer().record(round);
                    Ok(())
                })
                .unwrap();

            std::thread::scope(|s| {
                let bounded = s.spawn(|| cycle.wait(Some(Duration::from_secs(5))).unwrap());
                let unbounded = s.spawn(|| cycle.wait(None).unwrap());

                device.complete_all();
                // 复用同一个槽位并重置它的 Fence
                let reused = scheduler.allocate_command_buffer().unwrap();
                assert_eq!(reused.index(), 0);

                assert!(bounded.join().unwrap());
                assert!(unbounded.join().unwrap());
            });
            assert!(cycle.poll().unwrap());
        }
        assert_eq!(scheduler.pool_size(), 1);
    }

    #[test]
    fn test_wait_on_abandoned_cycle_ends_at_reuse() {
        let (_device, scheduler) = scheduler();
        let buffer = scheduler.allocate_command_buffer().unwrap();
        let cycle = buffer.cycle().clone();
        drop(buffer);

        std::thread::scope(|s| {
            let waiter = s.spawn(|| cycle.wait(None).unwrap());
            std::thread::sleep(Duration::from_millis(20));

            let reused = scheduler.allocate_command_buffer().unwrap();
            assert_eq!(reused.index(), 0);
            assert!(waiter.join().unwrap());
        });
        assert!(cycle.is_retired());
    }

    #[test]
    fn test_completion_callback_can_use_scheduler() {
        let device = Arc::new(SoftwareDevice::new());
        let scheduler = Arc::new(CommandScheduler::new(device.clone()));
        let idle = Arc::new(AtomicUsize::new(0));

        let buffer = scheduler.allocate_command_buffer().unwrap();
        let inner = scheduler.clone();
        let counter = idle.clone();
        buffer.cycle().on_complete(move || {
            if inner.wait_idle(Some(Duration::from_millis(1))).unwrap() {
                counter.fetch_add(inner.pool_size(), Ordering::SeqCst);
            }
        });
        scheduler.submit_command_buffer(&buffer).unwrap();
        drop(buffer);
        device.complete_all();

        let reused = scheduler.allocate_command_buffer().unwrap();
        assert_eq!(reused.index(), 0);
        assert_eq!(idle.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_submit_with() {
        let (device, scheduler) = scheduler();
        let resource = Arc::new(5u64);

        let cycle = scheduler
            .submit_with(|buffer| {
                buffer.command_buffer().record(9);
                buffer.attach(resource.clone());
                Ok(())
            })
            .unwrap();
        assert!(cycle.is_submitted());
        assert!(!cycle.poll().unwrap());

        device.complete_all();
        assert!(cycle.wait(Some(Duration::from_secs(1))).unwrap());
        assert_eq!(device.executed()[0].commands, vec![9]);

        // 录制失败时不提交
        let failed = scheduler.submit_with(|_| Err(GraphicsError::Reset("recording aborted".to_string()).into()));
        assert!(failed.is_err());
        assert_eq!(scheduler.stats().submissions, 1);
    }

    #[test]
    fn test_wait_idle() {
        let (device, scheduler) = scheduler();
        for _ in 0..3 {
            scheduler.submit_with(|_| Ok(())).unwrap();
        }
        assert!(!scheduler.wait_idle(Some(Duration::from_millis(5))).unwrap());

        let executor = device.spawn_executor(Duration::from_micros(50)).unwrap();
        assert!(scheduler.wait_idle(None).unwrap());
        executor.stop();
    }

    #[test]
    fn test_concurrent_allocations_are_exclusive() {
        let (_device, scheduler) = scheduler();
        const THREADS: usize = 8;
        let barrier = Barrier::new(THREADS);

        let indices: Vec<usize> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        let buffer = scheduler.allocate_command_buffer().unwrap();
                        let index = buffer.index();
                        // 所有线程都还持有自己的句柄
                        barrier.wait();
                        index
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let unique: HashSet<_> = indices.iter().copied().collect();
        assert_eq!(unique.len(), THREADS);
        assert_eq!(scheduler.pool_size(), THREADS);
    }

    #[test]
    fn test_concurrent_producers_with_gpu() {
        let device = Arc::new(SoftwareDevice::new());
        let scheduler = CommandScheduler::new(device.clone());
        let executor = device.spawn_executor(Duration::from_micros(20)).unwrap();
        let released = Arc::new(AtomicUsize::new(0));
        const PRODUCERS: usize = 6;
        const ITERATIONS: usize = 200;

        std::thread::scope(|s| {
            for producer in 0..PRODUCERS {
                let scheduler = &scheduler;
                let released = released.clone();
                s.spawn(move || {
                    for i in 0..ITERATIONS {
                        let buffer = scheduler.allocate_command_buffer().unwrap();
                        // 新周期开始时命令缓冲区必须是空的
                        assert!(buffer.command_buffer().commands().is_empty());
                        buffer.command_buffer().record((producer * ITERATIONS + i) as u32);
                        let counter = released.clone();
                        buffer.cycle().on_complete(move || {
                            counter.fetch_add(1, Ordering::SeqCst);
                        });
                        scheduler.submit_command_buffer(&buffer).unwrap();
                    }
                });
            }
        });

        assert!(scheduler.wait_idle(Some(Duration::from_secs(30))).unwrap());
        executor.stop();

        let executed = device.executed();
        assert_eq!(executed.len(), PRODUCERS * ITERATIONS);
        assert!(executed.iter().all(|s| s.commands.len() == 1));
        assert_eq!(device.overlapping_submits(), 0);

        let stats = scheduler.stats();
        assert_eq!(stats.allocations, (PRODUCERS * ITERATIONS) as u64);
        assert_eq!(stats.submissions, (PRODUCERS * ITERATIONS) as u64);
        assert_eq!(stats.slots_created + stats.slots_reused, stats.allocations);
        assert_eq!(stats.slots_created as usize, scheduler.pool_size());

        // 每个槽位最后一个周期的附加资源在下一次复用前不会释放
        let pending = released.load(Ordering::SeqCst);
        assert!(pending <= PRODUCERS * ITERATIONS);
        assert!(pending >= PRODUCERS * ITERATIONS - scheduler.pool_size());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Allocate,
        Submit(usize),
        Drop(usize),
        CompleteNext,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => Just(Op::Allocate),
            2 => (0usize..8).prop_map(Op::Submit),
            2 => (0usize..8).prop_map(Op::Drop),
            2 => Just(Op::CompleteNext),
        ]
    }

    proptest! {
        #[test]
        fn prop_pool_invariants(ops in prop::collection::vec(op_strategy(), 1..64)) {
            let (device, scheduler) = scheduler();
            let mut held: Vec<ActiveCommandBuffer<SoftwareDevice>> = Vec::new();
            let mut last_size = 0;

            for op in ops {
                match op {
                    Op::Allocate => {
                        let buffer = scheduler.allocate_command_buffer().unwrap();
                        // 同一时刻没有两个句柄指向同一个槽位
                        prop_assert!(held.iter().all(|b| b.index() != buffer.index()));
                        // 复用的槽位必然已经完成
                        prop_assert!(!buffer.is_submitted());
                        held.push(buffer);
                    }
                    Op::Submit(i) => {
                        if let Some(buffer) = held.get(i) {
                            if !buffer.is_submitted() {
                                scheduler.submit_command_buffer(buffer).unwrap();
                            }
                        }
                    }
                    Op::Drop(i) => {
                        if i < held.len() {
                            held.swap_remove(i);
                        }
                    }
                    Op::CompleteNext => {
                        device.complete_next();
                    }
                }

                let size = scheduler.pool_size();
                prop_assert!(size >= last_size);
                prop_assert!(size >= held.len());
                last_size = size;
            }

            device.complete_all();
        }
    }
}
