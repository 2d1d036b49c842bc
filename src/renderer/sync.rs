//! GPU 同步机制模块
//!
//! 提供命令缓冲区生命周期跟踪所需的两个同步原语：
//!
//! - [`Fence`]：设备 Fence 的 RAII 包装，由命令缓冲区槽位和它的各个 `FenceCycle` 共享
//! - [`FenceCycle`]：一次独占使用周期的完成令牌
//!
//! # FenceCycle 协议
//!
//! 每当槽位从空闲变为独占，都会创建一个全新的 `FenceCycle`，绝不原地重置复用。
//! 录制命令的一方把命令引用到的资源附加到当前 `FenceCycle` 上，
//! 这些资源会一直存活到 Fence signal 之后、槽位被下一次复用时才统一释放：
//!
//! ```text
//! allocate ──► attach(resource)... ──► submit ──► Fence signal ──► 下一次 allocate: retire()
//!                                                                   └─ 释放全部附加资源
//! ```
//!
//! `poll` 只查询不释放，释放只发生在调度器调用的 `retire` 中，因此 `poll` 可以被任意线程重复调用。
//!
//! # Fence 复用
//!
//! 同一个槽位的所有周期共享一个 Fence。槽位复用时先让旧周期锁定为已完成，再重置 Fence。
//! 查询和等待持有 Fence 的共享访问权并在其中重新检查周期自己的完成标志，
//! 重置持有独占访问权，因此旧周期的持有者永远不会观察到属于下一个周期的 Fence 状态，
//! 设备也不会在等待同一个 Fence 的同时重置它。

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{error, trace, warn};

use crate::core::error::Result;
use crate::gfx::backend::GpuDevice;

/// 单次阻塞等待的最长时间，到期后释放 Fence 访问权并重新检查完成标志
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// 设备 Fence 的 RAII 包装
///
/// 销毁时归还给设备。调用方需要保证最后一个引用被释放时硬件已不再使用它。
pub struct Fence<D: GpuDevice> {
    device: Arc<D>,
    raw: D::Fence,
    // 查询/等待共享，重置独占
    access: RwLock<()>,
}

impl<D: GpuDevice> Fence<D> {
    /// 创建一个未 signal 的 Fence
    pub fn new(device: Arc<D>) -> Result<Self> {
        let raw = device.create_fence()?;
        Ok(Self {
            device,
            raw,
            access: RwLock::new(()),
        })
    }

    /// 获取底层 Fence 句柄
    pub fn raw(&self) -> &D::Fence {
        &self.raw
    }

    /// 非阻塞地查询是否已 signal
    pub fn is_signaled(&self) -> Result<bool> {
        let _access = self.access.read();
        self.device.fence_status(&self.raw)
    }

    /// 阻塞等待，超时返回 `Ok(false)`
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let _access = self.access.read();
        self.device.wait_for_fence(&self.raw, timeout)
    }

    /// 重置为未 signal 状态
    ///
    /// 等待所有进行中的查询和等待结束后才会执行。
    pub fn reset(&self) -> Result<()> {
        let _access = self.access.write();
        self.device.reset_fence(&self.raw)
    }

    /// `settled` 已为真时直接返回，否则查询设备
    fn status_unless(&self, settled: &AtomicBool) -> Result<bool> {
        let _access = self.access.read();
        if settled.load(Ordering::Acquire) {
            return Ok(true);
        }
        self.device.fence_status(&self.raw)
    }

    /// `settled` 已为真时直接返回，否则最多等待 `timeout`
    fn wait_unless(&self, settled: &AtomicBool, timeout: Duration) -> Result<bool> {
        let _access = self.access.read();
        if settled.load(Ordering::Acquire) {
            return Ok(true);
        }
        self.device.wait_for_fence(&self.raw, Some(timeout))
    }
}

impl<D: GpuDevice> Drop for Fence<D> {
    fn drop(&mut self) {
        self.device.destroy_fence(&self.raw);
    }
}

/// 附加到 FenceCycle 上的资源
enum Attachment {
    /// 持有到 Fence signal 为止的对象
    Object(Box<dyn Any + Send + Sync>),
    /// Fence signal 之后执行的释放动作
    Callback(Box<dyn FnOnce() + Send>),
}

impl Attachment {
    fn release(self) {
        match self {
            Attachment::Object(object) => drop(object),
            Attachment::Callback(callback) => callback(),
        }
    }
}

/// 一次独占使用周期的完成令牌
///
/// 通过 `Arc` 共享：槽位持有一份，录制过程中需要引用它的一方也可以各持一份。
///
/// # 状态
///
/// - `signaled`：一旦观察到 Fence 已 signal 就锁定为真；未 signal 的结果从不缓存，每次都重新查询设备
/// - `submitted`：本周期的命令缓冲区已成功提交到队列
/// - `retired`：附加资源已释放，此后再附加资源属于编程错误
pub struct FenceCycle<D: GpuDevice> {
    fence: Arc<Fence<D>>,
    signaled: AtomicBool,
    submitted: AtomicBool,
    retired: AtomicBool,
    attachments: Mutex<Vec<Attachment>>,
}

impl<D: GpuDevice> FenceCycle<D> {
    /// 为一个已重置的 Fence 创建新的周期
    pub fn new(fence: Arc<Fence<D>>) -> Self {
        Self {
            fence,
            signaled: AtomicBool::new(false),
            submitted: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            attachments: Mutex::new(Vec::new()),
        }
    }

    /// 非阻塞地检查 Fence 是否已 signal
    ///
    /// 不会释放任何附加资源。可以从任意线程重复调用。
    pub fn poll(&self) -> Result<bool> {
        if self.signaled.load(Ordering::Acquire) {
            return Ok(true);
        }

        let signaled = self.fence.status_unless(&self.signaled)?;
        if signaled {
            self.signaled.store(true, Ordering::Release);
        }
        Ok(signaled)
    }

    /// 阻塞等待 Fence signal
    ///
    /// # 参数
    ///
    /// * `timeout` - 最长等待时间，`None` 表示无限等待
    ///
    /// # 返回值
    ///
    /// 在超时前完成（或周期已退役）返回 `Ok(true)`，超时返回 `Ok(false)`。
    /// 槽位在等待期间被复用不会影响结果。
    /// 对从未提交且未退役的周期进行无限等待会一直阻塞。
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        if self.poll()? {
            return Ok(true);
        }

        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        loop {
            let slice = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(self.signaled.load(Ordering::Acquire));
                    }
                    remaining.min(WAIT_SLICE)
                }
                None => WAIT_SLICE,
            };

            if self.fence.wait_unless(&self.signaled, slice)? {
                self.signaled.store(true, Ordering::Release);
                return Ok(true);
            }
        }
    }

    /// 附加一个对象，使其存活到 Fence signal 之后
    ///
    /// 通常传入资源的 `Arc`。
    ///
    /// # Panics
    ///
    /// 周期已退役时 panic。
    pub fn attach<T: Send + Sync + 'static>(&self, object: T) {
        self.push(Attachment::Object(Box::new(object)));
    }

    /// 批量附加对象
    pub fn attach_all<T, I>(&self, objects: I)
    where
        T: Send + Sync + 'static,
        I: IntoIterator<Item = T>,
    {
        let mut attachments = self.attachments.lock();
        assert!(
            !self.retired.load(Ordering::Acquire),
            "cannot attach resources to a retired fence cycle"
        );
        attachments.extend(
            objects
                .into_iter()
                .map(|object| Attachment::Object(Box::new(object))),
        );
    }

    /// 注册一个在 Fence signal 之后执行的释放动作
    ///
    /// # Panics
    ///
    /// 周期已退役时 panic。
    pub fn on_complete<F: FnOnce() + Send + 'static>(&self, callback: F) {
        self.push(Attachment::Callback(Box::new(callback)));
    }

    fn push(&self, attachment: Attachment) {
        let mut attachments = self.attachments.lock();
        assert!(
            !self.retired.load(Ordering::Acquire),
            "cannot attach resources to a retired fence cycle"
        );
        attachments.push(attachment);
    }

    /// 当前附加的资源数量
    pub fn attachment_count(&self) -> usize {
        self.attachments.lock().len()
    }

    /// 本周期是否已成功提交
    pub fn is_submitted(&self) -> bool {
        self.submitted.load(Ordering::Acquire)
    }

    /// 本周期是否已退役
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub(crate) fn mark_submitted(&self) {
        self.submitted.store(true, Ordering::Release);
    }

    /// 释放全部附加资源并退役
    ///
    /// 只能由调度器在确认 Fence 已 signal（或本周期从未提交）之后、重置 Fence 之前调用。
    /// 重复调用是安全的，附加资源只会被释放一次。退役后的周期始终报告已完成。
    ///
    /// 附加资源的析构和回调在调用线程上直接执行，调用方不能持有任何调度器内部的锁。
    pub(crate) fn retire(&self) {
        let released = {
            let mut attachments = self.attachments.lock();
            self.retired.store(true, Ordering::Release);
            std::mem::take(&mut *attachments)
        };
        self.signaled.store(true, Ordering::Release);

        if !released.is_empty() {
            trace!(count = released.len(), "Releasing fence cycle attachments");
        }
        // 在 attachments 锁外释放
        for attachment in released {
            attachment.release();
        }
    }
}

impl<D: GpuDevice> Drop for FenceCycle<D> {
    fn drop(&mut self) {
        let attachments = std::mem::take(self.attachments.get_mut());
        if attachments.is_empty() {
            return;
        }

        // 最后一个引用消失时硬件可能仍在使用这些资源
        if *self.submitted.get_mut() && !*self.signaled.get_mut() {
            warn!(count = attachments.len(), "Dropping an in-flight fence cycle, waiting for the GPU");
            if let Err(e) = self.fence.wait(None) {
                error!(error = %e, "Failed to wait for fence before releasing attachments");
            }
        }

        for attachment in attachments {
            attachment.release();
        }
    }
}

impl<D: GpuDevice> fmt::Debug for FenceCycle<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FenceCycle")
            .field("signaled", &self.signaled.load(Ordering::Relaxed))
            .field("submitted", &self.submitted.load(Ordering::Relaxed))
            .field("retired", &self.retired.load(Ordering::Relaxed))
            .field("attachments", &self.attachments.lock().len())
            .finish()
    }
}
