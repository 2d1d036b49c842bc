//! cmd_sched - 命令调度器压力测试
//!
//! 使用软件模拟设备驱动调度器：多个生产者线程并发分配、录制、附加资源并提交，
//! 后台执行线程按提交顺序模拟 GPU 执行并 signal Fence。
//!
//! # 使用方法
//!
//! ```bash
//! # 使用配置文件 config.toml（不存在时写出一份默认配置）
//! cargo run
//!
//! # 命令行覆盖
//! cargo run -- --producers 8 --iterations 5000 --latency-us 50 --verbose
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use tracing::{debug, info, warn};

use cmd_sched::core::{log, Config};
use cmd_sched::gfx::{GpuDevice, SoftwareDevice};
use cmd_sched::renderer::CommandScheduler;

const CONFIG_PATH: &str = "config.toml";

/// 模拟一个被命令引用的 GPU 资源，释放时计数
struct TrackedResource {
    released: Arc<AtomicUsize>,
}

impl Drop for TrackedResource {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}

fn main() -> anyhow::Result<()> {
    // 1. 加载配置并应用命令行参数
    let config_path = Path::new(CONFIG_PATH);
    let wrote_default = !config_path.exists();
    let mut config = if wrote_default {
        let config = Config::default();
        config.save_to_file(config_path).context("failed to write default configuration")?;
        config
    } else {
        Config::from_file(config_path).context("failed to load configuration")?
    };
    config.apply_args(std::env::args());
    config.validate().context("invalid configuration")?;

    // 2. 初始化日志系统
    let log_file = config.logging.file_output.then_some(config.logging.log_file.as_str());
    log::init_logger(config.logging.level, config.logging.file_output, log_file);
    info!(version = env!("CARGO_PKG_VERSION"), "cmd_sched soak starting");
    if wrote_default {
        warn!(path = CONFIG_PATH, "No configuration found, wrote defaults");
    }
    info!(
        producers = config.soak.producers,
        iterations = config.soak.iterations,
        latency_us = config.soak.latency_us,
        resources_per_submit = config.soak.resources_per_submit,
        "Soak configuration"
    );

    // 3. 创建设备、执行线程和调度器
    let device = Arc::new(SoftwareDevice::new());
    let executor = device.spawn_executor(config.soak.latency())?;
    let scheduler = CommandScheduler::with_config(device.clone(), config.scheduler.clone());
    info!(device = device.name(), "Device ready");

    let attached = Arc::new(AtomicUsize::new(0));
    let released = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    // 4. 生产者线程
    std::thread::scope(|s| -> anyhow::Result<()> {
        let handles: Vec<_> = (0..config.soak.producers)
            .map(|producer| {
                let scheduler = &scheduler;
                let soak = &config.soak;
                let attached = attached.clone();
                let released = released.clone();
                s.spawn(move || -> anyhow::Result<()> {
                    for iteration in 0..soak.iterations {
                        let buffer = scheduler.allocate_command_buffer()?;
                        buffer.command_buffer().record((producer * soak.iterations + iteration) as u32);
                        for _ in 0..soak.resources_per_submit {
                            buffer.attach(TrackedResource { released: released.clone() });
                        }
                        attached.fetch_add(soak.resources_per_submit, Ordering::Relaxed);
                        scheduler.submit_command_buffer(&buffer)?;
                    }
                    debug!(producer, "Producer finished");
                    Ok(())
                })
            })
            .collect();

        for handle in handles {
            match handle.join() {
                Ok(result) => result?,
                Err(_) => bail!("producer thread panicked"),
            }
        }
        Ok(())
    })?;

    // 5. 等待 GPU 完成并输出统计
    let idle = scheduler.wait_idle(Some(config.scheduler.teardown_timeout()))?;
    let elapsed = started.elapsed();
    let stats = scheduler.stats();
    let executed = device.executed().len();

    info!(
        idle,
        elapsed_ms = elapsed.as_millis() as u64,
        pool_size = scheduler.pool_size(),
        slots_created = stats.slots_created,
        slots_reused = stats.slots_reused,
        allocations = stats.allocations,
        submissions = stats.submissions,
        executed,
        "Soak finished"
    );

    drop(scheduler);
    executor.stop();

    let attached = attached.load(Ordering::Relaxed);
    let released = released.load(Ordering::Relaxed);
    info!(attached, released, "Attached resources released");
    if attached != released {
        bail!("{} of {} attached resources were never released", attached - released, attached);
    }
    if device.overlapping_submits() != 0 {
        bail!("detected {} overlapping queue submissions", device.overlapping_submits());
    }

    Ok(())
}
