//! 配置管理模块
//!
//! 提供调度器配置的加载、解析和管理功能。
//! 支持从 TOML 配置文件加载，也支持命令行参数覆盖。
//!
//! # 配置文件格式 (config.toml)
//!
//! ```toml
//! [scheduler]
//! pool_warn_threshold = 64    # 命令缓冲区池超过此数量时输出警告
//! teardown_timeout_ms = 5000  # 销毁调度器时等待 GPU 完成的最长时间
//!
//! [soak]
//! producers = 4
//! iterations = 1000
//! latency_us = 200
//! resources_per_submit = 2
//!
//! [logging]
//! level = "info"      # trace, debug, info, warn, error
//! file_output = false
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::error::{ConfigError, Result};

/// 顶层配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// 调度器配置
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// 压力测试配置
    #[serde(default)]
    pub soak: SoakConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 调度器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// 池大小的软上限
    ///
    /// 池本身不设硬上限（需要更多缓冲区时直接增长），
    /// 超过该值时只输出警告，用于发现泄漏的命令缓冲区句柄。
    #[serde(default = "default_pool_warn_threshold")]
    pub pool_warn_threshold: usize,

    /// 销毁时等待未完成工作的超时（毫秒）
    #[serde(default = "default_teardown_timeout_ms")]
    pub teardown_timeout_ms: u64,
}

/// 压力测试配置
///
/// 仅供 `cmd_sched` 二进制使用，用软件设备模拟多生产者负载。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoakConfig {
    /// 生产者线程数量
    #[serde(default = "default_producers")]
    pub producers: usize,

    /// 每个生产者的提交次数
    #[serde(default = "default_iterations")]
    pub iterations: usize,

    /// 模拟的 GPU 执行延迟（微秒）
    #[serde(default = "default_latency_us")]
    pub latency_us: u64,

    /// 每次提交附加到 FenceCycle 的资源数量
    #[serde(default = "default_resources_per_submit")]
    pub resources_per_submit: usize,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    /// 是否输出到文件
    #[serde(default = "default_file_output")]
    pub file_output: bool,

    /// 日志文件路径
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

// 默认值函数
fn default_pool_warn_threshold() -> usize { 64 }
fn default_teardown_timeout_ms() -> u64 { 5000 }
fn default_producers() -> usize { 4 }
fn default_iterations() -> usize { 1000 }
fn default_latency_us() -> u64 { 200 }
fn default_resources_per_submit() -> usize { 2 }
fn default_log_level() -> LogLevel { LogLevel::Info }
fn default_file_output() -> bool { false }
fn default_log_file() -> String { "cmd_sched.log".to_string() }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_warn_threshold: default_pool_warn_threshold(),
            teardown_timeout_ms: default_teardown_timeout_ms(),
        }
    }
}

impl Default for SoakConfig {
    fn default() -> Self {
        Self {
            producers: default_producers(),
            iterations: default_iterations(),
            latency_us: default_latency_us(),
            resources_per_submit: default_resources_per_submit(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: default_file_output(),
            log_file: default_log_file(),
        }
    }
}

impl SchedulerConfig {
    /// 销毁超时
    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }
}

impl SoakConfig {
    /// 模拟的 GPU 执行延迟
    pub fn latency(&self) -> Duration {
        Duration::from_micros(self.latency_us)
    }
}

impl Config {
    /// 从配置文件加载
    ///
    /// # 参数
    ///
    /// * `path` - 配置文件路径
    ///
    /// # 返回值
    ///
    /// 成功返回 `Config` 实例，失败返回错误
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let contents = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path_str.clone()))?;

        Self::from_toml_str(&contents)
    }

    /// 从 TOML 字符串解析
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| ConfigError::ParseError(e.to_string()).into())
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// 从命令行参数覆盖配置
    ///
    /// 支持的参数：
    /// - `--producers <value>`: 生产者线程数量
    /// - `--iterations <value>`: 每个生产者的提交次数
    /// - `--latency-us <value>`: 模拟的 GPU 延迟
    /// - `--verbose`: 日志级别设为 debug
    pub fn apply_args<I>(&mut self, args: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|s| s.as_ref().to_string()).collect();

        if args.iter().any(|a| a == "--verbose") {
            self.logging.level = LogLevel::Debug;
        }

        if let Some(producers) = parse_flag(&args, "--producers") {
            self.soak.producers = producers;
        }

        if let Some(iterations) = parse_flag(&args, "--iterations") {
            self.soak.iterations = iterations;
        }

        if let Some(latency) = parse_flag(&args, "--latency-us") {
            self.soak.latency_us = latency;
        }
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.pool_warn_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.pool_warn_threshold".to_string(),
                reason: "Threshold must be greater than 0".to_string(),
            }.into());
        }

        if self.soak.producers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "soak.producers".to_string(),
                reason: "At least one producer is required".to_string(),
            }.into());
        }

        Ok(())
    }
}

fn parse_flag<T: std::str::FromStr>(args: &[String], flag: &str) -> Option<T> {
    let idx = args.iter().position(|a| a == flag)?;
    args.get(idx + 1)?.parse().ok()
}
