//! 核心功能模块
//!
//! 日志系统、配置管理和错误处理，与具体的图形设备无关。
//!
//! - `log`：基于 `tracing` 的日志初始化
//! - `config`：TOML 配置加载与校验
//! - `error`：统一的错误类型

pub mod log;
pub mod config;
pub mod error;

pub use error::{Result, SchedulerError, GraphicsError, ConfigError};
pub use config::{Config, SchedulerConfig, SoakConfig, LoggingConfig, LogLevel};
