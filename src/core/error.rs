//! 错误处理模块
//!
//! 定义了调度器中使用的统一错误类型，使用 `thiserror` 提供友好的错误消息。
//!
//! # 错误分类
//!
//! - 资源耗尽：设备无法创建新的命令缓冲区或 Fence，直接返回给调用者，不做内部重试
//! - 提交失败：队列拒绝提交，直接返回给提交者，缓冲区保持独占状态以便调用者自行重试
//! - 设备丢失：查询或等待 Fence 失败
//!
//! 编程错误（向已退役的 FenceCycle 附加资源、重复提交同一个缓冲区）不属于运行时错误，
//! 直接 panic。

use thiserror::Error;

/// 调度器统一的 Result 类型
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// 调度器的错误类型
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// 图形设备错误
    #[error("Graphics error: {0}")]
    Graphics(#[from] GraphicsError),

    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 初始化错误
    #[error("Initialization error: {0}")]
    Initialization(String),
}

/// 配置相关的错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 配置文件未找到
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    /// 配置文件解析失败
    #[error("Failed to parse config: {0}")]
    ParseError(String),

    /// 配置值无效
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// 图形设备相关的错误
#[derive(Debug, Error)]
pub enum GraphicsError {
    /// 命令缓冲区、Fence 或命令池创建失败
    #[error("Resource creation failed: {0}")]
    ResourceCreation(String),

    /// 队列拒绝了提交
    #[error("Queue submission failed: {0}")]
    Submission(String),

    /// 命令缓冲区或 Fence 重置失败
    #[error("Reset failed: {0}")]
    Reset(String),

    /// 查询或等待 Fence 失败
    #[error("Fence wait failed: {0}")]
    FenceWait(String),

    /// 设备丢失
    #[error("Device lost: {0}")]
    DeviceLost(String),
}

impl SchedulerError {
    /// 是否为设备丢失错误
    pub fn is_device_lost(&self) -> bool {
        matches!(self, SchedulerError::Graphics(GraphicsError::DeviceLost(_)))
    }
}
