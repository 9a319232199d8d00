//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为缓冲层对外暴露的错误语义提供集中定义：配额耗尽、I/O 失败、释放后访问与契约误用；
//! - 区分“可恢复”（配额耗尽，调用方可背压或稍后重试）与“缺陷”（释放后访问、不支持的操作），
//!   避免上层对所有错误一视同仁地重试。
//!
//! ## 设计要求（What）
//! - 所有错误类型实现 `thiserror::Error`，兼容 `std::error::Error` 与 `?` 传播；
//! - 每个变体映射到稳定错误码（`spool.<语义>`），便于日志与告警聚合；
//! - 清理路径（关闭句柄、删除临时文件、释放分段）不得返回次生错误，由调用点记录日志后吞掉。

use std::io;

use thiserror::Error;

use crate::accountant::ResourceKind;

/// 缓冲层统一的 `Result` 别名。
pub type Result<T, E = SpoolError> = core::result::Result<T, E>;

/// 稳定错误码集合。
///
/// - **意图 (Why)**：日志、指标与调用方匹配逻辑需要与消息文本解耦的稳定标识；
/// - **契约 (What)**：码值一旦发布不可更改，新增语义只能追加常量。
pub mod codes {
    /// 内存配额耗尽。
    pub const MEMORY_LIMIT: &str = "spool.memory_limit";
    /// 磁盘配额耗尽。
    pub const DISK_LIMIT: &str = "spool.disk_limit";
    /// 底层文件或流 I/O 失败。
    pub const IO: &str = "spool.io";
    /// 缓冲已释放。
    pub const CLOSED: &str = "spool.closed";
    /// 设计层面不支持的操作。
    pub const UNSUPPORTED: &str = "spool.unsupported";
    /// 游标不变量被破坏。
    pub const INVALID_STATE: &str = "spool.invalid_state";
    /// 配置非法。
    pub const CONFIG: &str = "spool.config";
}

/// 缓冲层错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：聚合分配、读写、释放等关键路径的异常，借助细粒度枚举帮助调用方区分
///   “背压信号”与“程序缺陷”。
/// - **契约 (What)**：
///   - 所有变体均实现 `Send + Sync + 'static`，可安全跨线程传播；
///   - `ResourceLimit` 是唯一建议调用方重试的变体，参见 [`SpoolError::is_retryable`]；
///   - `Closed` 与 `Unsupported` 代表调用方违反契约，应视为缺陷修复而非重试。
/// - **设计权衡 (Trade-offs)**：`Io` 变体保留 `context` 字符串，牺牲一次堆分配换取排障时可读的操作描述。
#[derive(Debug, Error)]
pub enum SpoolError {
    /// 内存或磁盘配额耗尽，资源记账器无法给出任何授权。
    #[error("{kind} quota exhausted while requesting {requested} bytes")]
    ResourceLimit { kind: ResourceKind, requested: usize },

    /// 底层文件或输出流 I/O 失败。
    #[error("I/O failure during {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// 对已释放的缓冲执行了操作。
    #[error("buffer #{id} is closed")]
    Closed { id: u64 },

    /// 在不支持的缓冲形态上执行操作，例如对区间缓冲做顺序写入。
    #[error("operation `{operation}` is not supported by this buffer")]
    Unsupported { operation: &'static str },

    /// 游标不变量 `reader <= writer <= capacity` 被破坏。
    #[error("invalid buffer state: {detail}")]
    InvalidState { detail: String },

    /// 配置无法解析或取值非法。
    #[error("invalid spool configuration: {detail}")]
    Config { detail: String },
}

impl SpoolError {
    /// 构造指定资源类型的配额耗尽错误。
    pub fn resource_limit(kind: ResourceKind, requested: usize) -> Self {
        SpoolError::ResourceLimit { kind, requested }
    }

    /// 为 I/O 错误附带操作上下文。
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        SpoolError::Io {
            context: context.into(),
            source,
        }
    }

    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            SpoolError::ResourceLimit {
                kind: ResourceKind::Memory,
                ..
            } => codes::MEMORY_LIMIT,
            SpoolError::ResourceLimit {
                kind: ResourceKind::Disk,
                ..
            } => codes::DISK_LIMIT,
            SpoolError::Io { .. } => codes::IO,
            SpoolError::Closed { .. } => codes::CLOSED,
            SpoolError::Unsupported { .. } => codes::UNSUPPORTED,
            SpoolError::InvalidState { .. } => codes::INVALID_STATE,
            SpoolError::Config { .. } => codes::CONFIG,
        }
    }

    /// 是否为内存配额耗尽；溢写工厂据此决定是否回落到磁盘。
    pub fn is_memory_limit(&self) -> bool {
        matches!(
            self,
            SpoolError::ResourceLimit {
                kind: ResourceKind::Memory,
                ..
            }
        )
    }

    /// 是否为磁盘配额耗尽。
    pub fn is_disk_limit(&self) -> bool {
        matches!(
            self,
            SpoolError::ResourceLimit {
                kind: ResourceKind::Disk,
                ..
            }
        )
    }

    /// 错误是否值得由调用方稍后重试。
    ///
    /// - 仅配额耗尽属于运行时状况，释放其它缓冲后可能恢复；
    /// - 本层自身从不自动重试，重试策略归调用方所有。
    pub fn is_retryable(&self) -> bool {
        matches!(self, SpoolError::ResourceLimit { .. })
    }
}
