//! `spark-spool` 是邮件服务平台的缓冲与暂存层：按资源记账分配逻辑缓冲，
//! 透明地以堆内存或临时磁盘文件作为后端。
//!
//! # 模块定位（Why）
//! - 大小不一的消息负载需要在不让内存无界增长的前提下累积与转发：内存配额耗尽后新分配静默溢写到磁盘，
//!   全局磁盘配额再为最坏情况兜底；
//! - 网络服务框架只消费缓冲，不影响其内部设计；配置加载器只提供配额数字。
//!
//! # 设计概要（How）
//! - `accountant`：无锁的内存/磁盘配额记账器，发放可能降级的授权；
//! - `buffer`：游标式 [`Buffer`] 契约，以及内存、磁盘两种物理缓冲与只读快照；
//! - `spillover`：内存优先、磁盘兜底的默认分配策略；
//! - `segmented`：串联多个物理缓冲的分段缓冲；
//! - `range`：按偏移索引、支持并发写入的区间缓冲；
//! - `registry`：按逻辑池名分发缓冲的注册表，由宿主显式 `init`/`shutdown`。
//!
//! # 所有权约定（Consistency）
//! - 缓冲只能由所属工厂回收：`clear` 把存储交还工厂，`free` 以 `Box<Self>` 消费缓冲，`Drop` 兜底回收；
//! - 释放后的缓冲对任何访问都返回 [`SpoolError::Closed`]。

pub mod accountant;
pub mod buffer;
pub mod config;
pub mod error;
pub mod range;
pub mod registry;
pub mod segmented;
pub mod spillover;

pub use accountant::{AccountantSnapshot, Grant, ResourceAccountant, ResourceKind};
pub use buffer::{
    Buffer, BufferKind, Cursor, DiskBuffer, DiskFactory, MemoryBuffer, MemoryFactory,
    ReadOnlyBuffer, UNBOUNDED_CAPACITY,
};
pub use config::SpoolConfig;
pub use error::{Result, SpoolError};
pub use range::RangeBuffer;
pub use registry::{BufferRegistry, RegistryStats};
pub use segmented::SegmentedBuffer;
pub use spillover::SpilloverFactory;
