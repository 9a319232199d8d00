//! 缓冲核心契约：游标读写、生命周期与容量查询。
//!
//! # 模块定位（Why）
//! - 协议处理器只面向 [`Buffer`] 编程，不关心字节落在堆内存还是临时文件；
//! - 内存/磁盘两种物理缓冲与分段、区间两种组合缓冲共享同一契约，调用方可在它们之间自由替换。
//!
//! # 生命周期（How）
//! - 缓冲由工厂在取得资源授权后构造，并记录所属工厂的共享句柄；
//! - [`Buffer::clear`] 把存储交还工厂的 `free_buffer` 并转入 `Closed`，缓冲自身从不直接释放存储；
//! - [`Buffer::free`] 以 `Box<Self>` 接收所有权，释放后编译期即无法再访问；`Drop` 兜底释放遗忘的缓冲；
//! - 关闭后除 `clear`/`is_closed` 外的所有操作都返回 [`SpoolError::Closed`]。

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, SpoolError};

pub mod disk;
pub mod memory;
pub mod read_only;

pub(crate) use disk::positioned;
pub use disk::{DiskBuffer, DiskFactory};
pub use memory::{MemoryBuffer, MemoryFactory};
pub use read_only::ReadOnlyBuffer;

/// 容量无上限的缓冲（磁盘、分段、区间）对外报告的哨兵容量。
pub const UNBOUNDED_CAPACITY: usize = i32::MAX as usize;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// 分配进程内单调递增的缓冲序号，仅用于诊断日志。
pub(crate) fn next_buffer_id() -> u64 {
    NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed)
}

/// 缓冲的存储形态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// 堆内存字节数组。
    Memory,
    /// 临时文件。
    Disk,
    /// 由多个物理缓冲串联而成的分段缓冲。
    Segmented,
    /// 按偏移索引的区间缓冲。
    Range,
    /// 只读克隆视图。
    ReadOnly,
}

/// `Buffer` 描述统一的游标式读写契约。
///
/// # 契约说明（What）
/// - **游标不变量**：任意操作后都满足 `reader_index <= writer_index <= capacity`；
/// - `write` 从写游标处追加，返回实际接受的字节数（可能小于 `src.len()`）；
/// - `read`/`transfer_to` 从读游标处向前消费，返回实际产出的字节数；无可读数据时返回 0 而非错误；
/// - `rewind` 仅把读游标归零，写游标保持不变，它不是截断；
/// - `clear` 幂等：已关闭时直接返回，否则归零游标、交还存储并转入 `Closed`；
/// - 除 `is_closed`/`clear`/`free` 外，关闭后的任何访问都返回 [`SpoolError::Closed`]。
///
/// # 并发（Trade-offs）
/// - 单个实例的读写游标彼此独立、不做同步，同一实例上的并发生产与消费需调用方自行串行化；
/// - 需要多读者扇出时，使用 [`clone_buffer`](Self::clone_buffer) 为每个读者生成独立快照。
pub trait Buffer: Send + 'static {
    /// 诊断用序号。
    fn id(&self) -> u64;

    /// 存储形态。
    fn kind(&self) -> BufferKind;

    /// 是否已经释放。
    fn is_closed(&self) -> bool;

    /// 读游标位置。
    fn reader_index(&self) -> Result<usize>;

    /// 写游标位置，即已写入的逻辑字节数。
    fn writer_index(&self) -> Result<usize>;

    /// 容量；磁盘与组合缓冲返回 [`UNBOUNDED_CAPACITY`]。
    fn capacity(&self) -> Result<usize>;

    /// 是否仍有未读数据。
    fn readable(&self) -> Result<bool> {
        Ok(self.writer_index()? > self.reader_index()?)
    }

    /// 是否仍可写入。
    fn writable(&self) -> Result<bool> {
        Ok(self.capacity()? > self.writer_index()?)
    }

    /// 尚未读取的字节数。
    fn readable_bytes(&self) -> Result<usize> {
        Ok(self.writer_index()? - self.reader_index()?)
    }

    /// 追加写入，返回实际接受的字节数。
    fn write(&mut self, src: &[u8]) -> Result<usize>;

    /// 读取到 `dst`，返回实际产出的字节数。
    fn read(&mut self, dst: &mut [u8]) -> Result<usize>;

    /// 将至多 `max_count` 字节直接搬运到外部输出（套接字、文件等），语义与 `read` 一致。
    fn transfer_to(&mut self, sink: &mut dyn Write, max_count: usize) -> Result<usize>;

    /// 读游标归零，写游标保持不变。
    fn rewind(&mut self) -> Result<()>;

    /// 幂等释放：交还存储与资源授权，并转入 `Closed`。
    fn clear(&mut self) -> Result<()>;

    /// 生成只读快照：内容截止到当前写游标，读游标从 0 开始，后续对源的写入不可见。
    fn clone_buffer(&self) -> Result<ReadOnlyBuffer>;

    /// 消费式释放，释放后缓冲值不复存在。
    fn free(mut self: Box<Self>) -> Result<()> {
        self.clear()
    }
}

/// 读写游标对。
///
/// # 教案式说明
/// - **意图 (Why)**：所有物理缓冲都维护同一组不变量，集中在此避免各实现各自校验；
/// - **契约 (What)**：构造时即校验 `reader <= writer <= capacity`，违反立即返回 `InvalidState`；
///   推进方法由调用方保证不越界，越界属于实现缺陷，由 `debug_assert!` 捕获。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Cursor {
    reader: usize,
    writer: usize,
}

impl Cursor {
    /// 以显式位置构造游标，校验不变量。
    pub fn new(reader: usize, writer: usize, capacity: usize) -> Result<Self> {
        if reader > writer || writer > capacity {
            return Err(SpoolError::InvalidState {
                detail: format!(
                    "cursor requires reader <= writer <= capacity, got {reader} / {writer} / {capacity}"
                ),
            });
        }
        Ok(Self { reader, writer })
    }

    pub fn reader(&self) -> usize {
        self.reader
    }

    pub fn writer(&self) -> usize {
        self.writer
    }

    /// 未读字节数。
    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    pub(crate) fn advance_reader(&mut self, len: usize) {
        debug_assert!(self.reader + len <= self.writer);
        self.reader += len;
    }

    pub(crate) fn advance_writer(&mut self, len: usize) {
        self.writer += len;
    }

    /// 读游标归零。
    pub(crate) fn rewind(&mut self) {
        self.reader = 0;
    }

    /// 两个游标均归零，仅在释放时使用。
    pub(crate) fn reset(&mut self) {
        self.reader = 0;
        self.writer = 0;
    }
}
