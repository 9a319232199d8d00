//! 内存缓冲与其工厂。

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::accountant::{Grant, ResourceAccountant, ResourceKind};
use crate::buffer::{Buffer, BufferKind, Cursor, ReadOnlyBuffer, next_buffer_id};
use crate::error::{Result, SpoolError};

/// `MemoryFactory` 以内存记账器为闸门，分配定长字节数组构成的缓冲。
///
/// # 模块角色（Why）
/// - 作为溢写工厂的首选分配路径，承接绝大多数小负载；
/// - 通过 `free_buffer` 集中归还授权，缓冲自身不接触记账器。
///
/// # 契约说明（What）
/// - `get_buffer(capacity)` 的实际容量等于授权大小，而非请求大小：请求被夹在
///   `[base_unit, per_alloc_ceiling]` 之间，临近耗尽时还可能被降级；调用方必须容忍容量多于或少于请求；
/// - 配额耗尽时返回 `ResourceLimit { kind: Memory }`，溢写工厂据此回落到磁盘。
#[derive(Debug)]
pub struct MemoryFactory {
    accountant: Arc<ResourceAccountant>,
    live: AtomicUsize,
}

impl MemoryFactory {
    /// 基于共享记账器创建工厂。
    pub fn new(accountant: Arc<ResourceAccountant>) -> Arc<Self> {
        Arc::new(Self {
            accountant,
            live: AtomicUsize::new(0),
        })
    }

    /// 所用的记账器。
    pub fn accountant(&self) -> &Arc<ResourceAccountant> {
        &self.accountant
    }

    /// 尚未释放的缓冲数量。
    pub fn live_buffers(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// 申请授权并分配与授权等长的缓冲。
    pub fn get_buffer(self: &Arc<Self>, capacity: usize) -> Result<MemoryBuffer> {
        let granted = match self.accountant.register(capacity) {
            Grant::Granted(amount) => amount,
            Grant::Exhausted => {
                return Err(SpoolError::resource_limit(ResourceKind::Memory, capacity));
            }
        };
        self.live.fetch_add(1, Ordering::Relaxed);
        let buffer = MemoryBuffer {
            id: next_buffer_id(),
            cursor: Cursor::default(),
            data: Some(BytesMut::zeroed(granted)),
            factory: Arc::clone(self),
        };
        trace!(buffer.id = buffer.id, requested = capacity, granted, "memory buffer allocated");
        Ok(buffer)
    }

    /// 回收缓冲存储：按数组实际长度归还授权并丢弃数组。
    fn free_buffer(&self, data: BytesMut) {
        self.accountant.unregister(data.len());
        self.live.fetch_sub(1, Ordering::Relaxed);
        drop(data);
    }
}

/// 以定长 `BytesMut` 为后端的缓冲。
///
/// - 容量即数组长度，写满后 `write` 返回 0，由上层（分段缓冲）追加新分段；
/// - 克隆时复制 `[0, writer_index)` 为不可变 `Bytes`，源的后续写入对克隆不可见。
#[derive(Debug)]
pub struct MemoryBuffer {
    id: u64,
    cursor: Cursor,
    data: Option<BytesMut>,
    factory: Arc<MemoryFactory>,
}

impl MemoryBuffer {
    fn data(&self) -> Result<&BytesMut> {
        self.data.as_ref().ok_or(SpoolError::Closed { id: self.id })
    }

    fn data_mut(&mut self) -> Result<&mut BytesMut> {
        self.data.as_mut().ok_or(SpoolError::Closed { id: self.id })
    }

    fn release(&mut self) {
        if let Some(data) = self.data.take() {
            self.cursor.reset();
            self.factory.free_buffer(data);
        }
    }
}

impl Buffer for MemoryBuffer {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> BufferKind {
        BufferKind::Memory
    }

    fn is_closed(&self) -> bool {
        self.data.is_none()
    }

    fn reader_index(&self) -> Result<usize> {
        self.data()?;
        Ok(self.cursor.reader())
    }

    fn writer_index(&self) -> Result<usize> {
        self.data()?;
        Ok(self.cursor.writer())
    }

    fn capacity(&self) -> Result<usize> {
        Ok(self.data()?.len())
    }

    fn write(&mut self, src: &[u8]) -> Result<usize> {
        let writer = self.cursor.writer();
        let data = self.data_mut()?;
        let len = src.len().min(data.len() - writer);
        data[writer..writer + len].copy_from_slice(&src[..len]);
        self.cursor.advance_writer(len);
        Ok(len)
    }

    fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        let reader = self.cursor.reader();
        let len = dst.len().min(self.cursor.readable_bytes());
        let data = self.data()?;
        dst[..len].copy_from_slice(&data[reader..reader + len]);
        self.cursor.advance_reader(len);
        Ok(len)
    }

    fn transfer_to(&mut self, sink: &mut dyn Write, max_count: usize) -> Result<usize> {
        let reader = self.cursor.reader();
        let len = max_count.min(self.cursor.readable_bytes());
        let data = self.data()?;
        if len == 0 {
            return Ok(0);
        }
        sink.write_all(&data[reader..reader + len])
            .map_err(|err| SpoolError::io("memory buffer transfer", err))?;
        self.cursor.advance_reader(len);
        Ok(len)
    }

    fn rewind(&mut self) -> Result<()> {
        self.data()?;
        self.cursor.rewind();
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.release();
        Ok(())
    }

    fn clone_buffer(&self) -> Result<ReadOnlyBuffer> {
        let data = self.data()?;
        let snapshot = Bytes::copy_from_slice(&data[..self.cursor.writer()]);
        Ok(ReadOnlyBuffer::from_bytes(BufferKind::Memory, snapshot))
    }
}

impl Drop for MemoryBuffer {
    fn drop(&mut self) {
        self.release();
    }
}
