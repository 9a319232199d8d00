use std::sync::Arc;

use tracing::debug;

use crate::buffer::{Buffer, DiskBuffer, DiskFactory, MemoryFactory};
use crate::error::Result;

/// `SpilloverFactory`（“内存优先、磁盘兜底”工厂）是面向普通生产者的唯一分配策略。
///
/// # 设计动机（Why）
/// - 生产者只关心“给我一块能写的缓冲”，不应自行选择内存或磁盘；
/// - 内存配额耗尽时静默溢写到磁盘，内存占用因此有上界，而全局磁盘配额再为最坏情况兜底。
///
/// # 契约说明（What）
/// - `get_buffer` 先尝试内存工厂；仅当其返回内存配额耗尽时回落到磁盘工厂，其余错误原样传播；
/// - 返回 `Box<dyn Buffer>`，调用方可通过 [`Buffer::kind`] 观察最终落点。
#[derive(Clone, Debug)]
pub struct SpilloverFactory {
    memory: Arc<MemoryFactory>,
    disk: Arc<DiskFactory>,
}

impl SpilloverFactory {
    /// 组合内存与磁盘工厂。
    pub fn new(memory: Arc<MemoryFactory>, disk: Arc<DiskFactory>) -> Self {
        Self { memory, disk }
    }

    /// 内存工厂。
    pub fn memory(&self) -> &Arc<MemoryFactory> {
        &self.memory
    }

    /// 磁盘工厂。
    pub fn disk(&self) -> &Arc<DiskFactory> {
        &self.disk
    }

    /// 分配缓冲：内存优先，内存配额耗尽时溢写到磁盘。
    pub fn get_buffer(&self, capacity: usize) -> Result<Box<dyn Buffer>> {
        match self.memory.get_buffer(capacity) {
            Ok(buffer) => Ok(Box::new(buffer)),
            Err(err) if err.is_memory_limit() => {
                let buffer = self.disk.get_buffer()?;
                debug!(
                    buffer.id = buffer.id(),
                    requested = capacity,
                    "memory quota exhausted, spilling to disk"
                );
                Ok(Box::new(buffer))
            }
            Err(err) => Err(err),
        }
    }

    /// 直接分配磁盘缓冲，跳过内存尝试。
    pub fn get_disk_buffer(&self) -> Result<DiskBuffer> {
        self.disk.get_buffer()
    }
}
