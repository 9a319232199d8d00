//! 分段缓冲：把溢写工厂分配的多个物理缓冲串成一条链，对外呈现为容量几乎无限的单一逻辑缓冲。
//!
//! # 设计总览（Why）
//! - 单个物理缓冲受单次授权上限约束，邮件负载却可能远超该上限；分段缓冲在容量用尽时透明地追加新分段，
//!   新分段可能来自内存也可能来自磁盘，调用方无感；
//! - 读取跨分段边界连续进行，读尽的分段不会被提前释放，整条链直到自身 `clear` 才整体归还。
//!
//! # 实现要点（How）
//! - 链以 `Vec<Box<dyn Buffer>>` 顺序保存，读写各自维护“当前分段”下标，遍历用显式循环而非递归，
//!   栈深度与分段数量无关；
//! - 写入从当前写分段开始填充，写满后依次尝试后续分段，链尾仍不足时按剩余长度申请新分段；
//! - `rewind` 把读写两个下标都拨回链首并让每个分段的读游标归零，不释放任何分段；
//!   之后的写入会顺链前进到仍有空间的分段，因此逻辑上仍是追加。

use std::io::Write;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::buffer::{Buffer, BufferKind, ReadOnlyBuffer, UNBOUNDED_CAPACITY, next_buffer_id};
use crate::error::{Result, SpoolError};
use crate::spillover::SpilloverFactory;

/// 由多个物理分段串联而成的逻辑缓冲。
///
/// # 契约说明（What）
/// - 独占链上所有分段，`clear` 时逐个释放，单个分段释放失败只记录告警，不影响其余分段；
/// - 首个分段在第一次写入时按 `initial_capacity` 分配，之后的分段按“剩余未写长度”分配；
/// - 分配失败（磁盘配额也耗尽）时返回错误，此前已接受的字节保留在链中，写游标如实反映已接受量。
pub struct SegmentedBuffer {
    id: u64,
    factory: Arc<SpilloverFactory>,
    initial_capacity: usize,
    segments: Vec<Box<dyn Buffer>>,
    write_node: usize,
    read_node: usize,
    reader_index: usize,
    writer_index: usize,
    closed: bool,
}

impl SegmentedBuffer {
    /// 创建空链，首个分段延迟到第一次写入时分配。
    pub fn new(factory: Arc<SpilloverFactory>, initial_capacity: usize) -> Self {
        Self {
            id: next_buffer_id(),
            factory,
            initial_capacity,
            segments: Vec::new(),
            write_node: 0,
            read_node: 0,
            reader_index: 0,
            writer_index: 0,
            closed: false,
        }
    }

    /// 当前链上的分段数量。
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// 各分段的存储形态，按链顺序排列。
    pub fn segment_kinds(&self) -> Vec<BufferKind> {
        self.segments.iter().map(|segment| segment.kind()).collect()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(SpoolError::Closed { id: self.id })
        } else {
            Ok(())
        }
    }

    /// 申请新分段并立即写入 `src`，成功后才挂到链尾。
    ///
    /// 新分段一字节都未接受时释放它并返回错误，避免链上残留空分段。
    fn grow(&mut self, src: &[u8]) -> Result<usize> {
        let capacity = if self.segments.is_empty() && self.initial_capacity > 0 {
            self.initial_capacity
        } else {
            src.len()
        };
        let mut segment = self.factory.get_buffer(capacity)?;
        let accepted = match segment.write(src) {
            Ok(0) => Err(SpoolError::InvalidState {
                detail: format!("fresh segment #{} accepted no bytes", segment.id()),
            }),
            other => other,
        };
        match accepted {
            Ok(accepted) => {
                debug!(
                    buffer.id = self.id,
                    segment.id = segment.id(),
                    segment.kind = ?segment.kind(),
                    accepted,
                    "segment appended"
                );
                self.segments.push(segment);
                self.write_node = self.segments.len() - 1;
                Ok(accepted)
            }
            Err(err) => {
                if let Err(clear_err) = segment.clear() {
                    warn!(segment.id = segment.id(), error = %clear_err, "failed to release rejected segment");
                }
                Err(err)
            }
        }
    }
}

impl Buffer for SegmentedBuffer {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> BufferKind {
        BufferKind::Segmented
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn reader_index(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.reader_index)
    }

    fn writer_index(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.writer_index)
    }

    fn capacity(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(UNBOUNDED_CAPACITY)
    }

    fn write(&mut self, src: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        let mut written = 0;
        while written < src.len() {
            let progress = if self.write_node < self.segments.len() {
                self.segments[self.write_node].write(&src[written..])
            } else {
                Ok(0)
            };
            let accepted = match progress {
                Ok(accepted) => accepted,
                Err(err) => {
                    self.writer_index += written;
                    return Err(err);
                }
            };
            written += accepted;
            if written == src.len() {
                break;
            }
            if self.write_node + 1 < self.segments.len() {
                self.write_node += 1;
                continue;
            }
            match self.grow(&src[written..]) {
                Ok(accepted) => written += accepted,
                Err(err) => {
                    self.writer_index += written;
                    return Err(err);
                }
            }
        }
        self.writer_index += written;
        Ok(written)
    }

    fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        let mut total = 0;
        while total < dst.len() && self.read_node < self.segments.len() {
            total += self.segments[self.read_node].read(&mut dst[total..])?;
            if total < dst.len() {
                if self.read_node + 1 < self.segments.len() {
                    self.read_node += 1;
                } else {
                    break;
                }
            }
        }
        self.reader_index += total;
        Ok(total)
    }

    fn transfer_to(&mut self, sink: &mut dyn Write, max_count: usize) -> Result<usize> {
        self.ensure_open()?;
        let mut moved = 0;
        while moved < max_count && self.read_node < self.segments.len() {
            let step = self.segments[self.read_node].transfer_to(sink, max_count - moved);
            match step {
                Ok(count) => moved += count,
                Err(err) => {
                    self.reader_index += moved;
                    return Err(err);
                }
            }
            if moved < max_count {
                if self.read_node + 1 < self.segments.len() {
                    self.read_node += 1;
                } else {
                    break;
                }
            }
        }
        self.reader_index += moved;
        Ok(moved)
    }

    fn rewind(&mut self) -> Result<()> {
        self.ensure_open()?;
        for segment in self.segments.iter_mut() {
            segment.rewind()?;
        }
        self.read_node = 0;
        self.write_node = 0;
        self.reader_index = 0;
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        for mut segment in self.segments.drain(..) {
            if let Err(err) = segment.clear() {
                warn!(buffer.id = self.id, segment.id = segment.id(), error = %err, "failed to release segment");
            }
        }
        self.read_node = 0;
        self.write_node = 0;
        self.reader_index = 0;
        self.writer_index = 0;
        self.closed = true;
        Ok(())
    }

    fn clone_buffer(&self) -> Result<ReadOnlyBuffer> {
        self.ensure_open()?;
        let segments = self
            .segments
            .iter()
            .map(|segment| segment.clone_buffer())
            .collect::<Result<Vec<_>>>()?;
        Ok(ReadOnlyBuffer::from_chain(BufferKind::Segmented, segments))
    }
}

impl std::fmt::Debug for SegmentedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentedBuffer")
            .field("id", &self.id)
            .field("segments", &self.segments.len())
            .field("reader_index", &self.reader_index)
            .field("writer_index", &self.writer_index)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accountant::{ResourceAccountant, ResourceKind};
    use crate::buffer::{DiskFactory, MemoryFactory};

    fn factory(dir: &std::path::Path, memory_total: u64) -> Arc<SpilloverFactory> {
        let memory = MemoryFactory::new(Arc::new(ResourceAccountant::new(
            ResourceKind::Memory,
            memory_total,
            16,
            32,
        )));
        let disk = DiskFactory::new(
            dir,
            "seg",
            Arc::new(ResourceAccountant::new(ResourceKind::Disk, 1 << 20, 1, 64)),
        )
        .expect("创建磁盘工厂");
        Arc::new(SpilloverFactory::new(memory, disk))
    }

    #[test]
    fn long_write_spans_multiple_segments() {
        let dir = tempfile::tempdir().expect("临时目录");
        let mut buffer = SegmentedBuffer::new(factory(dir.path(), 1024), 16);
        let payload: Vec<u8> = (0..100u8).collect();
        assert_eq!(buffer.write(&payload).expect("写入"), 100);
        assert!(buffer.segment_count() >= 2);
        let mut out = vec![0u8; 100];
        assert_eq!(buffer.read(&mut out).expect("读取"), 100);
        assert_eq!(out, payload);
    }

    #[test]
    fn segments_spill_to_disk_when_memory_runs_out() {
        let dir = tempfile::tempdir().expect("临时目录");
        let mut buffer = SegmentedBuffer::new(factory(dir.path(), 32), 32);
        buffer.write(&[1u8; 80]).expect("写入");
        assert_eq!(buffer.segment_kinds(), vec![BufferKind::Memory, BufferKind::Disk]);
    }

    #[test]
    fn rewind_keeps_segments_and_appends_after_existing_data() {
        let dir = tempfile::tempdir().expect("临时目录");
        let mut buffer = SegmentedBuffer::new(factory(dir.path(), 1024), 16);
        buffer.write(b"0123456789abcdefXYZ").expect("写入");
        let segments = buffer.segment_count();
        let mut head = [0u8; 4];
        buffer.read(&mut head).expect("读取");
        buffer.rewind().expect("回卷");
        assert_eq!(buffer.segment_count(), segments, "回卷不应释放分段");
        assert_eq!(buffer.writer_index().expect("写游标"), 19);
        buffer.write(b"!").expect("回卷后写入");
        let mut out = vec![0u8; 32];
        let read = buffer.read(&mut out).expect("重新读取");
        assert_eq!(&out[..read], b"0123456789abcdefXYZ!");
    }

    #[test]
    fn clear_releases_every_segment() {
        let dir = tempfile::tempdir().expect("临时目录");
        let factory = factory(dir.path(), 1024);
        let mut buffer = SegmentedBuffer::new(Arc::clone(&factory), 16);
        buffer.write(&[9u8; 70]).expect("写入");
        assert!(factory.memory().accountant().remaining() < 1024);
        buffer.clear().expect("释放");
        buffer.clear().expect("重复释放");
        assert_eq!(factory.memory().accountant().remaining(), 1024);
        assert_eq!(factory.memory().live_buffers(), 0);
        assert!(matches!(buffer.read(&mut [0u8; 1]), Err(SpoolError::Closed { .. })));
    }
}
