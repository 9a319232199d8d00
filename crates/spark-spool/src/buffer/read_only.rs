//! 只读快照视图：内存快照、共享句柄的文件快照，以及由二者拼成的链。

use std::fs::File;
use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;

use crate::buffer::{BufferKind, next_buffer_id, positioned};
use crate::error::{Result, SpoolError};

const TRANSFER_CHUNK: usize = 8 * 1024;

/// `ReadOnlyBuffer` 是已写入内容的只读快照，用于把同一份负载扇出给多个独立读者。
///
/// # 设计动机（Why）
/// - 邮件投递常需把同一封消息并发发往多个目标；若多个读者共享源缓冲的读游标，彼此会互相干扰；
/// - 克隆在创建时深拷贝游标状态（组合缓冲则逐段克隆出一条平行链），之后各读者互不影响，源的后续写入也不可见。
///
/// # 契约说明（What）
/// - 类型层面不提供任何写入方法，误写在编译期即被拒绝；
/// - 内存分段的快照持有一份复制出的 `Bytes`，磁盘分段的快照共享文件句柄但只读取克隆时刻写游标之前的区间；
/// - 释放快照只丢弃视图本身，绝不归还源缓冲的资源授权，也不删除源的临时文件。
///
/// # 风险提示（Trade-offs）
/// - 内存快照的复制不计入内存配额；大负载通常已溢写到磁盘，此时快照零复制；
/// - 源缓冲释放后其临时文件会被删除，在类 Unix 平台上已打开的句柄仍可读，其它平台上删除可能延后失败并仅记录告警。
#[derive(Debug)]
pub struct ReadOnlyBuffer {
    id: u64,
    source: BufferKind,
    view: Option<View>,
}

#[derive(Debug)]
enum View {
    Bytes {
        bytes: Bytes,
        reader: usize,
    },
    File {
        file: Arc<File>,
        len: usize,
        reader: usize,
    },
    Chain {
        segments: Vec<ReadOnlyBuffer>,
        current: usize,
    },
}

impl ReadOnlyBuffer {
    pub(crate) fn from_bytes(source: BufferKind, bytes: Bytes) -> Self {
        Self::with_view(source, View::Bytes { bytes, reader: 0 })
    }

    pub(crate) fn from_file(file: Arc<File>, len: usize) -> Self {
        Self::with_view(
            BufferKind::Disk,
            View::File {
                file,
                len,
                reader: 0,
            },
        )
    }

    pub(crate) fn from_chain(source: BufferKind, segments: Vec<ReadOnlyBuffer>) -> Self {
        Self::with_view(
            source,
            View::Chain {
                segments,
                current: 0,
            },
        )
    }

    fn with_view(source: BufferKind, view: View) -> Self {
        Self {
            id: next_buffer_id(),
            source,
            view: Some(view),
        }
    }

    fn view(&self) -> Result<&View> {
        self.view.as_ref().ok_or(SpoolError::Closed { id: self.id })
    }

    fn view_mut(&mut self) -> Result<&mut View> {
        self.view.as_mut().ok_or(SpoolError::Closed { id: self.id })
    }

    /// 诊断用序号。
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 恒为 [`BufferKind::ReadOnly`]。
    pub fn kind(&self) -> BufferKind {
        BufferKind::ReadOnly
    }

    /// 被克隆的源缓冲形态。
    pub fn source_kind(&self) -> BufferKind {
        self.source
    }

    /// 是否已释放。
    pub fn is_closed(&self) -> bool {
        self.view.is_none()
    }

    /// 读游标位置。
    pub fn reader_index(&self) -> Result<usize> {
        match self.view()? {
            View::Bytes { reader, .. } | View::File { reader, .. } => Ok(*reader),
            View::Chain { segments, .. } => segments
                .iter()
                .try_fold(0, |acc, segment| Ok(acc + segment.reader_index()?)),
        }
    }

    /// 快照长度，即克隆时刻源的写游标。
    pub fn writer_index(&self) -> Result<usize> {
        match self.view()? {
            View::Bytes { bytes, .. } => Ok(bytes.len()),
            View::File { len, .. } => Ok(*len),
            View::Chain { segments, .. } => segments
                .iter()
                .try_fold(0, |acc, segment| Ok(acc + segment.writer_index()?)),
        }
    }

    /// 是否仍有未读数据。
    pub fn readable(&self) -> Result<bool> {
        Ok(self.readable_bytes()? > 0)
    }

    /// 未读字节数。
    pub fn readable_bytes(&self) -> Result<usize> {
        Ok(self.writer_index()? - self.reader_index()?)
    }

    /// 读取到 `dst`，跨分段时按链顺序连续读取。
    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        match self.view_mut()? {
            View::Bytes { bytes, reader } => {
                let len = dst.len().min(bytes.len() - *reader);
                dst[..len].copy_from_slice(&bytes[*reader..*reader + len]);
                *reader += len;
                Ok(len)
            }
            View::File { file, len, reader } => {
                let count = dst.len().min(*len - *reader);
                if count > 0 {
                    positioned::read_exact_at(file, &mut dst[..count], *reader as u64)
                        .map_err(|err| SpoolError::io("read-only buffer read", err))?;
                    *reader += count;
                }
                Ok(count)
            }
            View::Chain { segments, current } => {
                let mut total = 0;
                while total < dst.len() && *current < segments.len() {
                    total += segments[*current].read(&mut dst[total..])?;
                    if total < dst.len() {
                        if *current + 1 < segments.len() {
                            *current += 1;
                        } else {
                            break;
                        }
                    }
                }
                Ok(total)
            }
        }
    }

    /// 将至多 `max_count` 字节搬运到外部输出。
    pub fn transfer_to(&mut self, sink: &mut dyn Write, max_count: usize) -> Result<usize> {
        match self.view_mut()? {
            View::Bytes { bytes, reader } => {
                let len = max_count.min(bytes.len() - *reader);
                if len > 0 {
                    sink.write_all(&bytes[*reader..*reader + len])
                        .map_err(|err| SpoolError::io("read-only buffer transfer", err))?;
                    *reader += len;
                }
                Ok(len)
            }
            View::File { file, len, reader } => {
                let total = max_count.min(*len - *reader);
                let mut chunk = [0u8; TRANSFER_CHUNK];
                let mut moved = 0;
                while moved < total {
                    let step = (total - moved).min(TRANSFER_CHUNK);
                    positioned::read_exact_at(file, &mut chunk[..step], *reader as u64)
                        .map_err(|err| SpoolError::io("read-only buffer transfer read", err))?;
                    sink.write_all(&chunk[..step])
                        .map_err(|err| SpoolError::io("read-only buffer transfer write", err))?;
                    *reader += step;
                    moved += step;
                }
                Ok(moved)
            }
            View::Chain { segments, current } => {
                let mut moved = 0;
                while moved < max_count && *current < segments.len() {
                    moved += segments[*current].transfer_to(sink, max_count - moved)?;
                    if moved < max_count {
                        if *current + 1 < segments.len() {
                            *current += 1;
                        } else {
                            break;
                        }
                    }
                }
                Ok(moved)
            }
        }
    }

    /// 读游标归零。
    pub fn rewind(&mut self) -> Result<()> {
        match self.view_mut()? {
            View::Bytes { reader, .. } | View::File { reader, .. } => *reader = 0,
            View::Chain { segments, current } => {
                for segment in segments.iter_mut() {
                    segment.rewind()?;
                }
                *current = 0;
            }
        }
        Ok(())
    }

    /// 再克隆出一份读游标归零的独立快照。
    pub fn clone_buffer(&self) -> Result<ReadOnlyBuffer> {
        let view = match self.view()? {
            View::Bytes { bytes, .. } => View::Bytes {
                bytes: bytes.clone(),
                reader: 0,
            },
            View::File { file, len, .. } => View::File {
                file: Arc::clone(file),
                len: *len,
                reader: 0,
            },
            View::Chain { segments, .. } => View::Chain {
                segments: segments
                    .iter()
                    .map(ReadOnlyBuffer::clone_buffer)
                    .collect::<Result<Vec<_>>>()?,
                current: 0,
            },
        };
        Ok(Self::with_view(self.source, view))
    }

    /// 幂等释放快照视图，不影响源缓冲。
    pub fn clear(&mut self) {
        self.view = None;
    }

    /// 消费式释放。
    pub fn free(mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(parts: &[&'static [u8]]) -> ReadOnlyBuffer {
        let segments = parts
            .iter()
            .map(|part| ReadOnlyBuffer::from_bytes(BufferKind::Memory, Bytes::from_static(part)))
            .collect();
        ReadOnlyBuffer::from_chain(BufferKind::Segmented, segments)
    }

    #[test]
    fn chain_reads_across_segments_in_order() {
        let mut snapshot = chain(&[b"abc", b"", b"defg"]);
        assert_eq!(snapshot.writer_index().expect("长度"), 7);
        let mut out = [0u8; 5];
        assert_eq!(snapshot.read(&mut out).expect("读取"), 5);
        assert_eq!(&out, b"abcde");
        assert_eq!(snapshot.reader_index().expect("读游标"), 5);
        let mut rest = [0u8; 8];
        assert_eq!(snapshot.read(&mut rest).expect("读取剩余"), 2);
        assert_eq!(&rest[..2], b"fg");
    }

    #[test]
    fn clones_have_independent_cursors() {
        let mut first = chain(&[b"hello", b" world"]);
        let mut out = [0u8; 3];
        first.read(&mut out).expect("读取");
        let mut second = first.clone_buffer().expect("克隆");
        assert_eq!(second.reader_index().expect("读游标"), 0, "克隆应从头开始");
        let mut sink = Vec::new();
        assert_eq!(second.transfer_to(&mut sink, usize::MAX).expect("搬运"), 11);
        assert_eq!(sink, b"hello world");
        assert_eq!(first.reader_index().expect("原读游标"), 3);
    }

    #[test]
    fn cleared_snapshot_rejects_access() {
        let mut snapshot = chain(&[b"x"]);
        snapshot.clear();
        snapshot.clear();
        assert!(snapshot.is_closed());
        assert!(matches!(snapshot.read(&mut [0u8; 1]), Err(SpoolError::Closed { .. })));
        assert!(matches!(snapshot.rewind(), Err(SpoolError::Closed { .. })));
    }
}
