//! 区间缓冲：按偏移（区间键）索引的分段缓冲集合，支持多个写者并发写入互不重叠的区间。
//!
//! # 设计总览（Why）
//! - 分块并行接收（例如多路数据通道各自负责消息的一段）时，写入天然乱序；若共用一个写游标，
//!   写者之间会在同一把锁上排队。以区间键为并发单元，不同偏移可由不同线程同时写入；
//! - 顺序读取从区间键 0 开始，读尽一个区间后跳到严格更大的下一个键，与分段缓冲的跨分段读取同构，只是高了一层。
//!
//! # 契约说明（What）
//! - 所有写入必须经由 [`RangeBuffer::put_range`]；[`Buffer::write`] 一律返回 `Unsupported`；
//! - 区间一经插入，在正常运行期间不会被移除；
//! - 读取前调用方必须保证从 0 到目标位置的所有区间都已写满。本结构不检测空洞：遇到缺失的键 0 时读出 0 字节，
//!   某区间内容短于下一个键的偏移时直接跳到下一个键。这是调用方的责任而非缺陷，
//!   依赖“读到 N 字节即 N 字节完整正确数据”的调用方需先写完全部区间；
//! - 写者可调用 [`RangeBuffer::mark_complete`] 声明写入结束，读取路径不依赖该标记。
//!
//! # 并发（How）
//! - 一把 `parking_lot::Mutex` 保护区间表，只在定位或创建区间时持有；
//! - 每个区间的分段缓冲各自由一把锁保护，真正的写入在释放表锁之后进行。

use std::collections::BTreeMap;
use std::io::Write;
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::buffer::{Buffer, BufferKind, ReadOnlyBuffer, UNBOUNDED_CAPACITY, next_buffer_id};
use crate::error::{Result, SpoolError};
use crate::segmented::SegmentedBuffer;
use crate::spillover::SpilloverFactory;

/// 未指定容量时，每个区间首个分段的默认大小。
pub const DEFAULT_RANGE_CAPACITY: usize = 1024;

type RangeSlot = Arc<Mutex<SegmentedBuffer>>;

#[derive(Debug, Default)]
struct ReadState {
    key: u64,
    reader_index: usize,
}

/// 按区间键索引的并发写入缓冲。
pub struct RangeBuffer {
    id: u64,
    factory: Arc<SpilloverFactory>,
    range_capacity: usize,
    ranges: Mutex<BTreeMap<u64, RangeSlot>>,
    read_state: Mutex<ReadState>,
    writer_index: AtomicUsize,
    closed: AtomicBool,
    complete: AtomicBool,
}

impl RangeBuffer {
    /// 创建空区间缓冲；`range_capacity` 为每个区间首个分段的大小，0 表示使用默认值。
    pub fn new(factory: Arc<SpilloverFactory>, range_capacity: usize) -> Self {
        let range_capacity = if range_capacity == 0 {
            DEFAULT_RANGE_CAPACITY
        } else {
            range_capacity
        };
        Self {
            id: next_buffer_id(),
            factory,
            range_capacity,
            ranges: Mutex::new(BTreeMap::new()),
            read_state: Mutex::new(ReadState::default()),
            writer_index: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            complete: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(SpoolError::Closed { id: self.id })
        } else {
            Ok(())
        }
    }

    /// 在区间键 `offset` 下写入 `src`，返回实际写入字节数。
    ///
    /// # 执行步骤（How）
    /// 1. 持表锁查找区间，不存在时以溢写工厂为后端创建新的分段缓冲；
    /// 2. 释放表锁后锁定该区间并写入，不同区间的写入互不阻塞；
    /// 3. 持区间锁按该区间写游标的实际增量推进整体写游标，写入中途失败时已接受的前缀同样计入。
    pub fn put_range(&self, offset: u64, src: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        let slot = {
            let mut ranges = self.ranges.lock();
            Arc::clone(ranges.entry(offset).or_insert_with(|| {
                debug!(buffer.id = self.id, range.key = offset, "range created");
                Arc::new(Mutex::new(SegmentedBuffer::new(
                    Arc::clone(&self.factory),
                    self.range_capacity,
                )))
            }))
        };
        let mut range = slot.lock();
        let before = range.writer_index()?;
        let outcome = range.write(src);
        // 失败时区间可能已接受部分字节，写游标必须同样计入，且在释放区间锁之前推进。
        let after = range.writer_index().unwrap_or(before);
        self.writer_index.fetch_add(after - before, Ordering::AcqRel);
        outcome
    }

    /// 已存在的区间键，升序排列。
    pub fn range_keys(&self) -> Vec<u64> {
        self.ranges.lock().keys().copied().collect()
    }

    /// 写者声明全部区间已写完。
    pub fn mark_complete(&self) {
        self.complete.store(true, Ordering::Release);
    }

    /// 写者是否已声明写入结束。
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    fn slot(&self, key: u64) -> Option<RangeSlot> {
        self.ranges.lock().get(&key).cloned()
    }

    fn next_key(&self, key: u64) -> Option<u64> {
        self.ranges
            .lock()
            .range((Excluded(key), Unbounded))
            .next()
            .map(|(next, _)| *next)
    }

    /// 从上次读到的区间开始逐区间读取，`step` 负责在单个区间内推进。
    fn traverse<F>(&self, want: usize, mut step: F) -> Result<usize>
    where
        F: FnMut(&mut SegmentedBuffer, usize) -> Result<usize>,
    {
        self.ensure_open()?;
        let mut state = self.read_state.lock();
        let mut total = 0;
        let mut outcome = Ok(());
        while total < want {
            let Some(slot) = self.slot(state.key) else {
                break;
            };
            match step(&mut slot.lock(), total) {
                Ok(count) => total += count,
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
            if total == want {
                break;
            }
            match self.next_key(state.key) {
                Some(next) => state.key = next,
                None => break,
            }
        }
        state.reader_index += total;
        outcome.map(|()| total)
    }
}

impl Buffer for RangeBuffer {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> BufferKind {
        BufferKind::Range
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn reader_index(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.read_state.lock().reader_index)
    }

    fn writer_index(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.writer_index.load(Ordering::Acquire))
    }

    fn capacity(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(UNBOUNDED_CAPACITY)
    }

    /// 区间缓冲不支持顺序写入，请使用 [`RangeBuffer::put_range`]。
    fn write(&mut self, _src: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        Err(SpoolError::Unsupported {
            operation: "RangeBuffer::write",
        })
    }

    fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        let want = dst.len();
        self.traverse(want, |range, offset| range.read(&mut dst[offset..]))
    }

    fn transfer_to(&mut self, sink: &mut dyn Write, max_count: usize) -> Result<usize> {
        self.traverse(max_count, |range, moved| {
            range.transfer_to(sink, max_count - moved)
        })
    }

    fn rewind(&mut self) -> Result<()> {
        self.ensure_open()?;
        let slots: Vec<RangeSlot> = self.ranges.lock().values().cloned().collect();
        for slot in slots {
            slot.lock().rewind()?;
        }
        *self.read_state.lock() = ReadState::default();
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let ranges = std::mem::take(&mut *self.ranges.lock());
        for (key, slot) in ranges {
            if let Err(err) = slot.lock().clear() {
                warn!(buffer.id = self.id, range.key = key, error = %err, "failed to release range");
            }
        }
        *self.read_state.lock() = ReadState::default();
        self.writer_index.store(0, Ordering::Release);
        Ok(())
    }

    /// 按键升序克隆各区间，拼成一条只读链。
    ///
    /// 与顺序读取保持一致：键 0 不存在时克隆为空。
    fn clone_buffer(&self) -> Result<ReadOnlyBuffer> {
        self.ensure_open()?;
        let slots: Vec<RangeSlot> = {
            let ranges = self.ranges.lock();
            if ranges.contains_key(&0) {
                ranges.values().cloned().collect()
            } else {
                Vec::new()
            }
        };
        let segments = slots
            .iter()
            .map(|slot| slot.lock().clone_buffer())
            .collect::<Result<Vec<_>>>()?;
        Ok(ReadOnlyBuffer::from_chain(BufferKind::Range, segments))
    }
}

impl std::fmt::Debug for RangeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeBuffer")
            .field("id", &self.id)
            .field("ranges", &self.ranges.lock().len())
            .field("writer_index", &self.writer_index.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
