#![no_main]

use std::sync::Arc;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use spark_spool::{
    Buffer, DiskFactory, MemoryFactory, ResourceAccountant, ResourceKind, SegmentedBuffer,
    SpilloverFactory,
};

/// Fuzz 输入：一组配额参数加一串缓冲操作。
///
/// - **Why**：分段缓冲的读写游标跨越内存与磁盘分段，`rewind` 之后的追加写与跨分段读取最容易出现错位；
///   以 `Vec<u8>` 作为参照模型，任何字节不一致都会立即暴露。
/// - **How**：内存配额取得很小，使溢写在短序列内就会发生；磁盘配额足够大，写入只受单次授权上限影响。
/// - **What**：每一步之后断言写游标等于模型长度、读游标不超过写游标，读出的字节与模型对应位置一致。
#[derive(Debug, Arbitrary)]
struct SegmentedCase {
    memory_total: u8,
    initial_capacity: u8,
    ops: Vec<BufferOp>,
}

#[derive(Debug, Arbitrary)]
enum BufferOp {
    Write(Vec<u8>),
    Read(u8),
    Transfer(u8),
    Rewind,
    Snapshot,
}

fuzz_target!(|case: SegmentedCase| {
    let Ok(dir) = tempfile::tempdir() else {
        return;
    };
    let memory = MemoryFactory::new(Arc::new(ResourceAccountant::new(
        ResourceKind::Memory,
        u64::from(case.memory_total),
        8,
        32,
    )));
    let Ok(disk) = DiskFactory::new(
        dir.path(),
        "fuzz",
        Arc::new(ResourceAccountant::new(ResourceKind::Disk, 1 << 24, 1, 32)),
    ) else {
        return;
    };
    let factory = Arc::new(SpilloverFactory::new(memory, disk));
    let mut buffer = SegmentedBuffer::new(factory, usize::from(case.initial_capacity));
    let mut model: Vec<u8> = Vec::new();
    let mut reader = 0usize;

    for op in case.ops {
        match op {
            BufferOp::Write(bytes) => {
                let accepted = buffer.write(&bytes).expect("磁盘配额充足时写入不应失败");
                assert_eq!(accepted, bytes.len());
                model.extend_from_slice(&bytes);
            }
            BufferOp::Read(len) => {
                let mut out = vec![0u8; usize::from(len)];
                let read = buffer.read(&mut out).expect("读取");
                assert_eq!(&out[..read], &model[reader..reader + read]);
                assert_eq!(read, usize::from(len).min(model.len() - reader));
                reader += read;
            }
            BufferOp::Transfer(len) => {
                let mut sink = Vec::new();
                let moved = buffer.transfer_to(&mut sink, usize::from(len)).expect("搬运");
                assert_eq!(sink.len(), moved);
                assert_eq!(&sink[..], &model[reader..reader + moved]);
                reader += moved;
            }
            BufferOp::Rewind => {
                buffer.rewind().expect("回卷");
                reader = 0;
            }
            BufferOp::Snapshot => {
                let mut snapshot = buffer.clone_buffer().expect("快照");
                let mut out = vec![0u8; model.len()];
                let read = snapshot.read(&mut out).expect("读取快照");
                assert_eq!(&out[..read], &model[..]);
                snapshot.free();
            }
        }
        assert_eq!(buffer.writer_index().expect("写游标"), model.len());
        assert_eq!(buffer.reader_index().expect("读游标"), reader);
    }

    buffer.clear().expect("释放");
});
