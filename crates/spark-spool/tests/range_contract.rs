//! `range_contract` 集成测试：区间缓冲在乱序与并发写入下的行为。
//!
//! # 测试目标（Why）
//! - 多路写者各自负责消息的一段，写入顺序不可预测；区间缓冲必须在不加外部锁的前提下接受并发 `put_range`；
//! - 存在空洞时读取不检测、不崩溃，只返回从键 0 起可连续到达的数据；
//! - 写入中途配额耗尽时，已接受的前缀仍计入写游标，`reader <= writer` 始终成立。

use std::sync::Arc;
use std::thread;

use spark_spool::{
    Buffer, DiskFactory, MemoryFactory, RangeBuffer, ResourceAccountant, ResourceKind,
    SpilloverFactory,
};

fn spillover(dir: &std::path::Path, memory_total: u64) -> Arc<SpilloverFactory> {
    let memory = MemoryFactory::new(Arc::new(ResourceAccountant::new(
        ResourceKind::Memory,
        memory_total,
        16,
        128,
    )));
    let disk = DiskFactory::new(
        dir,
        "range",
        Arc::new(ResourceAccountant::new(ResourceKind::Disk, 1 << 22, 1, 128)),
    )
    .expect("创建磁盘工厂");
    Arc::new(SpilloverFactory::new(memory, disk))
}

/// 键 0 缺失时读取 0 字节；补上键 0 后，顺序读取跨越“空洞”直接跳到下一个键。
#[test]
fn sparse_keys_do_not_crash_and_read_from_key_zero() {
    let dir = tempfile::tempdir().expect("临时目录");
    let mut buffer = RangeBuffer::new(spillover(dir.path(), 1 << 20), 32);
    buffer.put_range(1000, b"far away").expect("写入区间 1000");
    let mut out = [0u8; 32];
    assert_eq!(buffer.read(&mut out).expect("读取"), 0, "缺少键 0 时不产出数据");

    buffer.put_range(0, b"head").expect("写入区间 0");
    assert_eq!(buffer.range_keys(), vec![0, 1000]);
    let read = buffer.read(&mut out).expect("读取");
    assert_eq!(&out[..read], b"headfar away", "空洞不被检测，读取直接衔接下一个键");
    assert_eq!(buffer.reader_index().expect("读游标"), read);
}

/// 同一区间键的多次写入按调用顺序追加。
#[test]
fn repeated_puts_append_within_a_range() {
    let dir = tempfile::tempdir().expect("临时目录");
    let mut buffer = RangeBuffer::new(spillover(dir.path(), 1 << 20), 8);
    buffer.put_range(0, b"hello ").expect("首次写入");
    buffer.put_range(0, b"world").expect("追加写入");
    assert_eq!(buffer.range_keys(), vec![0]);
    let mut sink = Vec::new();
    assert_eq!(buffer.transfer_to(&mut sink, 64).expect("搬运"), 11);
    assert_eq!(sink, b"hello world");
}

/// 多个线程并发写入互不重叠的区间，最终顺序读取得到完整负载。
///
/// # 步骤说明（How）
/// 1. 负载切成 64 块，每块 200 字节，大于单次授权上限，迫使每个区间内部也发生分段；
/// 2. 八个线程按交错步长认领块并写入，内存配额刻意偏小，使部分分段溢写到磁盘；
/// 3. 汇合后校验写游标、区间键与读出的字节。
#[test]
fn concurrent_put_range_assembles_full_payload() {
    const CHUNK: usize = 200;
    const CHUNKS: usize = 64;
    const WRITERS: usize = 8;

    let dir = tempfile::tempdir().expect("临时目录");
    let factory = spillover(dir.path(), 4 * 1024);
    let buffer = Arc::new(RangeBuffer::new(Arc::clone(&factory), 64));
    let payload: Arc<Vec<u8>> = Arc::new((0..CHUNK * CHUNKS).map(|i| (i % 251) as u8).collect());

    let writers: Vec<_> = (0..WRITERS)
        .map(|writer| {
            let buffer = Arc::clone(&buffer);
            let payload = Arc::clone(&payload);
            thread::spawn(move || {
                for chunk in (writer..CHUNKS).step_by(WRITERS).rev() {
                    let start = chunk * CHUNK;
                    let written = buffer
                        .put_range(start as u64, &payload[start..start + CHUNK])
                        .expect("并发写入区间");
                    assert_eq!(written, CHUNK);
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().expect("写线程不应 panic");
    }
    buffer.mark_complete();

    let mut buffer = Arc::try_unwrap(buffer).expect("写线程结束后应独占区间缓冲");
    assert!(buffer.is_complete());
    assert_eq!(buffer.range_keys().len(), CHUNKS);
    assert_eq!(buffer.writer_index().expect("写游标"), CHUNK * CHUNKS);

    let mut out = vec![0u8; CHUNK * CHUNKS];
    assert_eq!(buffer.read(&mut out).expect("读取"), CHUNK * CHUNKS);
    assert_eq!(out, *payload);
    assert!(factory.disk().live_buffers() > 0, "内存配额偏小时应有分段溢写到磁盘");

    buffer.clear().expect("释放");
    assert_eq!(factory.memory().accountant().remaining(), 4 * 1024);
    assert_eq!(factory.disk().accountant().remaining(), 1 << 22);
    assert_eq!(factory.memory().live_buffers() + factory.disk().live_buffers(), 0);
}

/// 快照按键升序拼接各区间，键 0 缺失时快照为空。
#[test]
fn snapshot_follows_key_order() {
    let dir = tempfile::tempdir().expect("临时目录");
    let buffer = RangeBuffer::new(spillover(dir.path(), 1 << 20), 16);
    buffer.put_range(3, b"def").expect("写入区间 3");
    assert_eq!(buffer.clone_buffer().expect("快照").writer_index().expect("长度"), 0);

    buffer.put_range(0, b"abc").expect("写入区间 0");
    let mut snapshot = buffer.clone_buffer().expect("快照");
    let mut out = [0u8; 8];
    let read = snapshot.read(&mut out).expect("读取快照");
    assert_eq!(&out[..read], b"abcdef");
}

/// 磁盘配额在一次 `put_range` 中途耗尽：错误向上传播，但已接受的前缀计入写游标，
/// 随后的顺序读取不会让读游标越过写游标。
#[test]
fn failed_put_range_still_accounts_accepted_prefix() {
    let dir = tempfile::tempdir().expect("临时目录");
    let memory = MemoryFactory::new(Arc::new(ResourceAccountant::new(
        ResourceKind::Memory,
        0,
        16,
        128,
    )));
    let disk = DiskFactory::new(
        dir.path(),
        "range-limit",
        Arc::new(ResourceAccountant::new(ResourceKind::Disk, 50, 1, 128)),
    )
    .expect("创建磁盘工厂");
    let mut buffer = RangeBuffer::new(Arc::new(SpilloverFactory::new(memory, disk)), 32);

    let err = buffer.put_range(0, &[7u8; 100]).expect_err("磁盘配额耗尽时写入应失败");
    assert!(err.is_disk_limit(), "错误应为磁盘配额耗尽：{err}");
    assert_eq!(buffer.writer_index().expect("写游标"), 50, "失败前已接受的字节应计入写游标");

    let mut out = [0u8; 100];
    let read = buffer.read(&mut out).expect("读取");
    assert_eq!(read, 50);
    assert!(out[..read].iter().all(|byte| *byte == 7));
    let reader = buffer.reader_index().expect("读游标");
    let writer = buffer.writer_index().expect("写游标");
    assert!(reader <= writer, "读游标 {reader} 不得越过写游标 {writer}");
    assert_eq!(buffer.readable_bytes().expect("可读字节"), 0);
}
