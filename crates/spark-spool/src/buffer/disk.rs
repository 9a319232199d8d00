//! 磁盘缓冲：以临时文件为后端，按写入量增量申请磁盘授权，读写均为定位 I/O。

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tracing::{trace, warn};

use crate::accountant::{Grant, ResourceAccountant, ResourceKind};
use crate::buffer::{Buffer, BufferKind, Cursor, ReadOnlyBuffer, UNBOUNDED_CAPACITY, next_buffer_id};
use crate::error::{Result, SpoolError};

/// 单次搬运使用的栈上中转块大小。
const TRANSFER_CHUNK: usize = 8 * 1024;

/// 进程级临时文件序号：同一进程内多个工厂（乃至多个注册表）共用目录与前缀时文件名也不会重复。
static NEXT_FILE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// `DiskFactory` 在磁盘目录下创建临时文件作为缓冲后端。
///
/// # 设计动机（Why）
/// - 内存配额耗尽后，负载仍需继续累积，临时文件提供“几乎无限”的容量；
/// - 与内存不同，打开文件时不申请授权：磁盘占用随写入增长，因此每次 `write` 按写入量增量授权，
///   释放时按实际写入量归还。
///
/// # 契约说明（What）
/// - 文件名为 `{pid}-{prefix}-{sequence}.tmp`，位于 `home` 目录下，`home` 不存在时自动创建；
///   序号取自进程级单调计数器，而非每个工厂各自从 0 开始；
/// - 释放缓冲时无条件删除文件；删除失败只记录告警，绝不阻止缓冲进入 `Closed`。
#[derive(Debug)]
pub struct DiskFactory {
    home: PathBuf,
    prefix: String,
    pid: u32,
    accountant: Arc<ResourceAccountant>,
    live: AtomicUsize,
}

impl DiskFactory {
    /// 创建工厂并确保目录存在。
    pub fn new(
        home: impl Into<PathBuf>,
        prefix: impl Into<String>,
        accountant: Arc<ResourceAccountant>,
    ) -> Result<Arc<Self>> {
        let home = home.into();
        fs::create_dir_all(&home).map_err(|err| {
            SpoolError::io(format!("create disk home {}", home.display()), err)
        })?;
        Ok(Arc::new(Self {
            home,
            prefix: prefix.into(),
            pid: std::process::id(),
            accountant,
            live: AtomicUsize::new(0),
        }))
    }

    /// 临时文件目录。
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// 所用的记账器。
    pub fn accountant(&self) -> &Arc<ResourceAccountant> {
        &self.accountant
    }

    /// 尚未释放的缓冲数量。
    pub fn live_buffers(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// 创建新的临时文件缓冲，打开时不申请磁盘授权。
    pub fn get_buffer(self: &Arc<Self>) -> Result<DiskBuffer> {
        let sequence = NEXT_FILE_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let path = self
            .home
            .join(format!("{}-{}-{}.tmp", self.pid, self.prefix, sequence));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| SpoolError::io(format!("create {}", path.display()), err))?;
        self.live.fetch_add(1, Ordering::Relaxed);
        let buffer = DiskBuffer {
            id: next_buffer_id(),
            cursor: Cursor::default(),
            spool: Some(SpoolFile {
                file: Arc::new(file),
                path,
                granted: 0,
            }),
            factory: Arc::clone(self),
        };
        trace!(buffer.id = buffer.id, path = %buffer.path_display(), "disk buffer created");
        Ok(buffer)
    }

    /// 回收临时文件：归还已写入量的授权，关闭句柄并删除文件。
    ///
    /// 只读克隆可能仍持有同一句柄，句柄在最后一个持有者释放时关闭；删除失败仅告警。
    fn free_buffer(&self, spool: SpoolFile) {
        let SpoolFile {
            file,
            path,
            granted,
        } = spool;
        self.accountant.unregister(granted);
        self.live.fetch_sub(1, Ordering::Relaxed);
        drop(file);
        if let Err(err) = fs::remove_file(&path) {
            warn!(path = %path.display(), error = %err, "failed to delete spool file");
        }
    }
}

#[derive(Debug)]
struct SpoolFile {
    file: Arc<File>,
    path: PathBuf,
    /// 已授权且已写入的字节数，释放时原样归还。
    granted: usize,
}

/// 以临时文件为后端的缓冲。
///
/// - 读写使用定位 I/O（`pread`/`pwrite` 语义），不依赖共享的文件偏移，克隆可与源并发读取同一句柄；
/// - 容量报告为 [`UNBOUNDED_CAPACITY`]。
#[derive(Debug)]
pub struct DiskBuffer {
    id: u64,
    cursor: Cursor,
    spool: Option<SpoolFile>,
    factory: Arc<DiskFactory>,
}

impl DiskBuffer {
    /// 后端文件路径；关闭后为 `None`。
    pub fn path(&self) -> Option<&Path> {
        self.spool.as_ref().map(|spool| spool.path.as_path())
    }

    fn path_display(&self) -> String {
        self.path()
            .map(|path| path.display().to_string())
            .unwrap_or_default()
    }

    fn spool(&self) -> Result<&SpoolFile> {
        self.spool.as_ref().ok_or(SpoolError::Closed { id: self.id })
    }

    fn release(&mut self) {
        if let Some(spool) = self.spool.take() {
            self.cursor.reset();
            self.factory.free_buffer(spool);
        }
    }
}

impl Buffer for DiskBuffer {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> BufferKind {
        BufferKind::Disk
    }

    fn is_closed(&self) -> bool {
        self.spool.is_none()
    }

    fn reader_index(&self) -> Result<usize> {
        self.spool()?;
        Ok(self.cursor.reader())
    }

    fn writer_index(&self) -> Result<usize> {
        self.spool()?;
        Ok(self.cursor.writer())
    }

    fn capacity(&self) -> Result<usize> {
        self.spool()?;
        Ok(UNBOUNDED_CAPACITY)
    }

    /// 分块申请磁盘授权并写入。
    ///
    /// - 每块授权不超过记账器的单次上限；降级授权只写入授权的部分；
    /// - 一个字节都未写入即耗尽时返回 `ResourceLimit { kind: Disk }`，否则返回已写入量；
    /// - I/O 失败时立即归还当前块的授权并返回错误，此前成功的块保持已写入状态。
    fn write(&mut self, src: &[u8]) -> Result<usize> {
        let id = self.id;
        let accountant = Arc::clone(&self.factory.accountant);
        let start = self.cursor.writer();
        let limit = src.len().min(UNBOUNDED_CAPACITY - start);
        let spool = self.spool.as_mut().ok_or(SpoolError::Closed { id })?;
        let mut written = 0;
        while written < limit {
            let granted = match accountant.register(limit - written) {
                Grant::Granted(amount) => {
                    let used = amount.min(limit - written);
                    accountant.unregister(amount - used);
                    used
                }
                Grant::Exhausted if written == 0 => {
                    return Err(SpoolError::resource_limit(ResourceKind::Disk, limit));
                }
                Grant::Exhausted => break,
            };
            let offset = (start + written) as u64;
            if let Err(err) =
                positioned::write_all_at(&spool.file, &src[written..written + granted], offset)
            {
                accountant.unregister(granted);
                self.cursor.advance_writer(written);
                return Err(SpoolError::io("disk buffer write", err));
            }
            spool.granted += granted;
            written += granted;
        }
        self.cursor.advance_writer(written);
        Ok(written)
    }

    fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        let len = dst.len().min(self.cursor.readable_bytes());
        let spool = self.spool()?;
        if len == 0 {
            return Ok(0);
        }
        positioned::read_exact_at(&spool.file, &mut dst[..len], self.cursor.reader() as u64)
            .map_err(|err| SpoolError::io("disk buffer read", err))?;
        self.cursor.advance_reader(len);
        Ok(len)
    }

    /// 以定位读取分块搬运到 `sink`，每块不超过 8 KiB。
    ///
    /// `sink` 是类型擦除的 `dyn Write`，无法识别底层是否为文件或套接字，因此不走 `sendfile`
    /// 一类的平台零拷贝路径；定位读取不移动共享的文件偏移，与并发读取同一句柄的克隆互不干扰。
    fn transfer_to(&mut self, sink: &mut dyn Write, max_count: usize) -> Result<usize> {
        let spool = self.spool()?;
        let file = Arc::clone(&spool.file);
        let total = max_count.min(self.cursor.readable_bytes());
        let mut chunk = [0u8; TRANSFER_CHUNK];
        let mut moved = 0;
        while moved < total {
            let len = (total - moved).min(TRANSFER_CHUNK);
            let offset = (self.cursor.reader() + moved) as u64;
            let step = positioned::read_exact_at(&file, &mut chunk[..len], offset)
                .map_err(|err| SpoolError::io("disk buffer transfer read", err))
                .and_then(|()| {
                    sink.write_all(&chunk[..len])
                        .map_err(|err| SpoolError::io("disk buffer transfer write", err))
                });
            if let Err(err) = step {
                self.cursor.advance_reader(moved);
                return Err(err);
            }
            moved += len;
        }
        self.cursor.advance_reader(moved);
        Ok(moved)
    }

    fn rewind(&mut self) -> Result<()> {
        self.spool()?;
        self.cursor.rewind();
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.release();
        Ok(())
    }

    fn clone_buffer(&self) -> Result<ReadOnlyBuffer> {
        let spool = self.spool()?;
        Ok(ReadOnlyBuffer::from_file(
            Arc::clone(&spool.file),
            self.cursor.writer(),
        ))
    }
}

impl Drop for DiskBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

/// 定位读写：不移动共享文件偏移，允许多个视图并发访问同一句柄。
pub(crate) mod positioned {
    use std::fs::File;
    use std::io;

    #[cfg(unix)]
    pub(crate) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
        std::os::unix::fs::FileExt::read_exact_at(file, buf, offset)
    }

    #[cfg(unix)]
    pub(crate) fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
        std::os::unix::fs::FileExt::write_all_at(file, buf, offset)
    }

    #[cfg(windows)]
    pub(crate) fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            match file.seek_read(buf, offset) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    buf = &mut std::mem::take(&mut buf)[n..];
                    offset += n as u64;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    #[cfg(windows)]
    pub(crate) fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            match file.seek_write(buf, offset) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory(dir: &Path, total: u64) -> Arc<DiskFactory> {
        let accountant = Arc::new(ResourceAccountant::new(ResourceKind::Disk, total, 1, 16));
        DiskFactory::new(dir.join("spool"), "test", accountant).expect("创建磁盘工厂")
    }

    #[test]
    fn file_is_named_after_pid_prefix_and_sequence() {
        let dir = tempfile::tempdir().expect("临时目录");
        let factory = factory(dir.path(), 1024);
        let buffer = factory.get_buffer().expect("创建磁盘缓冲");
        let name = buffer
            .path()
            .and_then(|path| path.file_name())
            .and_then(|name| name.to_str())
            .expect("文件名")
            .to_owned();
        let sequence = name
            .strip_prefix(&format!("{}-test-", std::process::id()))
            .and_then(|rest| rest.strip_suffix(".tmp"))
            .expect("文件名应为 {pid}-{prefix}-{sequence}.tmp");
        assert!(sequence.parse::<u64>().is_ok(), "序号应为十进制整数：{sequence}");
        assert!(factory.home().exists(), "目录应被自动创建");
    }

    #[test]
    fn factories_sharing_home_and_prefix_never_collide() {
        let dir = tempfile::tempdir().expect("临时目录");
        let first = factory(dir.path(), 1024);
        let second = factory(dir.path(), 1024);
        let a = first.get_buffer().expect("第一个工厂创建缓冲");
        let b = second.get_buffer().expect("第二个工厂在同一目录下创建缓冲");
        let c = first.get_buffer().expect("第一个工厂再次创建缓冲");
        let paths = [a.path(), b.path(), c.path()].map(|path| path.expect("路径").to_path_buf());
        assert_ne!(paths[0], paths[1]);
        assert_ne!(paths[0], paths[2]);
        assert_ne!(paths[1], paths[2]);
    }

    #[test]
    fn grants_track_written_bytes_in_chunks() {
        let dir = tempfile::tempdir().expect("临时目录");
        let factory = factory(dir.path(), 1024);
        let mut buffer = factory.get_buffer().expect("创建磁盘缓冲");
        assert_eq!(factory.accountant().remaining(), 1024, "打开文件时不应授权");
        let payload: Vec<u8> = (0..40u8).collect();
        assert_eq!(buffer.write(&payload).expect("写入"), 40);
        assert_eq!(factory.accountant().remaining(), 1024 - 40);
        let mut out = vec![0u8; 40];
        assert_eq!(buffer.read(&mut out).expect("读取"), 40);
        assert_eq!(out, payload);
        buffer.clear().expect("释放");
        assert_eq!(factory.accountant().remaining(), 1024);
    }

    #[test]
    fn degraded_grant_accepts_partial_write_then_fails() {
        let dir = tempfile::tempdir().expect("临时目录");
        let factory = factory(dir.path(), 10);
        let mut buffer = factory.get_buffer().expect("创建磁盘缓冲");
        assert_eq!(buffer.write(&[7u8; 25]).expect("降级写入"), 10);
        let err = buffer.write(b"more").expect_err("配额耗尽应失败");
        assert!(err.is_disk_limit());
        assert_eq!(buffer.writer_index().expect("写游标"), 10);
    }

    #[test]
    fn clear_deletes_file_and_is_idempotent() {
        let dir = tempfile::tempdir().expect("临时目录");
        let factory = factory(dir.path(), 1024);
        let mut buffer = factory.get_buffer().expect("创建磁盘缓冲");
        buffer.write(b"hello").expect("写入");
        let path = buffer.path().expect("路径").to_path_buf();
        assert!(path.exists());
        buffer.clear().expect("释放");
        buffer.clear().expect("重复释放");
        assert!(!path.exists(), "释放后临时文件应被删除");
        assert!(matches!(buffer.read(&mut [0u8; 1]), Err(SpoolError::Closed { .. })));
        assert_eq!(factory.live_buffers(), 0);
    }

    #[test]
    fn transfer_moves_bytes_to_sink() {
        let dir = tempfile::tempdir().expect("临时目录");
        let factory = factory(dir.path(), 1 << 20);
        let mut buffer = factory.get_buffer().expect("创建磁盘缓冲");
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(buffer.write(&payload).expect("写入"), payload.len());
        let mut sink = Vec::new();
        assert_eq!(buffer.transfer_to(&mut sink, 12_345).expect("搬运"), 12_345);
        assert_eq!(buffer.transfer_to(&mut sink, usize::MAX).expect("搬运剩余"), 20_000 - 12_345);
        assert_eq!(sink, payload);
        assert!(!buffer.readable().expect("查询可读"));
    }
}
