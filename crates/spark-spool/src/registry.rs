use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::info;

use crate::accountant::{AccountantSnapshot, ResourceAccountant, ResourceKind};
use crate::buffer::{DiskBuffer, DiskFactory, MemoryFactory};
use crate::config::SpoolConfig;
use crate::error::Result;
use crate::range::RangeBuffer;
use crate::segmented::SegmentedBuffer;
use crate::spillover::SpilloverFactory;

/// 注册表统计快照。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryStats {
    pub memory: AccountantSnapshot,
    pub disk: AccountantSnapshot,
    /// 已创建的逻辑池数量。
    pub pools: usize,
    /// 尚未释放的物理缓冲（内存与磁盘）数量。
    pub live_buffers: usize,
}

/// `BufferRegistry` 以逻辑池名为键，向调用方分发分段、磁盘与区间缓冲。
///
/// # 设计动机（Why）
/// - 全局工厂单例难以测试，也无法在同一进程内并存多套配额；注册表把全部共享状态收拢为一个值，
///   由宿主 `init` 一次后以引用或 `Arc` 传递给各协议处理器；
/// - 同一进程的全部池共享一对内存/磁盘记账器，配额是进程级的；池名只影响临时文件命名，便于排障时追溯来源。
///
/// # 契约说明（What）
/// - `init` 校验配置、创建磁盘目录与记账器；
/// - 每个池的溢写工厂在首次使用时惰性创建，之后复用；
/// - `reload` 以差值语义把新配额推给两个记账器，单次授权的区间大小在 `init` 时确定，热更新不改变；
/// - `shutdown` 消费注册表并丢弃各池工厂；仍存活的缓冲持有各自工厂的句柄，之后照常释放。
#[derive(Debug)]
pub struct BufferRegistry {
    config: RwLock<SpoolConfig>,
    memory_accountant: Arc<ResourceAccountant>,
    disk_accountant: Arc<ResourceAccountant>,
    memory: Arc<MemoryFactory>,
    pools: DashMap<String, Arc<SpilloverFactory>>,
}

impl BufferRegistry {
    /// 按配置初始化注册表。
    pub fn init(config: SpoolConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.disk_home).map_err(|err| {
            crate::error::SpoolError::io(
                format!("create disk home {}", config.disk_home.display()),
                err,
            )
        })?;
        let memory_accountant = Arc::new(ResourceAccountant::new(
            ResourceKind::Memory,
            config.memory_total_size,
            config.base_buf_size,
            config.peralloc_limit,
        ));
        let disk_accountant = Arc::new(ResourceAccountant::new(
            ResourceKind::Disk,
            config.disk_total_size,
            1,
            config.peralloc_limit,
        ));
        info!(
            memory.total = config.memory_total_size,
            disk.total = config.disk_total_size,
            disk.home = %config.disk_home.display(),
            "buffer registry initialized"
        );
        Ok(Self {
            memory: MemoryFactory::new(Arc::clone(&memory_accountant)),
            memory_accountant,
            disk_accountant,
            config: RwLock::new(config),
            pools: DashMap::new(),
        })
    }

    /// 当前生效的配置副本。
    pub fn config(&self) -> SpoolConfig {
        self.config.read().clone()
    }

    /// 获取（必要时创建）指定池的溢写工厂。
    pub fn factory(&self, key: &str) -> Result<Arc<SpilloverFactory>> {
        if let Some(factory) = self.pools.get(key) {
            return Ok(Arc::clone(factory.value()));
        }
        let created = {
            let config = self.config.read();
            let prefix = format!("{}-{}", config.file_pre, sanitize(key));
            let disk = DiskFactory::new(
                config.disk_home.clone(),
                prefix,
                Arc::clone(&self.disk_accountant),
            )?;
            Arc::new(SpilloverFactory::new(Arc::clone(&self.memory), disk))
        };
        let entry = self.pools.entry(key.to_owned()).or_insert(created);
        Ok(Arc::clone(entry.value()))
    }

    /// 分配分段缓冲，首个分段容量为 `capacity`。
    pub fn get_segmented_buffer(&self, key: &str, capacity: usize) -> Result<SegmentedBuffer> {
        Ok(SegmentedBuffer::new(self.factory(key)?, capacity))
    }

    /// 直接分配磁盘缓冲。
    pub fn get_disk_buffer(&self, key: &str) -> Result<DiskBuffer> {
        self.factory(key)?.get_disk_buffer()
    }

    /// 分配区间缓冲，每个区间首个分段容量为 `capacity`。
    pub fn get_range_buffer(&self, key: &str, capacity: usize) -> Result<RangeBuffer> {
        Ok(RangeBuffer::new(self.factory(key)?, capacity))
    }

    /// 热更新配额，保留在途授权。
    pub fn reload(&self, next: SpoolConfig) -> Result<()> {
        next.validate()?;
        let previous_memory = self.memory_accountant.reload(next.memory_total_size);
        let previous_disk = self.disk_accountant.reload(next.disk_total_size);
        info!(
            memory.previous = previous_memory,
            memory.total = next.memory_total_size,
            disk.previous = previous_disk,
            disk.total = next.disk_total_size,
            "buffer quotas reloaded"
        );
        *self.config.write() = next;
        Ok(())
    }

    /// 统计快照。
    pub fn stats(&self) -> RegistryStats {
        let disk_live: usize = self
            .pools
            .iter()
            .map(|pool| pool.value().disk().live_buffers())
            .sum();
        RegistryStats {
            memory: self.memory_accountant.snapshot(),
            disk: self.disk_accountant.snapshot(),
            pools: self.pools.len(),
            live_buffers: self.memory.live_buffers() + disk_live,
        }
    }

    /// 关闭注册表。
    pub fn shutdown(self) {
        let stats = self.stats();
        info!(
            pools = stats.pools,
            live_buffers = stats.live_buffers,
            "buffer registry shut down"
        );
        self.pools.clear();
    }
}

/// 池名用于文件名，只保留字母数字、`-` 与 `_`。
fn sanitize(key: &str) -> String {
    key.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
