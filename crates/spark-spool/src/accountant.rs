//! 资源记账器：以全局配额为上限，为每次分配发放“授权”（Grant）。
//!
//! # 设计总览（Why）
//! - 邮件负载大小差异巨大，若不设上限，内存会随并发连接线性膨胀；记账器把“能否分配”与“如何分配”解耦，
//!   缓冲实现只需询问授权额度，无需感知全局状态。
//! - 内存与磁盘采用同一实现、不同 [`ResourceKind`]：内存在分配时一次性预授权，磁盘在每次写入时增量授权。
//!
//! # 并发模型（How）
//! - `remaining` 使用有符号原子整数，授权与归还均为无锁 CAS 循环，位于每次分配的热路径上；
//! - `reload` 只把新旧配额的差值叠加到 `remaining`，因此已发放但未归还的授权在热更前后保持一致；
//!   缩容可能让 `remaining` 暂时为负（欠账），此时所有授权请求返回 [`Grant::Exhausted`]，直到归还把欠账补平。

use core::fmt;

#[cfg(not(any(loom, spark_loom)))]
use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};
#[cfg(any(loom, spark_loom))]
use loom::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// 记账器管理的资源类型。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// 进程内堆内存。
    Memory,
    /// 临时磁盘空间。
    Disk,
}

impl ResourceKind {
    /// 面向日志与指标的稳定标签。
    pub fn label(self) -> &'static str {
        match self {
            ResourceKind::Memory => "memory",
            ResourceKind::Disk => "disk",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// 单次授权的结果。
///
/// # 教案式说明
/// - **意图 (Why)**：授权可能少于请求（配额即将耗尽时的降级授权），若以裸整数返回，调用方容易把部分授权误当作完整授权；
///   显式枚举迫使调用方处理两种分支。
/// - **契约 (What)**：`Granted(n)` 保证 `n > 0` 且 `n` 已从剩余额度中扣除；调用方最终必须通过
///   [`ResourceAccountant::unregister`] 归还同样的数量。`Exhausted` 表示未扣除任何额度。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Grant {
    /// 已授权的字节数，可能小于请求值。
    Granted(usize),
    /// 配额耗尽，没有任何授权。
    Exhausted,
}

impl Grant {
    /// 是否拿到了授权。
    pub fn is_granted(&self) -> bool {
        matches!(self, Grant::Granted(_))
    }

    /// 授权字节数；耗尽时为 0。
    pub fn granted(&self) -> usize {
        match self {
            Grant::Granted(amount) => *amount,
            Grant::Exhausted => 0,
        }
    }
}

/// 记账器只读快照，用于日志、指标与测试断言。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountantSnapshot {
    pub kind: ResourceKind,
    pub total: u64,
    /// 剩余额度；缩容后可能为负，表示尚未还清的欠账。
    pub remaining: i64,
    /// 已授权且尚未归还的额度，即 `total - remaining`。
    pub outstanding: i64,
}

/// 全局配额记账器。
///
/// # 设计背景（Why）
/// - 记账器是唯一被大量无关线程共享并修改的状态，因此全部操作均为无锁原子更新；
/// - 授权大小被夹在 `[base_unit, per_alloc_ceiling]` 区间内：过小的请求向上取整以减少碎片，
///   过大的请求被截断，迫使调用方分段分配（例如分段缓冲追加新分段）。
///
/// # 契约说明（What）
/// - `register`：返回夹取后、可能降级的授权；只有剩余额度不大于 0 时才返回 [`Grant::Exhausted`]；
/// - `unregister`：无条件把额度加回；调用方必须归还与先前授权（磁盘则为实际写入量）完全一致的数量，
///   否则记账会永久漂移，这一点记账器无法校验；
/// - `reload`：按差值调整剩余额度，保留在途授权。
///
/// # 风险提示（Trade-offs）
/// - 乐观 CAS 自旋适合中等竞争；在极端争用下可能多次重试，但不会阻塞。
#[derive(Debug)]
pub struct ResourceAccountant {
    kind: ResourceKind,
    total: AtomicU64,
    remaining: AtomicI64,
    base_unit: usize,
    per_alloc_ceiling: usize,
}

impl ResourceAccountant {
    /// 创建记账器，剩余额度初始等于总配额。
    ///
    /// `base_unit` 大于 `per_alloc_ceiling` 时以后者为准，保证夹取区间非空。
    pub fn new(kind: ResourceKind, total: u64, base_unit: usize, per_alloc_ceiling: usize) -> Self {
        let per_alloc_ceiling = per_alloc_ceiling.max(1);
        Self {
            kind,
            total: AtomicU64::new(total),
            remaining: AtomicI64::new(saturating_i64(total)),
            base_unit: base_unit.min(per_alloc_ceiling),
            per_alloc_ceiling,
        }
    }

    /// 返回资源类型。
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// 当前配置的总配额。
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    /// 当前剩余额度，可能为负。
    pub fn remaining(&self) -> i64 {
        self.remaining.load(Ordering::Acquire)
    }

    /// 最小授权单位。
    pub fn base_unit(&self) -> usize {
        self.base_unit
    }

    /// 单次授权上限。
    pub fn per_alloc_ceiling(&self) -> usize {
        self.per_alloc_ceiling
    }

    /// 申请授权。
    ///
    /// # 执行步骤（How）
    /// 1. 将请求夹取到 `[base_unit, per_alloc_ceiling]`；
    /// 2. 读取剩余额度，若不大于 0 直接返回 `Exhausted`；
    /// 3. 授权 `min(夹取后请求, 剩余额度)` 并以 CAS 扣减，竞争失败则以最新值重试。
    pub fn register(&self, size: usize) -> Grant {
        let wanted = saturating_i64(size.max(self.base_unit).min(self.per_alloc_ceiling) as u64);
        let mut current = self.remaining.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return Grant::Exhausted;
            }
            let granted = wanted.min(current);
            match self.remaining.compare_exchange(
                current,
                current - granted,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Grant::Granted(granted as usize),
                Err(actual) => current = actual,
            }
        }
    }

    /// 归还授权，永不失败。
    pub fn unregister(&self, size: usize) {
        if size == 0 {
            return;
        }
        self.remaining
            .fetch_add(saturating_i64(size as u64), Ordering::AcqRel);
    }

    /// 以新的总配额热更新，返回旧配额。
    ///
    /// - 剩余额度按 `new_total - old_total` 调整，而非重置；
    /// - 缩容可能使剩余额度为负，归还操作会逐步把它补回。
    pub fn reload(&self, new_total: u64) -> u64 {
        let old_total = self.total.swap(new_total, Ordering::AcqRel);
        let delta = saturating_i64(new_total) - saturating_i64(old_total);
        if delta != 0 {
            self.remaining.fetch_add(delta, Ordering::AcqRel);
        }
        old_total
    }

    /// 生成只读快照。
    pub fn snapshot(&self) -> AccountantSnapshot {
        let total = self.total();
        let remaining = self.remaining();
        AccountantSnapshot {
            kind: self.kind,
            total,
            remaining,
            outstanding: saturating_i64(total) - remaining,
        }
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
