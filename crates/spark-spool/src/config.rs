//! 缓冲层配置。
//!
//! # 设计目标（Why）
//! - 配置加载器属于外部协作者，本模块只定义缓冲层消费的选项、默认值与校验规则；
//! - 键名沿用短横线风格（`memory-total-size` 等），可直接嵌入宿主的 TOML 配置文件。
//!
//! # 契约说明（What）
//! - 缺省字段回落到默认值；未知字段被忽略，便于与宿主的其它配置节共存；
//! - [`SpoolConfig::validate`] 拒绝 0 容量以及 `base-buf-size > peralloc-limit`。

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{Result, SpoolError};

const KIB: usize = 1024;
const GIB: u64 = 1024 * 1024 * 1024;

/// 缓冲层配置项。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SpoolConfig {
    /// 内存总配额（字节）。
    pub memory_total_size: u64,
    /// 最小单次内存授权（字节）。
    pub base_buf_size: usize,
    /// 单次授权上限（字节），同时约束磁盘写入的分块大小。
    pub peralloc_limit: usize,
    /// 磁盘总配额（字节）。
    pub disk_total_size: u64,
    /// 临时文件目录，不存在时自动创建。
    pub disk_home: PathBuf,
    /// 临时文件名前缀，实际文件名为 `{pid}-{file-pre}-{pool}-{sequence}.tmp`。
    pub file_pre: String,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            memory_total_size: GIB,
            base_buf_size: 4 * KIB,
            peralloc_limit: 64 * KIB,
            disk_total_size: 20 * GIB,
            disk_home: std::env::temp_dir().join("spark-spool"),
            file_pre: String::from("spool"),
        }
    }
}

impl SpoolConfig {
    /// 从 TOML 文本解析并校验配置。
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: SpoolConfig = toml::from_str(text).map_err(|err| SpoolError::Config {
            detail: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// 校验取值约束。
    pub fn validate(&self) -> Result<()> {
        let reject = |detail: String| Err(SpoolError::Config { detail });
        if self.memory_total_size == 0 {
            return reject("memory-total-size must be positive".into());
        }
        if self.disk_total_size == 0 {
            return reject("disk-total-size must be positive".into());
        }
        if self.base_buf_size == 0 || self.peralloc_limit == 0 {
            return reject("base-buf-size and peralloc-limit must be positive".into());
        }
        if self.base_buf_size > self.peralloc_limit {
            return reject(format!(
                "base-buf-size ({}) exceeds peralloc-limit ({})",
                self.base_buf_size, self.peralloc_limit
            ));
        }
        if self.file_pre.trim().is_empty() {
            return reject("file-pre must not be blank".into());
        }
        Ok(())
    }

    pub fn with_memory_total_size(mut self, bytes: u64) -> Self {
        self.memory_total_size = bytes;
        self
    }

    pub fn with_base_buf_size(mut self, bytes: usize) -> Self {
        self.base_buf_size = bytes;
        self
    }

    pub fn with_peralloc_limit(mut self, bytes: usize) -> Self {
        self.peralloc_limit = bytes;
        self
    }

    pub fn with_disk_total_size(mut self, bytes: u64) -> Self {
        self.disk_total_size = bytes;
        self
    }

    pub fn with_disk_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.disk_home = home.into();
        self
    }

    pub fn with_file_pre(mut self, prefix: impl Into<String>) -> Self {
        self.file_pre = prefix.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kebab_case_keys_and_fills_defaults() {
        let config = SpoolConfig::from_toml_str(
            r#"
            memory-total-size = 1048576
            base-buf-size = 512
            disk-home = "/var/spool/spark"
            unrelated-option = true
            "#,
        )
        .expect("解析配置");
        assert_eq!(config.memory_total_size, 1_048_576);
        assert_eq!(config.base_buf_size, 512);
        assert_eq!(config.peralloc_limit, 64 * KIB);
        assert_eq!(config.disk_home, PathBuf::from("/var/spool/spark"));
        assert_eq!(config.file_pre, "spool");
    }

    #[test]
    fn rejects_base_larger_than_ceiling() {
        let err = SpoolConfig::from_toml_str("base-buf-size = 8192\nperalloc-limit = 4096")
            .expect_err("非法组合应被拒绝");
        assert_eq!(err.code(), crate::error::codes::CONFIG);
    }

    #[test]
    fn rejects_malformed_document() {
        assert!(SpoolConfig::from_toml_str("memory-total-size = \"lots\"").is_err());
        assert!(SpoolConfig::default().with_disk_total_size(0).validate().is_err());
    }
}
