use crate::error::Result;
use crate::prober::ProbeOutcome;
use crate::types::Repository;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

/// Prober: measures connect latency to a single host.
///
/// Implementations must never panic on network failure; every failure is a
/// `ProbeOutcome::Dead`. The scheduler still copes if one does.
#[async_trait]
pub trait Prober: Sync + Send {
    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> ProbeOutcome;
}

/// MirrorSource: a file holding one repository's mirror list.
#[async_trait]
pub trait MirrorSource: Sync + Send {
    /// Format name ("plain", "pacman")
    fn name(&self) -> &'static str;

    /// Path of the backing file
    fn path(&self) -> PathBuf;

    /// Read the repository. Its id is the file stem.
    async fn load(&self) -> Result<Repository>;

    /// Rewrite the file with the repository's (ranked) mirrors.
    /// 实现中必须包含:
    /// 1. 备份原文件
    /// 2. 写入新内容
    async fn store(&self, repo: &Repository) -> Result<()>;

    /// 恢复到上一次的备份
    async fn restore(&self) -> Result<()>;
}
