use crate::error::Result;
use crate::traits::MirrorSource;
use crate::types::Repository;
use crate::utils;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;

/// yum-style mirrorlist: one URL per line, `#` comments.
pub struct PlainSource {
    path: PathBuf,
}

impl PlainSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

fn is_entry(line: &str) -> bool {
    let line = line.trim();
    !line.is_empty() && !line.starts_with('#')
}

#[async_trait]
impl MirrorSource for PlainSource {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    async fn load(&self) -> Result<Repository> {
        let content = fs::read_to_string(&self.path).await?;
        let mirrors = content
            .lines()
            .filter(|l| is_entry(l))
            .map(|l| l.trim().to_string())
            .collect();
        Ok(Repository::new(&super::repo_id(&self.path), mirrors))
    }

    async fn store(&self, repo: &Repository) -> Result<()> {
        // 1. 读取旧内容
        let content = if fs::try_exists(&self.path).await.unwrap_or(false) {
            fs::read_to_string(&self.path).await?
        } else {
            String::new()
        };

        // 2. 备份
        if !content.is_empty() {
            utils::backup_file(&self.path).await?;
        }

        // 3. 写入, 注释和禁用的镜像保留
        let new_content = utils::rewrite_entries(&content, is_entry, &repo.mirrors);
        fs::write(&self.path, new_content).await?;
        Ok(())
    }

    async fn restore(&self) -> Result<()> {
        utils::restore_latest_backup(&self.path).await
    }
}
