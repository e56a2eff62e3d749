use crate::error::Result;
use crate::traits::MirrorSource;
use crate::types::Repository;
use crate::utils;
use async_trait::async_trait;
use regex::Regex;
use std::path::PathBuf;
use tokio::fs;

/// pacman-style mirrorlist: `Server = <url>` lines.
pub struct PacmanSource {
    path: PathBuf,
}

impl PacmanSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

fn server_regex() -> Result<Regex> {
    // 支持 Server = https://... 或 Server=https://...
    Ok(Regex::new(r"^\s*Server\s*=\s*(\S+)\s*$")?)
}

#[async_trait]
impl MirrorSource for PacmanSource {
    fn name(&self) -> &'static str {
        "pacman"
    }

    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    async fn load(&self) -> Result<Repository> {
        let content = fs::read_to_string(&self.path).await?;
        let re = server_regex()?;

        // "#Server = ..." lines are disabled mirrors and don't match
        let mirrors = content
            .lines()
            .filter_map(|l| re.captures(l).map(|caps| caps[1].to_string()))
            .collect();
        Ok(Repository::new(&super::repo_id(&self.path), mirrors))
    }

    async fn store(&self, repo: &Repository) -> Result<()> {
        let content = if fs::try_exists(&self.path).await.unwrap_or(false) {
            fs::read_to_string(&self.path).await?
        } else {
            String::new()
        };

        if !content.is_empty() {
            utils::backup_file(&self.path).await?;
        }

        // Comments and disabled "#Server =" lines survive the rewrite
        let re = server_regex()?;
        let servers: Vec<String> = repo.mirrors.iter().map(|url| format!("Server = {}", url)).collect();
        let new_content = utils::rewrite_entries(&content, |l| re.is_match(l), &servers);

        fs::write(&self.path, new_content).await?;
        Ok(())
    }

    async fn restore(&self) -> Result<()> {
        utils::restore_latest_backup(&self.path).await
    }
}
