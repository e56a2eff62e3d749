use crate::error::{MirrorError, Result};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tracing::info;

/// 备份文件 (如果有)
/// 文件名格式: mirrorlist -> mirrorlist.bak.TIMESTAMP
pub async fn backup_file(path: &Path) -> Result<()> {
    if fs::try_exists(path).await.unwrap_or(false) {
        let timestamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        let file_name = path.file_name().unwrap_or_default().to_string_lossy();
        let backup_name = format!("{}.bak.{}", file_name, timestamp);
        let backup_path = path.with_file_name(backup_name);

        fs::copy(path, &backup_path).await?;
        info!("Backup created at: {:?}", backup_path);
    }
    Ok(())
}

/// 恢复到最近的备份
pub async fn restore_latest_backup(path: &Path) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let file_name = path.file_name().unwrap_or_default().to_string_lossy();
    let prefix = format!("{}.bak.", file_name);

    if !fs::try_exists(parent).await.unwrap_or(false) {
        return Err(MirrorError::Custom(format!(
            "Directory not found: {:?}",
            parent
        )));
    }

    let mut entries = fs::read_dir(parent).await?;
    let mut backups = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(ts) = name.strip_prefix(&prefix).and_then(|s| s.parse::<u64>().ok()) {
            backups.push((ts, entry.path()));
        }
    }

    // Numeric sort; plain path sorting breaks once timestamps change length
    backups.sort();
    let Some((_, latest)) = backups.last() else {
        return Err(MirrorError::Custom("No backup files found.".to_string()));
    };

    info!("Restoring from backup: {:?}", latest);
    fs::copy(latest, path).await?;
    Ok(())
}

/// Rewrite a mirrorlist with new entry lines.
///
/// Lines before the first entry stay on top, the entries follow, and every
/// other non-entry line (later comments, disabled mirrors) goes after them.
pub fn rewrite_entries(content: &str, is_entry: impl Fn(&str) -> bool, entries: &[String]) -> String {
    let mut lines = content.lines();
    let mut out = String::new();

    for line in lines.by_ref() {
        if is_entry(line) {
            break;
        }
        out.push_str(line);
        out.push('\n');
    }

    for entry in entries {
        out.push_str(entry);
        out.push('\n');
    }

    for line in lines.filter(|l| !is_entry(*l)) {
        out.push_str(line);
        out.push('\n');
    }
    out
}
