use crate::error::Result;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Loaded and younger than the max age
    Fresh,
    /// Present but too old, or its age could not be determined
    Stale,
    Missing,
    /// Present but could not be read (permissions etc.)
    Unreadable,
}

/// 主机延迟缓存: host -> latency in seconds, with whole-file staleness.
#[derive(Debug, Clone)]
pub struct HostCache {
    entries: HashMap<String, f64>,
    state: CacheState,
}

impl HostCache {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
            state: CacheState::Missing,
        }
    }

    /// Load the cache file. Never fails: anything but a fresh, readable
    /// file yields an empty cache.
    pub async fn load(path: &Path, max_age: Duration) -> Self {
        let metadata = match fs::metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No host cache at {:?}", path);
                return Self::empty();
            }
            Err(e) => {
                warn!("Cannot stat host cache {:?}: {}", path, e);
                return Self::with_state(CacheState::Unreadable);
            }
        };

        let age = metadata
            .modified()
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok());

        match age {
            Some(age) if age < max_age => {}
            Some(age) => {
                info!("Host cache {:?} is stale ({}s old), ignoring it", path, age.as_secs());
                return Self::with_state(CacheState::Stale);
            }
            None => {
                warn!("Cannot determine age of host cache {:?}, ignoring it", path);
                return Self::with_state(CacheState::Stale);
            }
        }

        match fs::read_to_string(path).await {
            Ok(content) => {
                let entries = parse(&content);
                debug!("Loaded {} cached hosts from {:?}", entries.len(), path);
                Self {
                    entries,
                    state: CacheState::Fresh,
                }
            }
            Err(e) => {
                warn!("Cannot read host cache {:?}: {}", path, e);
                Self::with_state(CacheState::Unreadable)
            }
        }
    }

    /// Read whatever the file holds, regardless of age. Used for display only.
    pub async fn peek(path: &Path) -> Result<(HashMap<String, f64>, Option<Duration>)> {
        let metadata = fs::metadata(path).await?;
        let age = metadata
            .modified()
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok());
        let content = fs::read_to_string(path).await?;
        Ok((parse(&content), age))
    }

    fn with_state(state: CacheState) -> Self {
        Self {
            entries: HashMap::new(),
            state,
        }
    }

    pub fn state(&self) -> CacheState {
        self.state
    }

    pub fn is_fresh(&self) -> bool {
        self.state == CacheState::Fresh
    }

    pub fn get(&self, host: &str) -> Option<f64> {
        self.entries.get(host).copied()
    }

    pub fn entries(&self) -> &HashMap<String, f64> {
        &self.entries
    }

    #[cfg(test)]
    pub fn fresh(entries: HashMap<String, f64>) -> Self {
        Self {
            entries,
            state: CacheState::Fresh,
        }
    }
}

/// Parse `host latency` lines; malformed lines are skipped.
pub fn parse(content: &str) -> HashMap<String, f64> {
    let mut entries = HashMap::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut fields = line.split_whitespace();
        let parsed = match (fields.next(), fields.next(), fields.next()) {
            (Some(host), Some(latency), None) => latency
                .parse::<f64>()
                .ok()
                .filter(|l| l.is_finite() && *l >= 0.0)
                .map(|l| (host, l)),
            _ => None,
        };

        match parsed {
            Some((host, latency)) => {
                entries.insert(host.to_string(), latency);
            }
            None => debug!("Skipping malformed host cache line {}: {:?}", lineno + 1, line),
        }
    }
    entries
}

/// Overwrite the cache file with `entries`, sorted by host.
/// Goes through a temp file so a failed write never truncates the old cache.
pub async fn save(path: &Path, entries: &HashMap<String, f64>) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let mut hosts: Vec<_> = entries.iter().collect();
    hosts.sort_by(|a, b| a.0.cmp(b.0));

    let mut content = String::new();
    for (host, latency) in hosts {
        content.push_str(&format!("{} {}\n", host, latency));
    }

    let file_name = path.file_name().unwrap_or_default().to_string_lossy();
    let tmp = path.with_file_name(format!("{}.tmp", file_name));

    let written = match fs::write(&tmp, content).await {
        Ok(()) => fs::rename(&tmp, path).await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DEAD;
    use tempfile::tempdir;

    const TEN_DAYS: Duration = Duration::from_secs(10 * 24 * 3600);

    fn age_file(path: &Path, by: Duration) -> std::io::Result<()> {
        let file = std::fs::File::options().write(true).open(path)?;
        file.set_modified(SystemTime::now() - by)
    }

    #[test]
    fn test_parse_skips_malformed_lines() {
        let content = "a.example 0.25\n\
                       garbage\n\
                       b.example notanumber\n\
                       c.example 0.5 extra\n\
                       \n\
                       d.example   99999999999\n\
                       e.example -1\n";
        let entries = parse(content);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries["a.example"], 0.25);
        assert_eq!(entries["d.example"], DEAD);
    }

    #[tokio::test]
    async fn test_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("nested").join("timedhosts.txt");

        let mut entries = HashMap::new();
        entries.insert("fast.example".to_string(), 0.012345678);
        entries.insert("slow.example".to_string(), 1.5);
        entries.insert("dead.example".to_string(), DEAD);

        save(&path, &entries).await?;
        let cache = HostCache::load(&path, TEN_DAYS).await;

        assert!(cache.is_fresh());
        assert_eq!(cache.entries(), &entries);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let cache = HostCache::load(&dir.path().join("nope.txt"), TEN_DAYS).await;
        assert_eq!(cache.state(), CacheState::Missing);
        assert!(cache.entries().is_empty());
    }

    #[tokio::test]
    async fn test_stale_file_is_ignored() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("timedhosts.txt");
        std::fs::write(&path, "fast.example 0.01\n")?;
        age_file(&path, TEN_DAYS + Duration::from_secs(60))?;

        let cache = HostCache::load(&path, TEN_DAYS).await;
        assert_eq!(cache.state(), CacheState::Stale);
        assert_eq!(cache.get("fast.example"), None);

        // Still visible for display
        let (entries, age) = HostCache::peek(&path).await?;
        assert_eq!(entries["fast.example"], 0.01);
        assert!(age.unwrap() > TEN_DAYS);
        Ok(())
    }

    #[tokio::test]
    async fn test_zero_max_age_disables_cache() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("timedhosts.txt");
        std::fs::write(&path, "fast.example 0.01\n")?;

        let cache = HostCache::load(&path, Duration::ZERO).await;
        assert!(!cache.is_fresh());
        Ok(())
    }

    #[tokio::test]
    async fn test_unreadable_path_degrades() -> Result<()> {
        // A directory where the file should be: stat works, read fails
        let dir = tempdir()?;
        let path = dir.path().join("timedhosts.txt");
        std::fs::create_dir(&path)?;

        let cache = HostCache::load(&path, TEN_DAYS).await;
        assert_eq!(cache.state(), CacheState::Unreadable);
        assert!(cache.entries().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_save_leaves_no_temp_file() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("hosts.tmp");
        let entries = HashMap::from([("a.example".to_string(), 0.5)]);

        save(&path, &entries).await?;
        let names: Vec<_> = std::fs::read_dir(dir.path())?
            .map(|e| e.map(|e| e.file_name().to_string_lossy().to_string()))
            .collect::<std::io::Result<_>>()?;
        assert_eq!(names, vec!["hosts.tmp".to_string()]);
        assert_eq!(HostCache::load(&path, TEN_DAYS).await.get("a.example"), Some(0.5));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_rename_cleans_up_temp_file() -> Result<()> {
        // Target is a non-empty directory, so the rename fails after the write
        let dir = tempdir()?;
        let path = dir.path().join("timedhosts.txt");
        std::fs::create_dir(&path)?;
        std::fs::write(path.join("keep"), "")?;

        assert!(save(&path, &HashMap::new()).await.is_err());
        assert!(!dir.path().join("timedhosts.txt.tmp").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_save_failure_is_reported() -> Result<()> {
        let dir = tempdir()?;
        // Parent "directory" is a regular file
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "")?;
        let path = blocker.join("timedhosts.txt");

        assert!(save(&path, &HashMap::new()).await.is_err());
        Ok(())
    }
}
