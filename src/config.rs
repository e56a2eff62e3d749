use crate::error::{MirrorError, Result};
use directories::ProjectDirs;
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Raw options as they appear in config.toml. Integers are signed so that a
/// negative value reaches `validate` and gets a proper message.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub verbose: bool,
    pub always_print_best_host: bool,
    pub socket_timeout: i64,
    pub maxthreads: i64,
    pub hostfilepath: Option<PathBuf>,
    pub maxhostfileage: i64,
    pub exclude: Option<String>,
    pub include_only: Option<String>,
    pub prefer: Option<String>,
    pub downgrade_ftp: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            verbose: false,
            always_print_best_host: true,
            socket_timeout: 3,
            maxthreads: 15,
            hostfilepath: None,
            maxhostfileage: 10,
            exclude: None,
            include_only: None,
            prefer: None,
            downgrade_ftp: true,
        }
    }
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub verbose: bool,
    pub socket_timeout: Option<i64>,
    pub maxthreads: Option<i64>,
    pub hostfilepath: Option<PathBuf>,
    pub maxhostfileage: Option<i64>,
    pub exclude: Option<String>,
    pub include_only: Option<String>,
    pub prefer: Option<String>,
    pub no_downgrade_ftp: bool,
}

/// Validated, immutable ranking policy.
#[derive(Debug, Clone)]
pub struct Policy {
    pub verbose: bool,
    pub always_print_best_host: bool,
    pub socket_timeout: Duration,
    pub maxthreads: usize,
    pub hostfilepath: PathBuf,
    pub maxhostfileage: Duration,
    pub exclude: Vec<Regex>,
    pub include_only: Vec<Regex>,
    pub prefer: Option<String>,
    pub downgrade_ftp: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            verbose: false,
            always_print_best_host: true,
            socket_timeout: Duration::from_secs(3),
            maxthreads: 15,
            hostfilepath: default_hostfile_path(),
            maxhostfileage: Duration::from_secs(10 * SECONDS_PER_DAY),
            exclude: Vec::new(),
            include_only: Vec::new(),
            prefer: None,
            downgrade_ftp: true,
        }
    }
}

impl Settings {
    /// Load settings.
    /// Strategy:
    /// 1. Explicit path (must exist)
    /// 2. ~/.config/fastmirror/config.toml if present
    /// 3. Built-in defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        if let Some(path) = default_config_path() {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        debug!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    pub fn apply(&mut self, o: Overrides) {
        self.verbose |= o.verbose;
        if let Some(v) = o.socket_timeout {
            self.socket_timeout = v;
        }
        if let Some(v) = o.maxthreads {
            self.maxthreads = v;
        }
        if o.hostfilepath.is_some() {
            self.hostfilepath = o.hostfilepath;
        }
        if let Some(v) = o.maxhostfileage {
            self.maxhostfileage = v;
        }
        if o.exclude.is_some() {
            self.exclude = o.exclude;
        }
        if o.include_only.is_some() {
            self.include_only = o.include_only;
        }
        if o.prefer.is_some() {
            self.prefer = o.prefer;
        }
        if o.no_downgrade_ftp {
            self.downgrade_ftp = false;
        }
    }

    pub fn validate(&self) -> Result<Policy> {
        if self.socket_timeout <= 0 {
            return Err(MirrorError::InvalidConfig(format!(
                "socket_timeout must be a positive number of seconds, got {}",
                self.socket_timeout
            )));
        }
        if self.maxthreads <= 0 {
            return Err(MirrorError::InvalidConfig(format!(
                "maxthreads must be at least 1, got {}",
                self.maxthreads
            )));
        }
        if self.maxhostfileage < 0 {
            return Err(MirrorError::InvalidConfig(format!(
                "maxhostfileage must not be negative, got {}",
                self.maxhostfileage
            )));
        }

        let prefer = self
            .prefer
            .as_deref()
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty());

        Ok(Policy {
            verbose: self.verbose,
            always_print_best_host: self.always_print_best_host,
            socket_timeout: Duration::from_secs(self.socket_timeout as u64),
            maxthreads: self.maxthreads as usize,
            hostfilepath: self
                .hostfilepath
                .clone()
                .unwrap_or_else(default_hostfile_path),
            maxhostfileage: Duration::from_secs((self.maxhostfileage as u64).saturating_mul(SECONDS_PER_DAY)),
            exclude: compile_patterns(self.exclude.as_deref())?,
            include_only: compile_patterns(self.include_only.as_deref())?,
            prefer,
            downgrade_ftp: self.downgrade_ftp,
        })
    }
}

/// Split a comma/space separated option into compiled patterns.
pub fn compile_patterns(raw: Option<&str>) -> Result<Vec<Regex>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|p| !p.is_empty())
        .map(|p| Regex::new(p).map_err(MirrorError::from))
        .collect()
}

pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "fastmirror").map(|dirs| dirs.config_dir().join("config.toml"))
}

pub fn default_hostfile_path() -> PathBuf {
    ProjectDirs::from("", "", "fastmirror")
        .map(|dirs| dirs.cache_dir().join("timedhosts.txt"))
        .unwrap_or_else(|| PathBuf::from(".").join("timedhosts.txt"))
}
