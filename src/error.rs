use thiserror::Error;

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("IO operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("System time error: {0}")]
    SystemTime(#[from] std::time::SystemTimeError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown mirrorlist format: {0}")]
    UnknownFormat(String),

    #[error("{0}")]
    Custom(String),
}

pub type Result<T> = std::result::Result<T, MirrorError>;
