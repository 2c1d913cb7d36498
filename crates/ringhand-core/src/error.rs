use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Backoff settings already installed")]
    AlreadyInstalled,
}

pub type Result<T> = std::result::Result<T, ConfigError>;
