use thiserror::Error;

#[derive(Debug, Error)]
pub enum SateleError {
    #[error("config error: {0}")]
    Config(String),
    #[error("task source error: {0}")]
    TaskSource(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for SateleError {
    fn from(err: config::ConfigError) -> Self {
        SateleError::Config(err.to_string())
    }
}
