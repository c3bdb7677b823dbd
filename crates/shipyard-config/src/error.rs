//! Configuration parsing errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("KDL parse error: {0}")]
    Parse(#[from] kdl::KdlError),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("duplicate definition: {0}")]
    Duplicate(String),

    #[error("secret for {registry} is unavailable: {message}")]
    MissingSecret { registry: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, message: impl ToString) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.to_string(),
        }
    }
}

impl From<ConfigError> for shipyard_core::Error {
    fn from(e: ConfigError) -> Self {
        shipyard_core::Error::Config(e.to_string())
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
