//! KDL pipeline definitions for Shipyard.
//!
//! This crate handles:
//! - Pipeline definitions (`shipyard.kdl`)
//! - Registry secret sources
//! - Variable interpolation

pub mod error;
pub mod pipeline;
pub mod secret;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::{
    DEFAULT_FILE, PipelineDefinition, PublishDefinition, RegistryAuth, RegistryDefinition,
    ScanDefinition, load_pipeline, parse_pipeline,
};
pub use secret::SecretSource;
pub use variables::{GitContext, VariableContext};
